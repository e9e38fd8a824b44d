//! Static registry of entity collections.
//!
//! This table is the only place collections are declared. Database
//! creation, index maintenance, state reconstruction and the diff pass
//! all iterate it.

/// Version stamped into the metadata database. Evolution is additive:
/// bumping it creates missing collections and indexes, it never drops any.
pub const SCHEMA_VERSION: u32 = 1;

/// Every record is keyed by this field.
pub const KEY_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub field: &'static str,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSchema {
    pub name: &'static str,
    pub key_field: &'static str,
    pub indexes: &'static [IndexDef],
}

impl StoreSchema {
    pub fn index(&self, field: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.field == field)
    }
}

const fn idx(field: &'static str) -> IndexDef {
    IndexDef { field, unique: false }
}

const fn store(name: &'static str, indexes: &'static [IndexDef]) -> StoreSchema {
    StoreSchema { name, key_field: KEY_FIELD, indexes }
}

const BY_PROJECT: &[IndexDef] = &[idx("projectId")];

pub const STORE_SCHEMAS: &[StoreSchema] = &[
    store("notes", BY_PROJECT),
    store("prompts", BY_PROJECT),
    store("snippets", BY_PROJECT),
    store("cheatsheet", &[idx("projectId"), idx("category")]),
    store("kanban", &[idx("projectId"), idx("column")]),
    store("passwords", BY_PROJECT),
    store("bookmarks", &[idx("projectId"), idx("category")]),
    store("diary", &[idx("date"), idx("projetoId")]),
    store("contacts", BY_PROJECT),
    store("checklists", BY_PROJECT),
    store("financialAccounts", BY_PROJECT),
    store("financialCategories", &[idx("projectId"), idx("type")]),
    store("financialBudgets", &[idx("projectId"), idx("month")]),
    store("financialTransactions", &[idx("projectId"), idx("date"), idx("categoryId")]),
    store("wellnessBreaks", &[idx("dataHora")]),
    store("gamificationHistory", &[idx("timestamp"), idx("tipo")]),
    store("budgets", &[idx("projectId"), idx("status")]),
    store("serviceCatalog", &[]),
    store("stockMaterials", &[]),
    store("techSheets", BY_PROJECT),
];

pub fn schema_for(name: &str) -> Option<&'static StoreSchema> {
    STORE_SCHEMAS.iter().find(|schema| schema.name == name)
}

pub fn store_names() -> impl Iterator<Item = &'static str> {
    STORE_SCHEMAS.iter().map(|schema| schema.name)
}

/// Name of the LMDB database backing one secondary index.
pub fn index_db_name(store: &str, field: &str) -> String {
    format!("{store}#{field}")
}

/// Total number of named databases the entity environment needs:
/// one per collection, one per index, and the metadata database.
pub fn required_db_count() -> u32 {
    let indexes: usize = STORE_SCHEMAS.iter().map(|schema| schema.indexes.len()).sum();
    (STORE_SCHEMAS.len() + indexes + 1) as u32
}
