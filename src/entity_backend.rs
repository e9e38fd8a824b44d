//! The multi-collection entity backend interface.
//!
//! [`EntityBackend`] is the seam between the orchestrator and whatever
//! engine holds entity collections. [`crate::local_db_state::EntityDb`] is
//! the durable LMDB implementation; [`MemoryEntityBackend`] keeps the same
//! semantics in process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::local_db_model::{Collection, EntityRecord};
use crate::schema::{schema_for, StoreSchema, STORE_SCHEMAS};
use crate::store_error::{StoreError, StoreResult};

/// Asynchronous access to the declared entity collections.
///
/// Every operation is scoped to one collection except [`clear_all`].
/// Collection names outside [`STORE_SCHEMAS`] are rejected with
/// [`StoreError::Validation`].
///
/// [`clear_all`]: EntityBackend::clear_all
#[async_trait]
pub trait EntityBackend: Send + Sync {
    /// Every record of the collection, in no particular order.
    ///
    /// Implementations degrade read failures to an empty result and only
    /// return an error when the collection name is unknown or the engine
    /// cannot be reached at all.
    async fn get_all(&self, store: &str) -> StoreResult<Vec<EntityRecord>>;

    /// Upsert by record id.
    async fn put(&self, store: &str, record: EntityRecord) -> StoreResult<()>;

    /// Remove by id. Absent ids are a no-op.
    async fn delete(&self, store: &str, id: &str) -> StoreResult<()>;

    /// Clear the collection and write `records` as its complete contents in
    /// one unit of work: readers observe either the old or the new contents.
    async fn replace_all(&self, store: &str, records: Collection) -> StoreResult<()>;

    async fn clear(&self, store: &str) -> StoreResult<()>;

    /// Empty every declared collection in one unit of work.
    async fn clear_all(&self) -> StoreResult<()>;

    /// Records whose indexed `field` equals `value`.
    async fn find_by_index(
        &self,
        store: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<EntityRecord>>;
}

pub(crate) fn require_schema(store: &str) -> StoreResult<&'static StoreSchema> {
    schema_for(store).ok_or_else(|| StoreError::unknown_collection(store))
}

/// Longest accepted record id, in bytes.
pub const MAX_ID_BYTES: usize = 255;

pub(crate) fn require_id(record: &EntityRecord) -> StoreResult<()> {
    if record.id.is_empty() {
        return Err(StoreError::Validation("Record id must not be empty".to_string()));
    }
    if record.id.len() > MAX_ID_BYTES {
        return Err(StoreError::Validation(format!(
            "Record id is {} bytes, the limit is {MAX_ID_BYTES}",
            record.id.len()
        )));
    }
    Ok(())
}

/// Checks the unique indexes of `schema` over a full set of records.
pub(crate) fn check_unique<'a>(
    schema: &StoreSchema,
    records: impl IntoIterator<Item = &'a EntityRecord>,
) -> StoreResult<()> {
    let unique: Vec<_> = schema.indexes.iter().filter(|idx| idx.unique).collect();
    if unique.is_empty() {
        return Ok(());
    }

    let mut seen: HashMap<(&str, String), &str> = HashMap::new();
    for record in records {
        for idx in &unique {
            let Some(value) = record.index_value(idx.field) else { continue };
            if let Some(owner) = seen.insert((idx.field, value.clone()), record.id.as_str()) {
                if owner != record.id {
                    return Err(StoreError::Validation(format!(
                        "Unique index '{}.{}' already holds '{value}'",
                        schema.name, idx.field
                    )));
                }
            }
        }
    }
    Ok(())
}

type Table = BTreeMap<String, EntityRecord>;

/// In-process entity backend with the same contract as the LMDB one.
#[derive(Debug)]
pub struct MemoryEntityBackend {
    tables: Mutex<HashMap<&'static str, Table>>,
}

impl Default for MemoryEntityBackend {
    fn default() -> Self {
        let tables = STORE_SCHEMAS.iter().map(|schema| (schema.name, Table::new())).collect();
        Self { tables: Mutex::new(tables) }
    }
}

impl MemoryEntityBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<&'static str, Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EntityBackend for MemoryEntityBackend {
    async fn get_all(&self, store: &str) -> StoreResult<Vec<EntityRecord>> {
        let schema = require_schema(store)?;
        let tables = self.tables();
        Ok(tables.get(schema.name).map(|t| t.values().cloned().collect()).unwrap_or_default())
    }

    async fn put(&self, store: &str, record: EntityRecord) -> StoreResult<()> {
        let schema = require_schema(store)?;
        require_id(&record)?;
        let mut tables = self.tables();
        let table = tables.entry(schema.name).or_default();
        check_unique(
            schema,
            table.values().filter(|existing| existing.id != record.id).chain([&record]),
        )?;
        table.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, store: &str, id: &str) -> StoreResult<()> {
        let schema = require_schema(store)?;
        if let Some(table) = self.tables().get_mut(schema.name) {
            table.remove(id);
        }
        Ok(())
    }

    async fn replace_all(&self, store: &str, records: Collection) -> StoreResult<()> {
        let schema = require_schema(store)?;
        for record in records.iter() {
            require_id(record)?;
        }
        check_unique(schema, records.iter())?;

        let table: Table = records.iter().map(|r| (r.id.clone(), r.clone())).collect();
        self.tables().insert(schema.name, table);
        Ok(())
    }

    async fn clear(&self, store: &str) -> StoreResult<()> {
        let schema = require_schema(store)?;
        self.tables().insert(schema.name, Table::new());
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        let mut tables = self.tables();
        for table in tables.values_mut() {
            table.clear();
        }
        Ok(())
    }

    async fn find_by_index(
        &self,
        store: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<EntityRecord>> {
        let schema = require_schema(store)?;
        if schema.index(field).is_none() {
            return Err(StoreError::Validation(format!(
                "Collection '{store}' has no index on '{field}'"
            )));
        }

        let tables = self.tables();
        Ok(tables
            .get(schema.name)
            .map(|table| {
                table
                    .values()
                    .filter(|record| record.index_value(field).as_deref() == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
