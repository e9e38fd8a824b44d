//! Record model for entity collections.
//!
//! Every entity collection (notes, kanban tasks, transactions, ...) stores
//! [`EntityRecord`]s: a unique string identifier plus the record's domain
//! fields as arbitrary JSON. The storage layer only ever looks at the id
//! and at the fields named by secondary indexes; everything else is carried
//! through untouched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A single record of an entity collection.
///
/// The id is assigned once by the caller when the record is created and
/// never changes afterwards; it is the record's key in its collection.
/// All remaining fields are flattened next to it, so a record serializes
/// exactly like the object the application handed in:
///
/// ```rust
/// use workspace_store::local_db_model::EntityRecord;
/// use serde_json::json;
///
/// let note = EntityRecord::new("1", json!({
///     "projectId": "default",
///     "title": "x",
///     "content": "y",
///     "isFavorite": false,
/// }));
///
/// let text = serde_json::to_string(&note)?;
/// let back: EntityRecord = serde_json::from_str(&text)?;
/// assert_eq!(back.id, "1");
/// assert_eq!(back.field("title"), Some(&json!("x")));
/// # Ok::<(), serde_json::Error>(())
/// ```
///
/// Referential integrity (a note's `projectId` naming an existing project)
/// is the caller's concern; nothing here checks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Unique identifier, used as the key in the collection.
    pub id: String,

    /// Domain fields of the record.
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl EntityRecord {
    /// Builds a record from an id and a JSON object of fields.
    ///
    /// Non-object values yield a record with no fields. An `id` entry inside
    /// `fields` is dropped in favor of the explicit id.
    pub fn new(id: impl Into<String>, fields: JsonValue) -> Self {
        let mut fields = match fields {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        fields.remove("id");
        Self { id: id.into(), fields }
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    /// The text under which this record is filed in the index on `field`.
    ///
    /// Strings are used verbatim; other scalars use their JSON text. Records
    /// whose field is missing, null or structured are not indexed.
    pub fn index_value(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// An ordered, shared entity collection.
///
/// Collections are replaced, never mutated in place: a change produces a new
/// `Arc`, and pointer identity ([`Arc::ptr_eq`]) is how the orchestrator
/// detects that a collection changed. Mutating through `Arc::get_mut` or
/// interior tricks on a collection that is already part of a persisted
/// snapshot bypasses change detection and the write is silently missed.
pub type Collection = Arc<Vec<EntityRecord>>;

/// Builds a fresh collection (a new reference) from records.
pub fn collection(records: Vec<EntityRecord>) -> Collection {
    Arc::new(records)
}

/// Returns a new collection with `record` upserted by id.
///
/// This is the immutable-update helper callers should use: it always yields
/// a new reference, so the change is picked up by diffing.
pub fn with_upserted(current: &Collection, record: EntityRecord) -> Collection {
    let mut records: Vec<EntityRecord> = current.as_ref().clone();
    match records.iter_mut().find(|existing| existing.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
    Arc::new(records)
}

/// Returns a new collection without the record carrying `id`.
pub fn without_record(current: &Collection, id: &str) -> Collection {
    Arc::new(current.iter().filter(|record| record.id != id).cloned().collect())
}

/// Decodes a JSON array into records, skipping entries that are not valid
/// records (missing or non-string id). Returns the records and the number
/// of skipped entries.
pub fn records_from_json(items: &[JsonValue]) -> (Vec<EntityRecord>, usize) {
    let mut records = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        match serde_json::from_value::<EntityRecord>(item.clone()) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    (records, skipped)
}
