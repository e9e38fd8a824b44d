//! LMDB-backed entity database.
//!
//! One LMDB environment holds a named database per collection, a named
//! database per declared secondary index (`<collection>#<field>`), and a
//! `meta` database carrying the schema version. Record writes and their
//! index maintenance share a single write transaction.
//!
//! The environment handle is opened lazily and shared. Its lifecycle is
//! closed → opening → open; concurrent callers during "opening" await the
//! same attempt, and losing the environment (or calling [`EntityDb::close`])
//! returns it to closed so the next call opens it again.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, Error as LmdbError, RwTransaction,
    Transaction, WriteFlags,
};
use lmdb_sys::{MDB_FIRST, MDB_NEXT, MDB_SET_RANGE};
use log::{info, warn};

use crate::entity_backend::{require_id, require_schema, EntityBackend, MAX_ID_BYTES};
use crate::local_db_model::{Collection, EntityRecord};
use crate::schema::{self, IndexDef, StoreSchema, SCHEMA_VERSION, STORE_SCHEMAS};
use crate::store_error::{StoreError, StoreResult};

const META_DB: &str = "meta";
const SCHEMA_VERSION_KEY: &str = "schemaVersion";
const INDEX_SEPARATOR: char = '\0';

/// LMDB's compiled-in key limit.
const MAX_KEY_BYTES: usize = 511;

/// Bytes of an index value that make it into the index key. Longer values
/// share a truncated key and are told apart by re-reading the record.
const MAX_INDEXED_VALUE_BYTES: usize = MAX_KEY_BYTES - 1 - MAX_ID_BYTES;

struct StoreDbs {
    schema: &'static StoreSchema,
    records: Database,
    indexes: Vec<(IndexDef, Database)>,
}

/// An open environment with every declared database resolved.
pub(crate) struct EntityEnv {
    env: Environment,
    stores: HashMap<&'static str, StoreDbs>,
}

type OpenAttempt = Shared<BoxFuture<'static, Result<Arc<EntityEnv>, Arc<StoreError>>>>;

enum ConnState {
    Closed,
    Opening(OpenAttempt),
    Open(Arc<EntityEnv>),
}

/// Durable [`EntityBackend`] over LMDB.
pub struct EntityDb {
    path: PathBuf,
    map_size: usize,
    state: Mutex<ConnState>,
    open_attempts: AtomicUsize,
}

impl EntityDb {
    /// Creates the handle without touching the disk; the environment is
    /// opened by the first operation.
    pub fn new(path: impl Into<PathBuf>, map_size: usize) -> Self {
        Self {
            path: path.into(),
            map_size,
            state: Mutex::new(ConnState::Closed),
            open_attempts: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state(), ConnState::Open(_))
    }

    /// Number of times the environment has been (re)opened.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Opens the environment now instead of on first use.
    pub async fn open(&self) -> StoreResult<()> {
        self.connection().await.map(|_| ())
    }

    /// Drops the shared handle. In-flight operations finish on the handle
    /// they already hold; the next call reopens.
    pub fn close(&self) {
        let mut state = self.state();
        if !matches!(*state, ConnState::Closed) {
            info!("Closing entity environment at {}", self.path.display());
        }
        *state = ConnState::Closed;
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connection(&self) -> StoreResult<Arc<EntityEnv>> {
        let attempt = {
            let mut state = self.state();
            match &*state {
                ConnState::Open(env) => return Ok(Arc::clone(env)),
                ConnState::Opening(attempt) => attempt.clone(),
                ConnState::Closed => {
                    self.open_attempts.fetch_add(1, Ordering::SeqCst);
                    let attempt = open_attempt(self.path.clone(), self.map_size);
                    *state = ConnState::Opening(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.await;

        let mut state = self.state();
        match result {
            Ok(env) => {
                if matches!(*state, ConnState::Opening(_)) {
                    *state = ConnState::Open(Arc::clone(&env));
                }
                Ok(env)
            }
            Err(err) => {
                if matches!(*state, ConnState::Opening(_)) {
                    *state = ConnState::Closed;
                }
                Err(StoreError::from_shared(&err))
            }
        }
    }

    /// Runs `op` against the environment on the blocking pool.
    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&EntityEnv) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let env = self.connection().await?;
        let result = tokio::task::spawn_blocking(move || op(&env)).await?;

        if let Err(err) = &result {
            if err.is_connection() {
                warn!("Entity environment lost, will reopen on next call: {err}");
                self.close();
            }
        }
        result
    }
}

fn open_attempt(path: PathBuf, map_size: usize) -> OpenAttempt {
    async move {
        tokio::task::spawn_blocking(move || EntityEnv::open(&path, map_size))
            .await
            .map_err(StoreError::from)
            .and_then(|opened| opened)
            .map(Arc::new)
            .map_err(Arc::new)
    }
    .boxed()
    .shared()
}

impl EntityEnv {
    fn open(path: &Path, map_size: usize) -> StoreResult<Self> {
        fs::create_dir_all(path)?;

        info!("Opening entity environment at {}", path.display());
        let env = Environment::new()
            .set_max_dbs(schema::required_db_count())
            .set_map_size(map_size)
            .open(path)
            .map_err(|e| StoreError::Connection(format!("Failed to open {}: {e}", path.display())))?;

        let meta = env.create_db(Some(META_DB), DatabaseFlags::empty())?;
        let stored_version = read_schema_version(&env, meta)?;

        // create_db is a no-op for databases that already exist, so this
        // both creates a fresh schema and fills in anything a newer
        // version added.
        let mut stores = HashMap::with_capacity(STORE_SCHEMAS.len());
        for store in STORE_SCHEMAS {
            let records = env.create_db(Some(store.name), DatabaseFlags::empty())?;
            let mut indexes = Vec::with_capacity(store.indexes.len());
            for idx in store.indexes {
                let name = schema::index_db_name(store.name, idx.field);
                indexes.push((*idx, env.create_db(Some(name.as_str()), DatabaseFlags::empty())?));
            }
            stores.insert(store.name, StoreDbs { schema: store, records, indexes });
        }

        if stored_version != Some(SCHEMA_VERSION) {
            let mut txn = env.begin_rw_txn()?;
            txn.put(meta, &SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string(), WriteFlags::empty())?;
            txn.commit()?;
            info!("Entity schema at version {SCHEMA_VERSION} (was {stored_version:?})");
        }

        Ok(Self { env, stores })
    }

    fn dbs(&self, store: &str) -> StoreResult<&StoreDbs> {
        self.stores.get(store).ok_or_else(|| StoreError::unknown_collection(store))
    }

    fn read_all(&self, store: &str) -> StoreResult<Vec<EntityRecord>> {
        let dbs = self.dbs(store)?;
        let txn = self.env.begin_ro_txn()?;
        let cursor = txn.open_ro_cursor(dbs.records)?;

        let mut records = Vec::new();
        walk(&cursor, None, |key, value| {
            match serde_json::from_slice::<EntityRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping malformed record '{}' in '{store}': {e}",
                    String::from_utf8_lossy(key)
                ),
            }
            true
        })?;
        Ok(records)
    }

    fn find(&self, store: &str, field: &str, value: &str) -> StoreResult<Vec<EntityRecord>> {
        let dbs = self.dbs(store)?;
        let Some((_, index_db)) = dbs.indexes.iter().find(|(idx, _)| idx.field == field) else {
            return Err(StoreError::Validation(format!(
                "Collection '{store}' has no index on '{field}'"
            )));
        };

        let txn = self.env.begin_ro_txn()?;
        indexed_records(&txn, dbs, *index_db, field, value)
    }

    fn put(&self, store: &str, record: &EntityRecord) -> StoreResult<()> {
        let dbs = self.dbs(store)?;
        let mut txn = self.env.begin_rw_txn()?;
        write_record(&mut txn, dbs, record, true)?;
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, store: &str, id: &str) -> StoreResult<()> {
        let dbs = self.dbs(store)?;
        let mut txn = self.env.begin_rw_txn()?;
        if let Some(previous) = load_record(&txn, dbs.records, id)? {
            unindex_record(&mut txn, dbs, &previous)?;
            txn.del(dbs.records, &id, None)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn replace_all(&self, store: &str, records: &[EntityRecord]) -> StoreResult<()> {
        let dbs = self.dbs(store)?;
        let mut txn = self.env.begin_rw_txn()?;
        clear_store(&mut txn, dbs)?;
        // A repeated id replaces its earlier copy, index entries included.
        for record in records {
            write_record(&mut txn, dbs, record, true)?;
        }
        // Dropping the transaction on any error above aborts it, leaving
        // the previous contents in place.
        txn.commit()?;
        Ok(())
    }

    fn clear(&self, stores: &[&str]) -> StoreResult<()> {
        let mut txn = self.env.begin_rw_txn()?;
        for store in stores {
            clear_store(&mut txn, self.dbs(store)?)?;
        }
        txn.commit()?;
        Ok(())
    }
}

fn read_schema_version(env: &Environment, meta: Database) -> StoreResult<Option<u32>> {
    let txn = env.begin_ro_txn()?;
    let version = match txn.get(meta, &SCHEMA_VERSION_KEY) {
        Ok(bytes) => String::from_utf8_lossy(bytes).parse::<u32>().ok(),
        Err(LmdbError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(version)
}

fn load_record<T: Transaction>(txn: &T, db: Database, id: &str) -> StoreResult<Option<EntityRecord>> {
    match txn.get(db, &id) {
        Ok(bytes) => Ok(serde_json::from_slice(bytes).ok()),
        Err(LmdbError::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Visits entries in key order from the first key `>= start` (or the
/// first key) until `visit` returns false.
fn walk<'txn, C, F>(cursor: &C, start: Option<&[u8]>, mut visit: F) -> StoreResult<()>
where
    C: Cursor<'txn>,
    F: FnMut(&'txn [u8], &'txn [u8]) -> bool,
{
    let mut step = match start {
        Some(key) => cursor.get(Some(key), None, MDB_SET_RANGE),
        None => cursor.get(None, None, MDB_FIRST),
    };
    loop {
        match step {
            Ok((Some(key), value)) => {
                if !visit(key, value) {
                    return Ok(());
                }
            }
            Ok((None, _)) | Err(LmdbError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        step = cursor.get(None, None, MDB_NEXT);
    }
}

/// `value` cut to the indexed length on a char boundary, plus the separator.
fn index_prefix(value: &str) -> String {
    let mut end = value.len().min(MAX_INDEXED_VALUE_BYTES);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{INDEX_SEPARATOR}", &value[..end])
}

fn index_key(value: &str, id: &str) -> String {
    let mut key = index_prefix(value);
    key.push_str(id);
    key
}

/// Ids filed under the key prefix of `value` in one index database.
fn index_ids<T: Transaction>(txn: &T, db: Database, value: &str) -> StoreResult<Vec<String>> {
    let prefix = index_prefix(value);
    let cursor = txn.open_ro_cursor(db)?;
    let mut ids = Vec::new();
    walk(&cursor, Some(prefix.as_bytes()), |key, id| {
        if !key.starts_with(prefix.as_bytes()) {
            return false;
        }
        ids.push(String::from_utf8_lossy(id).into_owned());
        true
    })?;
    Ok(ids)
}

/// Records whose `field` equals `value`. Candidates come from the index and
/// are checked against the stored record, which filters out truncated-key
/// collisions.
fn indexed_records<T: Transaction>(
    txn: &T,
    dbs: &StoreDbs,
    index_db: Database,
    field: &str,
    value: &str,
) -> StoreResult<Vec<EntityRecord>> {
    let ids = index_ids(txn, index_db, value)?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        match load_record(txn, dbs.records, &id)? {
            Some(record) if record.index_value(field).as_deref() == Some(value) => records.push(record),
            Some(_) => {}
            None => warn!(
                "Index '{}#{field}' points at missing or unreadable '{id}'",
                dbs.schema.name
            ),
        }
    }
    Ok(records)
}

fn write_record(
    txn: &mut RwTransaction,
    dbs: &StoreDbs,
    record: &EntityRecord,
    replace_existing: bool,
) -> StoreResult<()> {
    require_id(record)?;

    if replace_existing {
        if let Some(previous) = load_record(&*txn, dbs.records, &record.id)? {
            unindex_record(txn, dbs, &previous)?;
        }
    }

    for (idx, db) in &dbs.indexes {
        let Some(value) = record.index_value(idx.field) else { continue };
        if idx.unique {
            let holders = indexed_records(&*txn, dbs, *db, idx.field, &value)?;
            if holders.iter().any(|holder| holder.id != record.id) {
                return Err(StoreError::Validation(format!(
                    "Unique index '{}.{}' already holds '{value}'",
                    dbs.schema.name, idx.field
                )));
            }
        }
        txn.put(*db, &index_key(&value, &record.id), &record.id, WriteFlags::empty())?;
    }

    let bytes = serde_json::to_vec(record)?;
    txn.put(dbs.records, &record.id, &bytes, WriteFlags::empty())?;
    Ok(())
}

fn unindex_record(txn: &mut RwTransaction, dbs: &StoreDbs, record: &EntityRecord) -> StoreResult<()> {
    for (idx, db) in &dbs.indexes {
        let Some(value) = record.index_value(idx.field) else { continue };
        match txn.del(*db, &index_key(&value, &record.id), None) {
            Ok(()) | Err(LmdbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn clear_store(txn: &mut RwTransaction, dbs: &StoreDbs) -> StoreResult<()> {
    txn.clear_db(dbs.records)?;
    for (_, db) in &dbs.indexes {
        txn.clear_db(*db)?;
    }
    Ok(())
}

#[async_trait]
impl EntityBackend for EntityDb {
    async fn get_all(&self, store: &str) -> StoreResult<Vec<EntityRecord>> {
        let name = require_schema(store)?.name;
        match self.run(move |env| env.read_all(name)).await {
            Ok(records) => Ok(records),
            Err(err) if err.is_connection() => Err(err),
            Err(err) => {
                warn!("Reading '{name}' failed, treating it as empty: {err}");
                Ok(Vec::new())
            }
        }
    }

    async fn put(&self, store: &str, record: EntityRecord) -> StoreResult<()> {
        let name = require_schema(store)?.name;
        self.run(move |env| env.put(name, &record)).await
    }

    async fn delete(&self, store: &str, id: &str) -> StoreResult<()> {
        let name = require_schema(store)?.name;
        let id = id.to_string();
        self.run(move |env| env.delete(name, &id)).await
    }

    async fn replace_all(&self, store: &str, records: Collection) -> StoreResult<()> {
        let name = require_schema(store)?.name;
        self.run(move |env| env.replace_all(name, &records)).await
    }

    async fn clear(&self, store: &str) -> StoreResult<()> {
        let name = require_schema(store)?.name;
        self.run(move |env| env.clear(&[name])).await
    }

    async fn clear_all(&self) -> StoreResult<()> {
        let names: Vec<&'static str> = schema::store_names().collect();
        self.run(move |env| env.clear(&names)).await
    }

    async fn find_by_index(
        &self,
        store: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<EntityRecord>> {
        let name = require_schema(store)?.name;
        let (field, value) = (field.to_string(), value.to_string());
        self.run(move |env| env.find(name, &field, &value)).await
    }
}
