//! LMDB-backed settings storage.
//!
//! One environment, two named databases: `settings` holds the native
//! settings engine's JSON values, `local` is a plain string area (legacy
//! blob, standalone legacy keys, and the fallback engine's prefixed keys
//! when no native engine is wanted).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lmdb::{Database, DatabaseFlags, Environment, Error as LmdbError, Transaction, WriteFlags};
use log::{info, warn};

use crate::settings_store::{SettingsEngine, SettingsMap, StringArea};
use crate::store_error::{StoreError, StoreResult};

const SETTINGS_DB: &str = "settings";
const LOCAL_DB: &str = "local";

/// The shared settings environment.
pub struct SettingsEnv {
    env: Environment,
    settings: Database,
    local: Database,
}

impl SettingsEnv {
    pub fn open(path: &Path, map_size: usize) -> StoreResult<Arc<Self>> {
        fs::create_dir_all(path)?;

        info!("Opening settings environment at {}", path.display());
        let env = Environment::new()
            .set_max_dbs(2)
            .set_map_size(map_size)
            .open(path)
            .map_err(|e| StoreError::Connection(format!("Failed to open {}: {e}", path.display())))?;

        let settings = env.create_db(Some(SETTINGS_DB), DatabaseFlags::empty())?;
        let local = env.create_db(Some(LOCAL_DB), DatabaseFlags::empty())?;
        Ok(Arc::new(Self { env, settings, local }))
    }

    fn read(&self, db: Database, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.env.begin_ro_txn()?;
        let value = match txn.get(db, &key) {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(LmdbError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(value)
    }
}

/// Native settings engine: each batch is a single LMDB transaction.
#[derive(Clone)]
pub struct LmdbSettingsEngine {
    env: Arc<SettingsEnv>,
}

impl LmdbSettingsEngine {
    pub fn new(env: Arc<SettingsEnv>) -> Self {
        Self { env }
    }

    pub fn open(path: &Path, map_size: usize) -> StoreResult<Self> {
        Ok(Self::new(SettingsEnv::open(path, map_size)?))
    }
}

#[async_trait]
impl SettingsEngine for LmdbSettingsEngine {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn get_many(&self, keys: &[&str]) -> StoreResult<SettingsMap> {
        let env = Arc::clone(&self.env);
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();

        tokio::task::spawn_blocking(move || -> StoreResult<SettingsMap> {
            let txn = env.env.begin_ro_txn()?;
            let mut result = SettingsMap::new();
            for key in keys {
                let bytes = match txn.get(env.settings, &key) {
                    Ok(bytes) => bytes,
                    Err(LmdbError::NotFound) => continue,
                    Err(e) => return Err(e.into()),
                };
                match serde_json::from_slice(bytes) {
                    Ok(value) => {
                        result.insert(key, value);
                    }
                    Err(e) => warn!("Ignoring malformed setting '{key}': {e}"),
                }
            }
            Ok(result)
        })
        .await?
    }

    async fn set_many(&self, items: SettingsMap) -> StoreResult<()> {
        let env = Arc::clone(&self.env);
        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            let bytes = serde_json::to_vec(&value)?;
            encoded.push((key, bytes));
        }

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut txn = env.env.begin_rw_txn()?;
            for (key, bytes) in &encoded {
                txn.put(env.settings, key, bytes, WriteFlags::empty())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn remove_many(&self, keys: &[&str]) -> StoreResult<()> {
        let env = Arc::clone(&self.env);
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut txn = env.env.begin_rw_txn()?;
            for key in &keys {
                match txn.del(env.settings, key, None) {
                    Ok(()) | Err(LmdbError::NotFound) => {}
                    Err(e) => return Err(StoreError::from(e)),
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }
}

/// Durable [`StringArea`] in the `local` database. Calls are synchronous;
/// async callers run them on the blocking pool.
#[derive(Clone)]
pub struct LmdbArea {
    env: Arc<SettingsEnv>,
}

impl LmdbArea {
    pub fn new(env: Arc<SettingsEnv>) -> Self {
        Self { env }
    }
}

impl StringArea for LmdbArea {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        let Some(bytes) = self.env.read(self.env.local, key)? else { return Ok(None) };
        match String::from_utf8(bytes) {
            Ok(text) => Ok(Some(text)),
            Err(_) => {
                warn!("Ignoring non-UTF-8 value under '{key}'");
                Ok(None)
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut txn = self.env.env.begin_rw_txn()?;
        txn.put(self.env.local, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        let mut txn = self.env.env.begin_rw_txn()?;
        match txn.del(self.env.local, &key, None) {
            Ok(()) | Err(LmdbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }
}
