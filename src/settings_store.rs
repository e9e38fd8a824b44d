//! Key/value settings backend.
//!
//! Settings are small JSON values read and written whole. Two engines can
//! hold them, chosen once at startup and injected into [`SettingsStore`]:
//!
//! - a native engine with a batch primitive (the LMDB engine in
//!   [`crate::lmdb_settings`]);
//! - a fallback over a plain string area ([`StringArea`]) that namespaces
//!   keys with a prefix and stores values as JSON text.
//!
//! Malformed stored values read as absent. Absent keys are omitted from
//! batched reads rather than reported as null.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::store_error::StoreResult;

/// A partial settings map: only keys that are present.
pub type SettingsMap = Map<String, JsonValue>;

/// Engine strategy behind [`SettingsStore`].
#[async_trait]
pub trait SettingsEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_many(&self, keys: &[&str]) -> StoreResult<SettingsMap>;

    async fn set_many(&self, items: SettingsMap) -> StoreResult<()>;

    async fn remove_many(&self, keys: &[&str]) -> StoreResult<()>;
}

/// A synchronous string key/value area, the shape of a page-local storage.
///
/// The legacy blob and its companion keys are read from here without any
/// prefix; [`PrefixedAreaEngine`] stores settings here under its prefix.
pub trait StringArea: Send + Sync {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove_item(&self, key: &str) -> StoreResult<()>;
}

/// In-process [`StringArea`].
#[derive(Debug, Default)]
pub struct MemoryArea {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the area, e.g. with a legacy blob.
    pub fn with_item(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items().insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StringArea for MemoryArea {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        self.items().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        self.items().remove(key);
        Ok(())
    }
}

/// Fallback engine: settings as JSON text in a [`StringArea`], each key
/// namespaced with `prefix` so unrelated data in the area is never touched.
pub struct PrefixedAreaEngine {
    area: Arc<dyn StringArea>,
    prefix: String,
}

impl PrefixedAreaEngine {
    pub fn new(area: Arc<dyn StringArea>, prefix: impl Into<String>) -> Self {
        Self { area, prefix: prefix.into() }
    }

    fn area_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl SettingsEngine for PrefixedAreaEngine {
    fn name(&self) -> &'static str {
        "string-area"
    }

    async fn get_many(&self, keys: &[&str]) -> StoreResult<SettingsMap> {
        let area = Arc::clone(&self.area);
        let keys: Vec<(String, String)> =
            keys.iter().map(|key| (key.to_string(), self.area_key(key))).collect();

        tokio::task::spawn_blocking(move || -> StoreResult<SettingsMap> {
            let mut result = SettingsMap::new();
            for (key, area_key) in keys {
                let Some(raw) = area.get_item(&area_key)? else { continue };
                match serde_json::from_str(&raw) {
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
        let area = Arc::clone(&self.area);
        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in &items {
            encoded.push((self.area_key(key), serde_json::to_string(value)?));
        }

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            for (area_key, text) in encoded {
                area.set_item(&area_key, &text)?;
            }
            Ok(())
        })
        .await?
    }

    async fn remove_many(&self, keys: &[&str]) -> StoreResult<()> {
        let area = Arc::clone(&self.area);
        let keys: Vec<String> = keys.iter().map(|key| self.area_key(key)).collect();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            for area_key in keys {
                area.remove_item(&area_key)?;
            }
            Ok(())
        })
        .await?
    }
}

/// The settings backend handed to the orchestrator.
#[derive(Clone)]
pub struct SettingsStore {
    engine: Arc<dyn SettingsEngine>,
}

impl SettingsStore {
    pub fn new(engine: Arc<dyn SettingsEngine>) -> Self {
        Self { engine }
    }

    /// Picks the engine once: the native one when the environment offers
    /// it, the string-area fallback otherwise.
    pub fn select(
        native: Option<Arc<dyn SettingsEngine>>,
        fallback: impl FnOnce() -> Arc<dyn SettingsEngine>,
    ) -> Self {
        let engine = native.unwrap_or_else(fallback);
        info!("Settings engine: {}", engine.name());
        Self { engine }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<JsonValue>> {
        let mut found = self.engine.get_many(&[key]).await?;
        Ok(found.remove(key))
    }

    /// Typed read. A stored value that does not decode as `T` reads as
    /// absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(value) = self.get(key).await? else { return Ok(None) };
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                warn!("Ignoring malformed setting '{key}': {e}");
                Ok(None)
            }
        }
    }

    pub async fn get_many(&self, keys: &[&str]) -> StoreResult<SettingsMap> {
        if keys.is_empty() {
            return Ok(SettingsMap::new());
        }
        self.engine.get_many(keys).await
    }

    pub async fn set(&self, key: &str, value: JsonValue) -> StoreResult<()> {
        let mut items = SettingsMap::new();
        items.insert(key.to_string(), value);
        self.engine.set_many(items).await
    }

    /// Typed write. Serialization failures propagate.
    pub async fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        self.set(key, serde_json::to_value(value)?).await
    }

    pub async fn set_many(&self, items: SettingsMap) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.engine.set_many(items).await
    }

    pub async fn remove(&self, key: &str) -> StoreResult<()> {
        self.engine.remove_many(&[key]).await
    }

    pub async fn remove_many(&self, keys: &[&str]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.engine.remove_many(keys).await
    }
}
