//! Storage configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::store_error::{StoreError, StoreResult};

/// Default debounce window between the last queued change and the flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default LMDB map size (256 MiB).
pub const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;

/// Namespacing prefix used by the string-area settings engine.
pub const DEFAULT_SETTINGS_PREFIX: &str = "dcc_";

/// Key under which the legacy single-blob format was stored.
pub const DEFAULT_LEGACY_KEY: &str = "devCommandCenter";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory. Entities live in `<path>/entities`, settings in
    /// `<path>/settings`.
    pub path: PathBuf,

    /// LMDB map size in bytes, applied to both environments.
    pub map_size: usize,

    /// Debounce window for queued writes.
    pub debounce: Duration,

    /// Prefix prepended to every key written through the string-area engine.
    pub settings_prefix: String,

    /// String-area key holding the legacy blob.
    pub legacy_key: String,

    /// Store settings in the native LMDB settings database. When off,
    /// settings go through the prefixed string-area engine instead.
    pub native_settings: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("workspace_data"),
            map_size: DEFAULT_MAP_SIZE,
            debounce: DEFAULT_DEBOUNCE,
            settings_prefix: DEFAULT_SETTINGS_PREFIX.to_string(),
            legacy_key: DEFAULT_LEGACY_KEY.to_string(),
            native_settings: true,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_settings_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings_prefix = prefix.into();
        self
    }

    pub fn with_legacy_key(mut self, key: impl Into<String>) -> Self {
        self.legacy_key = key.into();
        self
    }

    pub fn with_native_settings(mut self, native: bool) -> Self {
        self.native_settings = native;
        self
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.path.join("entities")
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.path.join("settings")
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] naming the first offending value.
    pub fn validate(&self) -> StoreResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::Validation("path must not be empty".to_string()));
        }

        if self.map_size == 0 {
            return Err(StoreError::Validation("map_size must be greater than 0".to_string()));
        }

        if self.debounce.is_zero() {
            return Err(StoreError::Validation("debounce must be greater than 0".to_string()));
        }

        if self.legacy_key.is_empty() {
            return Err(StoreError::Validation("legacy_key must not be empty".to_string()));
        }

        Ok(())
    }
}
