//! The storage orchestrator.
//!
//! [`StorageService`] is the only consumer of the two backends. It rebuilds
//! [`AppState`] on startup, turns every state transition into queued
//! writes, flushes them on a debounce timer, restores full backups and
//! runs the one-time legacy migration.
//!
//! Queued writes are last-writer-wins per collection and per settings key.
//! A flush drains the queue, then issues every collection replace and one
//! batched settings write concurrently. Flushes never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::Value as JsonValue;

use crate::app_state::{
    keys, load_keys, AppState, GamificationCore, DEFAULT_PROJECT_ID, DEFAULT_THEME, SETTINGS_MAP,
};
use crate::config::StorageConfig;
use crate::debounce::Debouncer;
use crate::entity_backend::{require_schema, EntityBackend, MemoryEntityBackend};
use crate::lmdb_settings::{LmdbArea, LmdbSettingsEngine, SettingsEnv};
use crate::local_db_model::{collection, Collection, EntityRecord};
use crate::local_db_state::EntityDb;
use crate::migration::{self, MigrationOutcome};
use crate::schema::STORE_SCHEMAS;
use crate::settings_store::{
    MemoryArea, PrefixedAreaEngine, SettingsEngine, SettingsMap, SettingsStore, StringArea,
};
use crate::store_error::{StoreError, StoreResult};

/// Result of [`StorageService::load_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedData {
    pub state: AppState,
    pub current_project: String,
    pub theme: String,
}

/// Loose settings restored alongside a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportExtras {
    pub theme: Option<String>,
    pub current_project: Option<String>,
}

#[derive(Default)]
struct PendingWrites {
    entities: HashMap<&'static str, Collection>,
    settings: SettingsMap,
}

impl PendingWrites {
    fn len(&self) -> usize {
        self.entities.len() + self.settings.len()
    }

    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.settings.is_empty()
    }
}

struct Inner {
    entities: Arc<dyn EntityBackend>,
    settings: SettingsStore,
    legacy_area: Arc<dyn StringArea>,
    config: StorageConfig,
    debouncer: Debouncer,
    pending: Mutex<PendingWrites>,
    flush_gate: tokio::sync::Mutex<()>,
}

/// Cloneable handle to one storage orchestrator.
#[derive(Clone)]
pub struct StorageService {
    inner: Arc<Inner>,
}

impl StorageService {
    /// Builds the orchestrator over injected backends. `legacy_area` is
    /// where the legacy blob and its companion keys are read from.
    pub fn new(
        entities: Arc<dyn EntityBackend>,
        settings: SettingsStore,
        legacy_area: Arc<dyn StringArea>,
        config: StorageConfig,
    ) -> Self {
        let debouncer = Debouncer::new(config.debounce);
        Self {
            inner: Arc::new(Inner {
                entities,
                settings,
                legacy_area,
                config,
                debouncer,
                pending: Mutex::new(PendingWrites::default()),
                flush_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Opens the durable stack under `config.path`: the LMDB entity
    /// database, the LMDB string area and, unless
    /// [`StorageConfig::native_settings`] is off, the LMDB settings engine.
    pub async fn open(config: StorageConfig) -> StoreResult<Self> {
        config.validate()?;

        let entities = EntityDb::new(config.entities_dir(), config.map_size);
        entities.open().await?;

        let settings_dir = config.settings_dir();
        let map_size = config.map_size;
        let env = tokio::task::spawn_blocking(move || SettingsEnv::open(&settings_dir, map_size))
            .await??;

        let area: Arc<dyn StringArea> = Arc::new(LmdbArea::new(Arc::clone(&env)));
        let native = config
            .native_settings
            .then(|| -> Arc<dyn SettingsEngine> { Arc::new(LmdbSettingsEngine::new(env)) });
        let prefix = config.settings_prefix.clone();
        let fallback_area = Arc::clone(&area);
        let settings = SettingsStore::select(native, move || -> Arc<dyn SettingsEngine> {
            Arc::new(PrefixedAreaEngine::new(fallback_area, prefix))
        });

        info!("Storage opened at {}", config.path.display());
        Ok(Self::new(Arc::new(entities), settings, area, config))
    }

    /// A non-durable orchestrator: in-process entity backend and the
    /// string-area settings engine over an in-process area.
    pub fn in_memory(config: StorageConfig) -> Self {
        let area: Arc<dyn StringArea> = Arc::new(MemoryArea::new());
        let engine = PrefixedAreaEngine::new(Arc::clone(&area), config.settings_prefix.clone());
        let settings = SettingsStore::new(Arc::new(engine));
        Self::new(Arc::new(MemoryEntityBackend::new()), settings, area, config)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Name of the settings engine in use.
    pub fn settings_engine(&self) -> &'static str {
        self.inner.settings.engine_name()
    }

    fn pending(&self) -> MutexGuard<'_, PendingWrites> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Load ------------------------------------------------------------

    /// Rebuilds the full state from both backends, migrating legacy data
    /// first when that has never been done.
    ///
    /// Unreadable collections and settings fall back to defaults; only a
    /// connection failure is returned.
    pub async fn load_all(&self) -> StoreResult<LoadedData> {
        let outcome = self.run_migration().await?;
        debug!("Migration check: {outcome}");

        let reads = STORE_SCHEMAS.iter().map(|schema| async move {
            (schema.name, self.inner.entities.get_all(schema.name).await)
        });
        let mut loaded: HashMap<&'static str, Vec<EntityRecord>> = HashMap::new();
        for (name, result) in join_all(reads).await {
            match result {
                Ok(records) => {
                    loaded.insert(name, records);
                }
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => warn!("Loading '{name}' failed, using an empty collection: {err}"),
            }
        }

        let mut settings = match self.inner.settings.get_many(&load_keys()).await {
            Ok(settings) => settings,
            Err(err) if err.is_connection() => return Err(err),
            Err(err) => {
                warn!("Loading settings failed, using defaults: {err}");
                SettingsMap::new()
            }
        };

        let mut state = AppState::default();
        for mapping in SETTINGS_MAP {
            if let Some(value) = settings.remove(mapping.key) {
                (mapping.decode)(&mut state, value);
            }
        }
        let core = GamificationCore::from_setting(settings.remove(keys::GAMIFICATION_CORE));
        state.gamification_stats = core.into_stats(Collection::default());

        for (name, records) in loaded {
            if let Some(slot) = state.collection_mut(name) {
                *slot = collection(records);
            }
        }

        let current_project = loose_string(&settings, keys::CURRENT_PROJECT)
            .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
        let theme =
            loose_string(&settings, keys::THEME).unwrap_or_else(|| DEFAULT_THEME.to_string());

        Ok(LoadedData { state, current_project, theme })
    }

    /// Checks the migration flag and imports the legacy blob if needed.
    pub async fn run_migration(&self) -> StoreResult<MigrationOutcome> {
        migration::run(
            self.inner.entities.as_ref(),
            &self.inner.settings,
            &self.inner.legacy_area,
            &self.inner.config.legacy_key,
        )
        .await
    }

    // -- Diff & queue ----------------------------------------------------

    /// Queues writes for everything that changed between two snapshots.
    ///
    /// Collections and composite settings count as changed when their
    /// `Arc` was replaced; contents are never compared. A collection
    /// mutated in place behind a shared `Arc` is not detected.
    ///
    /// The flush timer runs on the caller's tokio runtime. Outside a
    /// runtime the writes stay queued until [`flush`](Self::flush) is
    /// called; the same holds for every other `queue_*`/`set_*` method.
    pub fn diff_and_persist(&self, prev: &AppState, next: &AppState) -> StoreResult<()> {
        let mut entity_changes = Vec::new();
        for schema in STORE_SCHEMAS {
            let (Some(before), Some(after)) =
                (prev.collection(schema.name), next.collection(schema.name))
            else {
                continue;
            };
            if !Arc::ptr_eq(before, after) {
                entity_changes.push((schema.name, Arc::clone(after)));
            }
        }

        let mut settings_changes = SettingsMap::new();
        for mapping in SETTINGS_MAP {
            if (mapping.changed)(prev, next) {
                settings_changes.insert(mapping.key.to_string(), (mapping.encode)(next)?);
            }
        }
        if GamificationCore::changed_between(&prev.gamification_stats, &next.gamification_stats) {
            let core = GamificationCore::from_stats(&next.gamification_stats);
            settings_changes.insert(keys::GAMIFICATION_CORE.to_string(), serde_json::to_value(core)?);
        }

        if entity_changes.is_empty() && settings_changes.is_empty() {
            return Ok(());
        }
        {
            let mut pending = self.pending();
            pending.entities.extend(entity_changes);
            pending.settings.extend(settings_changes);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Queues a full replace of `store`, superseding any earlier queued
    /// value for it. Needs a tokio runtime for the flush timer, see
    /// [`diff_and_persist`](Self::diff_and_persist).
    pub fn queue_entity_write(&self, store: &str, records: Collection) -> StoreResult<()> {
        let name = require_schema(store)?.name;
        self.pending().entities.insert(name, records);
        self.schedule_flush();
        Ok(())
    }

    /// Merges `updates` into the pending settings patch. Needs a tokio
    /// runtime for the flush timer, see
    /// [`diff_and_persist`](Self::diff_and_persist).
    pub fn queue_settings_write(&self, updates: SettingsMap) {
        if updates.is_empty() {
            return;
        }
        self.pending().settings.extend(updates);
        self.schedule_flush();
    }

    fn queue_setting(&self, key: &str, value: JsonValue) {
        let mut updates = SettingsMap::new();
        updates.insert(key.to_string(), value);
        self.queue_settings_write(updates);
    }

    pub fn set_current_project(&self, project_id: impl Into<String>) {
        self.queue_setting(keys::CURRENT_PROJECT, JsonValue::String(project_id.into()));
    }

    pub fn set_theme(&self, theme: impl Into<String>) {
        self.queue_setting(keys::THEME, JsonValue::String(theme.into()));
    }

    /// Records the date of the last recurring-entries check. `key` is
    /// `lastRecurringCheck` or `lastFinancialRecurringCheck`.
    pub fn mark_recurring_check(&self, key: &str, date: impl Into<String>) -> StoreResult<()> {
        if key != keys::LAST_RECURRING_CHECK && key != keys::LAST_FINANCIAL_RECURRING_CHECK {
            return Err(StoreError::Validation(format!("'{key}' is not a recurring check key")));
        }
        self.queue_setting(key, JsonValue::String(date.into()));
        Ok(())
    }

    /// Reads settings directly, bypassing the queue.
    pub async fn get_settings(&self, keys: &[&str]) -> StoreResult<SettingsMap> {
        self.inner.settings.get_many(keys).await
    }

    /// Queued collections plus queued settings keys.
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    // -- Flush -----------------------------------------------------------

    fn schedule_flush(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduled = self.inner.debouncer.schedule(move || async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Err(err) = (StorageService { inner }).flush().await {
                error!("Debounced flush failed: {err}");
            }
        });
        if !scheduled {
            debug!("Writes stay queued until the next explicit flush");
        }
    }

    /// Writes everything queued and waits for the writes to settle.
    ///
    /// Writes that fail go back into the queue unless something newer was
    /// queued for the same collection or key in the meantime. They are
    /// retried by the next flush, not rescheduled. Writes rejected with
    /// [`StoreError::Validation`] would fail the same way again and are
    /// dropped instead. The first failure is returned.
    pub async fn flush(&self) -> StoreResult<()> {
        self.inner.debouncer.cancel();
        let _gate = self.inner.flush_gate.lock().await;

        let drained = std::mem::take(&mut *self.pending());
        if drained.is_empty() {
            return Ok(());
        }
        debug!(
            "Flushing {} collections and {} settings",
            drained.entities.len(),
            drained.settings.len()
        );

        let entity_writes: Vec<(&'static str, Collection)> = drained.entities.into_iter().collect();
        let settings_write = drained.settings;

        let entities = &self.inner.entities;
        let replaces = join_all(
            entity_writes
                .iter()
                .map(|(store, records)| entities.replace_all(store, Arc::clone(records))),
        );
        let batch = async {
            if settings_write.is_empty() {
                Ok(())
            } else {
                self.inner.settings.set_many(settings_write.clone()).await
            }
        };
        let (replaced, batched) = tokio::join!(replaces, batch);

        let mut first_error = None;
        let mut pending = self.pending();
        for ((store, records), result) in entity_writes.into_iter().zip(replaced) {
            if let Err(err) = result {
                if matches!(err, StoreError::Validation(_)) {
                    error!("Writing '{store}' was rejected, dropping it: {err}");
                } else {
                    error!("Writing '{store}' failed, keeping it queued: {err}");
                    pending.entities.entry(store).or_insert(records);
                }
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = batched {
            if matches!(err, StoreError::Validation(_)) {
                error!("Writing {} settings was rejected, dropping them: {err}", settings_write.len());
            } else {
                error!("Writing {} settings failed, keeping them queued: {err}", settings_write.len());
                for (key, value) in settings_write {
                    pending.settings.entry(key).or_insert(value);
                }
            }
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // -- Import & export ---------------------------------------------------

    /// Replaces everything durable with `state`.
    ///
    /// Queued writes are discarded and the migration flag is set. Runs
    /// immediately, without debouncing.
    pub async fn import_all(&self, state: &AppState, extras: ImportExtras) -> StoreResult<()> {
        self.inner.debouncer.cancel();
        let _gate = self.inner.flush_gate.lock().await;

        let discarded = std::mem::take(&mut *self.pending()).len();
        if discarded > 0 {
            info!("Import discards {discarded} queued writes");
        }

        self.inner.entities.clear_all().await?;

        let entities = &self.inner.entities;
        let writes = STORE_SCHEMAS.iter().filter_map(|schema| {
            let records = state.collection(schema.name)?;
            (!records.is_empty()).then(|| entities.replace_all(schema.name, Arc::clone(records)))
        });
        join_all(writes).await.into_iter().collect::<StoreResult<Vec<()>>>()?;

        let mut patch = SettingsMap::new();
        patch.insert(keys::DB_MIGRATED.to_string(), JsonValue::Bool(true));
        for mapping in SETTINGS_MAP {
            match (mapping.encode)(state)? {
                JsonValue::Null => {}
                value => {
                    patch.insert(mapping.key.to_string(), value);
                }
            }
        }
        let core = GamificationCore::from_stats(&state.gamification_stats);
        patch.insert(keys::GAMIFICATION_CORE.to_string(), serde_json::to_value(core)?);
        for (key, extra) in [(keys::THEME, extras.theme), (keys::CURRENT_PROJECT, extras.current_project)] {
            if let Some(value) = extra.filter(|value| !value.is_empty()) {
                patch.insert(key.to_string(), JsonValue::String(value));
            }
        }

        self.inner.settings.set_many(patch).await?;
        info!("Import complete");
        Ok(())
    }

    /// Flushes, then reads back the durable state for a backup.
    pub async fn export_all(&self) -> StoreResult<LoadedData> {
        self.flush().await?;
        self.load_all().await
    }
}

fn loose_string(settings: &SettingsMap, key: &str) -> Option<String> {
    settings.get(key).and_then(JsonValue::as_str).map(str::to_string)
}
