//! One-time import of the legacy single-blob format.
//!
//! The predecessor kept the whole state as one JSON object under a single
//! key of the string area, with theme, current project and the recurrence
//! check dates under their own keys beside it. The import runs at most once
//! per installation: the `dbMigrated` flag is written whenever an import
//! was attempted, including when it failed. The legacy data itself is left
//! where it is.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info, warn};
use serde_json::Value as JsonValue;

use crate::app_state::{keys, GamificationCore, SETTINGS_MAP};
use crate::entity_backend::EntityBackend;
use crate::local_db_model::{collection, records_from_json};
use crate::schema::STORE_SCHEMAS;
use crate::settings_store::{SettingsMap, SettingsStore, StringArea};
use crate::store_error::{StoreError, StoreResult};

/// What a migration attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The flag was already set; nothing was read.
    AlreadyDone,
    /// No legacy blob exists; the flag was set.
    NothingToMigrate,
    Migrated { collections: usize, settings: usize },
    /// The import failed part-way or the blob was unreadable; the flag was
    /// still set and the attempt is never repeated. Also returned, without
    /// touching the flag, when the flag itself could not be read.
    Failed(String),
}

impl MigrationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, MigrationOutcome::Failed(_))
    }
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationOutcome::AlreadyDone => write!(f, "already migrated"),
            MigrationOutcome::NothingToMigrate => write!(f, "nothing to migrate"),
            MigrationOutcome::Migrated { collections, settings } => {
                write!(f, "migrated {collections} collections and {settings} settings")
            }
            MigrationOutcome::Failed(reason) => write!(f, "migration failed: {reason}"),
        }
    }
}

/// Where a collection lived inside the legacy blob.
fn legacy_value<'a>(blob: &'a JsonValue, store: &str) -> Option<&'a JsonValue> {
    match store {
        "wellnessBreaks" => blob.get("wellnessStats")?.get("breaks"),
        "gamificationHistory" => blob.get("gamificationStats")?.get("historico"),
        _ => blob.get(store),
    }
}

struct LegacyInputs {
    blob: Option<String>,
    loose: Vec<(&'static str, Option<String>)>,
}

fn read_inputs(area: &dyn StringArea, legacy_key: &str) -> StoreResult<LegacyInputs> {
    let blob = area.get_item(legacy_key)?;
    let mut loose = Vec::with_capacity(keys::LOOSE.len());
    for key in keys::LOOSE {
        loose.push((*key, area.get_item(key)?));
    }
    Ok(LegacyInputs { blob, loose })
}

/// Checks the flag and imports the legacy blob if it has not been done.
///
/// Only a connection failure while reading the flag is returned as an
/// error. Any other failure to read the flag skips migration for this
/// session without setting it.
pub async fn run(
    entities: &dyn EntityBackend,
    settings: &SettingsStore,
    area: &Arc<dyn StringArea>,
    legacy_key: &str,
) -> StoreResult<MigrationOutcome> {
    match settings.get_as::<bool>(keys::DB_MIGRATED).await {
        Ok(Some(true)) => return Ok(MigrationOutcome::AlreadyDone),
        Ok(_) => {}
        Err(err) if err.is_connection() => return Err(err),
        Err(err) => {
            warn!("Could not read the migration flag, skipping migration: {err}");
            return Ok(MigrationOutcome::Failed(err.to_string()));
        }
    }

    Ok(migrate_legacy(entities, settings, area, legacy_key).await)
}

/// Imports the legacy blob unconditionally and sets the flag.
pub async fn migrate_legacy(
    entities: &dyn EntityBackend,
    settings: &SettingsStore,
    area: &Arc<dyn StringArea>,
    legacy_key: &str,
) -> MigrationOutcome {
    info!("Checking for legacy data under '{legacy_key}'");

    match import_legacy(entities, settings, area, legacy_key).await {
        Ok(outcome @ MigrationOutcome::Migrated { .. }) => {
            info!("Legacy import complete: {outcome}");
            outcome
        }
        Ok(_) => match settings.set(keys::DB_MIGRATED, JsonValue::Bool(true)).await {
            Ok(()) => MigrationOutcome::NothingToMigrate,
            Err(err) => {
                error!("Could not record the migration flag: {err}");
                MigrationOutcome::Failed(err.to_string())
            }
        },
        Err(err) => {
            error!("Legacy import failed, not retrying: {err}");
            if let Err(flag_err) = settings.set(keys::DB_MIGRATED, JsonValue::Bool(true)).await {
                error!("Could not record the migration flag: {flag_err}");
            }
            MigrationOutcome::Failed(err.to_string())
        }
    }
}

async fn import_legacy(
    entities: &dyn EntityBackend,
    settings: &SettingsStore,
    area: &Arc<dyn StringArea>,
    legacy_key: &str,
) -> StoreResult<MigrationOutcome> {
    let inputs = {
        let area = Arc::clone(area);
        let legacy_key = legacy_key.to_string();
        tokio::task::spawn_blocking(move || read_inputs(area.as_ref(), &legacy_key)).await??
    };

    let Some(raw) = inputs.blob.filter(|raw| !raw.is_empty()) else {
        return Ok(MigrationOutcome::NothingToMigrate);
    };
    let blob: JsonValue = serde_json::from_str(&raw)?;
    if !blob.is_object() {
        return Err(StoreError::Serialization("Legacy blob is not a JSON object".to_string()));
    }

    let mut writes = Vec::new();
    for schema in STORE_SCHEMAS {
        let Some(JsonValue::Array(items)) = legacy_value(&blob, schema.name) else {
            continue;
        };
        let (records, skipped) = records_from_json(items);
        if skipped > 0 {
            warn!("Skipped {skipped} legacy '{}' entries without a usable id", schema.name);
        }
        if !records.is_empty() {
            writes.push(entities.replace_all(schema.name, collection(records)));
        }
    }
    let collections = writes.len();
    join_all(writes).await.into_iter().collect::<StoreResult<Vec<()>>>()?;

    let mut patch = SettingsMap::new();
    for mapping in SETTINGS_MAP {
        if let Some(value) = blob.get(mapping.key) {
            patch.insert(mapping.key.to_string(), value.clone());
        }
    }
    if let Some(stats) = blob.get("gamificationStats") {
        let core = GamificationCore::from_setting(Some(stats.clone()));
        patch.insert(keys::GAMIFICATION_CORE.to_string(), serde_json::to_value(core)?);
    }
    for (key, standalone) in inputs.loose {
        let value = standalone
            .filter(|text| !text.is_empty())
            .or_else(|| blob.get(key).and_then(JsonValue::as_str).map(str::to_string));
        if let Some(value) = value {
            patch.insert(key.to_string(), JsonValue::String(value));
        }
    }

    let migrated_settings = patch.len();
    patch.insert(keys::DB_MIGRATED.to_string(), JsonValue::Bool(true));
    settings.set_many(patch).await?;

    Ok(MigrationOutcome::Migrated { collections, settings: migrated_settings })
}
