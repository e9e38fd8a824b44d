//! # Workspace Store
//!
//! The persistence core of a local-first productivity workspace. It keeps
//! one large in-memory application state in sync with two LMDB-backed
//! stores: a multi-collection entity database (notes, kanban tasks,
//! transactions, ...) and a key/value settings store.
//!
//! ## Features
//!
//! - **Schema-driven entity database**: one LMDB database per collection,
//!   secondary indexes maintained in the same write transaction
//! - **Atomic collection replace**: readers see the old or the new contents,
//!   never a mix
//! - **Debounced incremental writes**: state transitions are diffed by
//!   reference and collapsed into one write per debounce window
//! - **One-time legacy migration**: the old single-blob format is imported
//!   exactly once
//! - **Degrading reads**: a corrupt collection or setting falls back to its
//!   default instead of blocking startup
//!
//! ## Quick Start
//!
//! ```no_run
//! use workspace_store::{StorageConfig, StorageService};
//! use workspace_store::local_db_model::{with_upserted, EntityRecord};
//! use serde_json::json;
//!
//! # async fn run() -> workspace_store::StoreResult<()> {
//! let storage = StorageService::open(StorageConfig::new("workspace_data")).await?;
//! let loaded = storage.load_all().await?;
//!
//! let mut next = loaded.state.clone();
//! next.notes = with_upserted(&next.notes, EntityRecord::new("1", json!({
//!     "projectId": loaded.current_project,
//!     "title": "First note",
//! })));
//! storage.diff_and_persist(&loaded.state, &next)?;
//!
//! // Before exit or export: write whatever is still queued.
//! storage.flush().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`storage_service`] - the orchestrator: load, diff, flush, import, migration
//! - [`local_db_state`] - the LMDB entity database
//! - [`lmdb_settings`] / [`settings_store`] - the settings backend and its engines
//! - [`app_state`] - the state aggregate and its mapping onto the backends
//! - [`schema`] - the static collection registry

pub mod app_state;
pub mod config;
pub mod debounce;
pub mod entity_backend;
pub mod lmdb_settings;
pub mod local_db_model;
pub mod local_db_state;
pub mod migration;
pub mod schema;
pub mod settings_store;
pub mod storage_service;
pub mod store_error;

pub use app_state::AppState;
pub use config::StorageConfig;
pub use entity_backend::{EntityBackend, MemoryEntityBackend};
pub use local_db_model::{Collection, EntityRecord};
pub use local_db_state::EntityDb;
pub use migration::MigrationOutcome;
pub use settings_store::{SettingsMap, SettingsStore};
pub use storage_service::{ImportExtras, LoadedData, StorageService};
pub use store_error::{StoreError, StoreResult};
