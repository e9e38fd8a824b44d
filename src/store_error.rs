//! Error type shared by every storage component.
//!
//! Engine, serialization and task failures are folded into [`StoreError`]
//! so the orchestrator can decide per call site whether a failure degrades
//! to a default (reads) or propagates (writes, connection loss).

use std::sync::Arc;

use lmdb::Error as LmdbError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// True for failures that mean the engine itself is unusable.
    ///
    /// These are the only errors `load_all` lets escape; everything else
    /// is recovered locally with a default.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub(crate) fn unknown_collection(name: &str) -> Self {
        StoreError::Validation(format!("Unknown collection '{name}'"))
    }

    /// Converts the error every waiter of a shared open attempt receives.
    pub(crate) fn from_shared(err: &Arc<StoreError>) -> Self {
        match err.as_ref() {
            StoreError::Connection(msg) => StoreError::Connection(msg.clone()),
            other => StoreError::Connection(other.to_string()),
        }
    }
}

impl From<LmdbError> for StoreError {
    fn from(err: LmdbError) -> Self {
        match err {
            LmdbError::NotFound => StoreError::NotFound("Key not found".to_string()),
            LmdbError::Corrupted | LmdbError::PageNotFound | LmdbError::Panic => {
                StoreError::Connection(format!("Environment unusable: {err}"))
            }
            LmdbError::Invalid | LmdbError::VersionMismatch => {
                StoreError::Connection(format!("Cannot open environment: {err}"))
            }
            LmdbError::MapFull => StoreError::Database(format!("Map is full: {err}")),
            _ => StoreError::Database(format!("{err}")),
        }
    }
}

impl From<SerdeError> for StoreError {
    fn from(err: SerdeError) -> Self {
        StoreError::Serialization(format!("JSON serialization error: {err}"))
    }
}

impl From<JoinError> for StoreError {
    fn from(err: JoinError) -> Self {
        StoreError::Task(format!("{err}"))
    }
}
