//! Persistence module for user address histories
//!
//! Profiles are stored behind the [`StorageBackend`] trait so the tracker
//! behaves the same whether it is backed by a single JSON document or by a
//! pooled SQLite database.

pub mod file_store;
pub mod pool;
pub mod sqlite_store;

pub use file_store::FileBackend;
pub use pool::ConnectionPool;
pub use sqlite_store::SqliteBackend;

use crate::config::{StorageConfig, StorageKind};
use crate::models::{AddressRecord, UserProfile};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing medium could not be prepared; dependent features must be disabled
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid data in storage: {0}")]
    InvalidData(String),

    #[error("storage not initialized")]
    NotInitialized,
}

impl StorageError {
    /// True for failures that mean the backend cannot be used at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::NotInitialized)
    }
}

/// Trait for profile storage backends
///
/// Both implementations keep history most-recent-first by `last_seen`, cap
/// it at the configured size on every save, and make a save of one profile
/// atomic with respect to another save of the same id.
pub trait StorageBackend: Send + Sync {
    /// Prepare the backing medium. Calling it again is a no-op.
    fn initialize(&self) -> Result<(), StorageError>;

    /// Release every held resource. Safe to call more than once, or after a
    /// failed `initialize`.
    fn shutdown(&self);

    /// Insert or replace a profile together with its history
    fn save(&self, profile: &UserProfile) -> Result<(), StorageError>;

    /// Load a profile by id, `None` if it was never stored
    fn load(&self, id: &str) -> Result<Option<UserProfile>, StorageError>;

    /// Find a profile by display name, ignoring ASCII case
    ///
    /// Only ASCII letters are case-folded: `"ALICE"` finds `"alice"`, but
    /// `"ÉMILE"` does not find `"émile"`. When several ids share the name,
    /// the most recently seen profile wins, then the smallest id.
    fn find_by_name(&self, name: &str) -> Result<Option<UserProfile>, StorageError>;

    /// The most recently touched record of a user's history
    fn last_record(&self, id: &str) -> Result<Option<AddressRecord>, StorageError>;

    /// Whether `address` is the user's most recent address
    ///
    /// Only the newest record is compared; an address further back in the
    /// history does not count.
    fn is_recorded(&self, id: &str, address: &str) -> Result<bool, StorageError> {
        Ok(self
            .last_record(id)?
            .map_or(false, |record| record.address == address))
    }
}

/// Build and initialize the backend selected in the configuration
///
/// The backend is chosen once; callers hold the returned reference for the
/// rest of the process.
pub fn open_backend(
    config: &StorageConfig,
    max_history_size: usize,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.kind {
        StorageKind::File => Arc::new(FileBackend::new(&config.file.path, max_history_size)),
        StorageKind::Relational => {
            Arc::new(SqliteBackend::new(config.relational.clone(), max_history_size))
        }
    };

    if let Err(e) = backend.initialize() {
        backend.shutdown();
        return Err(e);
    }
    Ok(backend)
}
