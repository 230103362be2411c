//! Storage backends.
//!
//! A backend is the content-versioning system that durably stores snapshots.
//! The engine only talks to it through [`VersioningBackend`]; the concrete
//! backend is chosen by the caller and handed to
//! [`StorageEngine::new`](crate::storage::StorageEngine::new).

pub mod git;

use crate::error::EngineError;
use crate::model::BackupRecord;

pub use git::GitBackend;

/// What the engine needs from a storage medium.
///
/// Operations returning `bool` report `Ok(false)` when a whole-operation step
/// failed (the failure is logged with its captured output) and `Err` only for
/// conditions the caller must handle.
pub trait VersioningBackend {
    /// Whether a remote is configured. Upload and fetch require one.
    fn has_remote(&self) -> bool;

    /// Create the repository if it does not exist yet. Idempotent.
    fn setup(&self) -> Result<(), EngineError>;

    /// Record `files` as the next snapshot. `Ok(false)` when nothing changed.
    fn commit_change_set(&self, files: &[String], message: Option<&str>) -> Result<bool, EngineError>;

    /// Make the tracked files match `record`.
    fn restore_to(&self, record: &BackupRecord) -> Result<bool, EngineError>;

    /// Send local snapshots to the remote.
    fn upload_all(&self, records: &[BackupRecord]) -> Result<bool, EngineError>;

    /// Bring one remote snapshot into the local repository.
    fn fetch_one(&self, record: &BackupRecord) -> Result<bool, EngineError>;

    fn list_local(&self) -> Result<Vec<BackupRecord>, EngineError>;

    fn list_remote(&self) -> Result<Vec<BackupRecord>, EngineError>;

    /// Drop disposable refs and old history.
    fn prune(&self) -> Result<bool, EngineError>;
}
