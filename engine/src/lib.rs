//! # gitbak engine - versioned backups on top of git
//!
//! A headless backup engine that records chosen files of a work tree as
//! commits in a dedicated git repository, restores any earlier snapshot, and
//! synchronises snapshots with a remote repository.
//!
//! ## Overview
//!
//! The engine provides:
//! - Snapshots of an explicit file set, with files dropped from the set
//!   recorded as deletions
//! - Symlinked files stored by content and restored through the link
//! - Restores that tag the current head first when it would otherwise be lost
//! - Upload and fetch against a configured remote
//! - History pruning that keeps only the newest snapshots
//! - A merged local/remote view of every known snapshot
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{GitBackend, RepositoryConfig, SilentReporter, StorageEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RepositoryConfig {
//!     work_tree: "/srv/app".into(),
//!     ..RepositoryConfig::default()
//! };
//! let mut storage = StorageEngine::new(GitBackend::new(config)?, Box::new(SilentReporter));
//!
//! storage.backup(&["etc/app.conf".to_string()], Some("before upgrade"))?;
//! for record in storage.list_local()? {
//!     println!("{record}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Backup records and change-set entries
//! - **error**: Error types and handling
//! - **config**: Repository configuration
//! - **process**: Running git and capturing its output
//! - **changeset**: Deciding which paths to add, modify or delete
//! - **staging**: Swapping symlinks for hard links around an operation
//! - **fs_ops**: Low-level filesystem operations
//! - **selection**: Expanding include/exclude lists to a file set
//! - **report**: User-facing notices and listings
//! - **backend**: The versioning backend trait and its git implementation
//! - **storage**: The `StorageEngine` orchestrator

pub mod backend;
pub mod changeset;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod model;
pub mod process;
pub mod report;
pub mod selection;
pub mod staging;
pub mod storage;

// Re-export main types and functions
pub use backend::{GitBackend, VersioningBackend};
pub use config::{CommitIdentity, RepositoryConfig};
pub use error::EngineError;
pub use model::{BackupRecord, Change, ChangeAction, Location};
pub use report::{RecordScope, Reporter, SilentReporter};
pub use selection::resolve_files;
pub use storage::{reconcile, StorageEngine};
