//! Error types for the backup engine.
//!
//! `EngineError` covers failures that stop an operation or that the caller
//! must see (unknown refs, missing remote). Failures of a single changeset
//! entry are logged by the backend and never surface here, and "no changes"
//! is reported as an `Ok(false)` outcome rather than an error.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the storage engine and its backends.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend repository could not be created or opened.
    #[error("Failed to initialize repository at {}: {reason}", path.display())]
    Initialization { path: PathBuf, reason: String },

    /// No record matches the requested name or alias.
    #[error("No backup for ref: {reference}")]
    NotFound { reference: String },

    /// A record without aliases cannot be resolved against a remote.
    #[error("Backup {name} has no named ref; cannot fetch it from the remote")]
    NeedsNamedRef { name: String },

    /// The operation needs a remote and none is configured.
    #[error("There is no remote storage configured")]
    RemoteNotConfigured,

    /// The backend binary ran and exited unsuccessfully.
    #[error("{command} failed (exit status {}): {}", status.map_or_else(|| "signal".to_string(), |c| c.to_string()), stderr.trim())]
    ProcessFailure {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The backend binary could not be started at all.
    #[error("Failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// Two records with different names were merged.
    #[error("Cannot merge backup {left} with backup {right}")]
    MergeMismatch { left: String, right: String },

    /// A configuration value failed validation.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A symlink could not be swapped or put back.
    #[error("Failed to stage symlink {}: {source}", path.display())]
    Staging { path: PathBuf, source: io::Error },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Spawn { source, .. }
            | Self::Io { source, .. }
            | Self::Staging { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn staging(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = EngineError::NotFound {
            reference: "v1".to_string(),
        };
        assert_eq!(err.to_string(), "No backup for ref: v1");
    }

    #[test]
    fn test_process_failure_display_trims_stderr() {
        let err = EngineError::ProcessFailure {
            command: "git push".to_string(),
            status: Some(128),
            stdout: String::new(),
            stderr: "fatal: no such remote\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "git push failed (exit status 128): fatal: no such remote"
        );

        let err = EngineError::ProcessFailure {
            command: "git gc".to_string(),
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(err.to_string().contains("exit status signal"));
    }

    #[test]
    fn test_raw_os_error() {
        let err = EngineError::io(
            "/tmp/x",
            io::Error::from_raw_os_error(2),
        );
        assert_eq!(err.raw_os_error(), Some(2));
        assert_eq!(EngineError::RemoteNotConfigured.raw_os_error(), None);
    }
}
