//! Repository configuration.
//!
//! `RepositoryConfig` is supplied once per engine instance and never changes
//! afterwards. It is validated before any backend is built from it, since
//! its values end up in backend argument vectors.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default location of the backup repository, relative to the work tree.
pub const DEFAULT_REPOSITORY: &str = "tmp/backup.git";

/// Default remote branch that receives the mainline.
pub const DEFAULT_BRANCH: &str = "master";

/// Committer identity passed to the backend on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// Where backups live and where they are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Backend repository path; relative paths resolve against `work_tree`
    pub repository: PathBuf,

    /// Root of the protected files
    pub work_tree: PathBuf,

    /// Remote URL; without it upload and fetch are unavailable
    pub remote: Option<String>,

    /// Remote branch the mainline is pushed to
    pub branch: String,

    /// Optional committer identity
    pub identity: Option<CommitIdentity>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            repository: PathBuf::from(DEFAULT_REPOSITORY),
            work_tree: PathBuf::from("."),
            remote: None,
            branch: DEFAULT_BRANCH.to_string(),
            identity: None,
        }
    }
}

impl RepositoryConfig {
    /// Check every field that is later handed to the backend.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.repository.as_os_str().is_empty() {
            return Err(invalid("repository", "path is empty"));
        }

        if self.work_tree.as_os_str().is_empty() {
            return Err(invalid("work_tree", "path is empty"));
        }

        validate_ref_name("branch", &self.branch)?;

        if let Some(remote) = &self.remote {
            if remote.trim().is_empty() {
                return Err(invalid("remote", "URL is empty"));
            }
            if remote.starts_with('-') {
                return Err(invalid("remote", "URL must not start with '-'"));
            }
        }

        if let Some(identity) = &self.identity {
            if identity.name.trim().is_empty() || identity.email.trim().is_empty() {
                return Err(invalid("identity", "name and email are required"));
            }
        }

        Ok(())
    }

    /// Absolute work tree path.
    ///
    /// # Errors
    /// Returns `EngineError::Io` if the current directory is unavailable.
    pub fn resolved_work_tree(&self) -> Result<PathBuf, EngineError> {
        std::path::absolute(&self.work_tree).map_err(|e| EngineError::io(&self.work_tree, e))
    }

    /// Absolute repository path, anchored at the work tree when relative.
    ///
    /// # Errors
    /// Returns `EngineError::Io` if the current directory is unavailable.
    pub fn resolved_repository(&self) -> Result<PathBuf, EngineError> {
        if self.repository.is_absolute() {
            return Ok(self.repository.clone());
        }
        Ok(self.resolved_work_tree()?.join(&self.repository))
    }

    /// The remote URL, or `RemoteNotConfigured`.
    pub fn require_remote(&self) -> Result<&str, EngineError> {
        self.remote.as_deref().ok_or(EngineError::RemoteNotConfigured)
    }
}

/// Reject names that would be read as options or split by the backend.
pub fn validate_ref_name(field: &'static str, name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(invalid(field, "name is empty"));
    }
    if name.starts_with('-') {
        return Err(invalid(field, "name must not start with '-'"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(field, "name must not contain whitespace"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> EngineError {
    EngineError::InvalidConfig {
        field,
        reason: reason.to_string(),
    }
}
