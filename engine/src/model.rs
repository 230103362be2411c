//! Core data model for backups.
//!
//! This module defines the value types the engine passes around:
//! - BackupRecord: one snapshot, identified by its backend-assigned name
//! - Location: where a snapshot is currently known to exist
//! - Change / ChangeAction: one entry of a backup changeset

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Where a snapshot is known to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Present in the local backend repository
    Local,
    /// Present on the configured remote
    Remote,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => write!(f, "local"),
            Location::Remote => write!(f, "remote"),
        }
    }
}

/// One identified, point-in-time snapshot of the protected file set.
///
/// Records are values: they are produced fresh by every enumeration and are
/// never mutated in place. Combining what two sources know about the same
/// snapshot goes through [`BackupRecord::merge`], which returns a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    name: String,
    aliases: BTreeSet<String>,
    locations: BTreeSet<Location>,
}

impl BackupRecord {
    pub fn new<A, L>(name: impl Into<String>, aliases: A, locations: L) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        L: IntoIterator<Item = Location>,
    {
        BackupRecord {
            name: name.into(),
            aliases: aliases.into_iter().map(Into::into).collect(),
            locations: locations.into_iter().collect(),
        }
    }

    /// The backend content identifier (a commit id for git).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &BTreeSet<String> {
        &self.aliases
    }

    pub fn locations(&self) -> &BTreeSet<Location> {
        &self.locations
    }

    pub fn is_at(&self, location: Location) -> bool {
        self.locations.contains(&location)
    }

    /// True if `reference` is this record's name or one of its aliases.
    pub fn matches(&self, reference: &str) -> bool {
        self.name == reference || self.aliases.contains(reference)
    }

    /// Combine two views of the same snapshot.
    ///
    /// # Errors
    /// Returns `EngineError::MergeMismatch` if the names differ.
    pub fn merge(&self, other: &BackupRecord) -> Result<BackupRecord, EngineError> {
        if self.name != other.name {
            return Err(EngineError::MergeMismatch {
                left: self.name.clone(),
                right: other.name.clone(),
            });
        }

        Ok(BackupRecord {
            name: self.name.clone(),
            aliases: self.aliases.union(&other.aliases).cloned().collect(),
            locations: self.locations.union(&other.locations).copied().collect(),
        })
    }
}

impl fmt::Display for BackupRecord {
    /// `<name> (<alias, ...>) [<location, ...>]`, omitting empty groups.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;

        if !self.aliases.is_empty() {
            let aliases: Vec<&str> = self.aliases.iter().map(String::as_str).collect();
            write!(f, " ({})", aliases.join(", "))?;
        }

        if !self.locations.is_empty() {
            let locations: Vec<String> = self.locations.iter().map(Location::to_string).collect();
            write!(f, " [{}]", locations.join(", "))?;
        }

        Ok(())
    }
}

/// What has to happen to one path to align tracked content with the
/// desired file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// Start tracking a path
    Add,
    /// Record new content for a tracked path
    Modify,
    /// Stop tracking a path
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "A"),
            ChangeAction::Modify => write!(f, "M"),
            ChangeAction::Delete => write!(f, "D"),
        }
    }
}

/// A single changeset entry. Paths are relative to the work tree, in the
/// backend's own notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Change {
    pub action: ChangeAction,
    pub path: String,
}

impl Change {
    pub fn new(action: ChangeAction, path: impl Into<String>) -> Self {
        Change {
            action,
            path: path.into(),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.path)
    }
}
