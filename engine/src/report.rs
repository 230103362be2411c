//! User-facing reporting.
//!
//! This module defines the `Reporter` trait, which decouples the engine from
//! wherever its notices and listings end up (a terminal, a log, nothing).
//! Diagnostics go through `tracing`; a reporter only receives what the user
//! asked to see.

use crate::model::BackupRecord;
use std::fmt;

/// Which view of the records a listing shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordScope {
    Local,
    Remote,
    All,
}

impl fmt::Display for RecordScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordScope::Local => write!(f, "Local"),
            RecordScope::Remote => write!(f, "Remote"),
            RecordScope::All => write!(f, "All"),
        }
    }
}

/// Receives notices and record listings from a `StorageEngine`.
///
/// All methods are called synchronously from the engine operation that
/// produced them.
pub trait Reporter: Send {
    /// A short informational message such as "Nothing to backup".
    fn on_notice(&self, message: &str);

    /// The result of a `list_*` call.
    fn on_records(&self, scope: RecordScope, records: &[BackupRecord]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn on_notice(&self, _message: &str) {}

    fn on_records(&self, _scope: RecordScope, _records: &[BackupRecord]) {}
}
