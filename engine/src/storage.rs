//! Storage engine orchestration.
//!
//! `StorageEngine` is the public surface of the crate. It sequences backend
//! setup, backups, restores and remote synchronisation, and keeps a cached
//! view of which records exist locally, remotely, or both.
//!
//! # Caching
//!
//! The local, remote and merged record lists are computed lazily and kept
//! until an operation that could have changed their source runs. Every
//! mutating operation clears exactly the caches it may have made stale, on
//! success and on failure alike; the merged view is always rebuilt from
//! scratch rather than patched.

use crate::backend::VersioningBackend;
use crate::error::EngineError;
use crate::model::{BackupRecord, Location};
use crate::report::{RecordScope, Reporter};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RecordCache {
    local: Option<Vec<BackupRecord>>,
    remote: Option<Vec<BackupRecord>>,
    merged: Option<Vec<BackupRecord>>,
}

impl RecordCache {
    fn invalidate_local(&mut self) {
        self.local = None;
        self.merged = None;
    }

    fn invalidate_remote(&mut self) {
        self.remote = None;
        self.merged = None;
    }
}

/// Runs backup operations against one backend instance.
///
/// Operations are expected to run one at a time; the engine does no locking
/// of its own.
pub struct StorageEngine<B: VersioningBackend> {
    backend: B,
    reporter: Box<dyn Reporter>,
    is_setup: bool,
    cache: RecordCache,
}

impl<B: VersioningBackend> StorageEngine<B> {
    pub fn new(backend: B, reporter: Box<dyn Reporter>) -> Self {
        StorageEngine {
            backend,
            reporter,
            is_setup: false,
            cache: RecordCache::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Prepare the backend once; later calls do nothing.
    pub fn setup(&mut self) -> Result<(), EngineError> {
        if !self.is_setup {
            self.backend.setup()?;
            self.is_setup = true;
        }
        Ok(())
    }

    /// Record `files` as a new backup.
    ///
    /// An empty file set is reported as "Nothing to backup" and returns
    /// `Ok(false)` without touching the backend.
    pub fn backup(&mut self, files: &[String], message: Option<&str>) -> Result<bool, EngineError> {
        if files.is_empty() {
            self.reporter.on_notice("Nothing to backup");
            return Ok(false);
        }

        self.setup()?;
        info!(files = files.len(), "starting backup");
        let result = self.backend.commit_change_set(files, message);
        self.cache.invalidate_local();
        result
    }

    /// Restore the local backup named or aliased `reference`.
    ///
    /// # Errors
    /// Returns `EngineError::NotFound` if no local record matches.
    pub fn restore(&mut self, reference: &str) -> Result<bool, EngineError> {
        self.setup()?;
        let result = match self.find(reference, RecordScope::Local) {
            Ok(record) => self.backend.restore_to(&record),
            Err(e) => Err(e),
        };
        self.cache.invalidate_local();
        result
    }

    /// Send every record the remote does not have yet.
    ///
    /// # Errors
    /// Returns `EngineError::RemoteNotConfigured` if the backend has no
    /// remote.
    pub fn upload(&mut self) -> Result<bool, EngineError> {
        self.setup()?;
        self.require_remote()?;
        let pending: Result<Vec<BackupRecord>, EngineError> = self.merged().map(|records| {
            records
                .iter()
                .filter(|r| !r.is_at(Location::Remote))
                .cloned()
                .collect()
        });

        let result = match pending {
            Ok(pending) if pending.is_empty() => {
                self.reporter.on_notice("Nothing to upload");
                Ok(true)
            }
            Ok(pending) => self.backend.upload_all(&pending),
            Err(e) => Err(e),
        };
        self.cache.invalidate_remote();
        result
    }

    /// Bring the record named or aliased `reference` into the local
    /// repository.
    ///
    /// # Errors
    /// Returns `EngineError::RemoteNotConfigured` without a remote,
    /// `EngineError::NotFound` if neither side knows the reference, and
    /// propagates `EngineError::NeedsNamedRef` from the backend.
    pub fn fetch(&mut self, reference: &str) -> Result<bool, EngineError> {
        self.setup()?;
        self.require_remote()?;
        let record = self.find(reference, RecordScope::All)?;

        if record.is_at(Location::Local) {
            self.reporter.on_notice("Already present in local repository");
            return Ok(true);
        }

        let result = self.backend.fetch_one(&record);
        self.cache.invalidate_local();
        result
    }

    /// Drop disposable refs and old history.
    pub fn prune(&mut self) -> Result<bool, EngineError> {
        self.setup()?;
        let result = self.backend.prune();
        self.cache.invalidate_local();
        result
    }

    pub fn list_local(&mut self) -> Result<Vec<BackupRecord>, EngineError> {
        self.list(RecordScope::Local)
    }

    pub fn list_remote(&mut self) -> Result<Vec<BackupRecord>, EngineError> {
        self.list(RecordScope::Remote)
    }

    pub fn list_all(&mut self) -> Result<Vec<BackupRecord>, EngineError> {
        self.list(RecordScope::All)
    }

    fn list(&mut self, scope: RecordScope) -> Result<Vec<BackupRecord>, EngineError> {
        self.setup()?;
        let records = self.records(scope)?.to_vec();
        self.reporter.on_records(scope, &records);
        Ok(records)
    }

    fn require_remote(&self) -> Result<(), EngineError> {
        if self.backend.has_remote() {
            Ok(())
        } else {
            Err(EngineError::RemoteNotConfigured)
        }
    }

    /// An exact name wins over an alias; among aliases the listing order
    /// decides.
    fn find(&mut self, reference: &str, scope: RecordScope) -> Result<BackupRecord, EngineError> {
        let records = self.records(scope)?;
        records
            .iter()
            .find(|r| r.name() == reference)
            .or_else(|| records.iter().find(|r| r.matches(reference)))
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                reference: reference.to_string(),
            })
    }

    fn records(&mut self, scope: RecordScope) -> Result<&[BackupRecord], EngineError> {
        match scope {
            RecordScope::Local => self.local(),
            RecordScope::Remote => self.remote(),
            RecordScope::All => self.merged(),
        }
    }

    fn local(&mut self) -> Result<&[BackupRecord], EngineError> {
        if self.cache.local.is_none() {
            debug!("listing local backups");
            self.cache.local = Some(self.backend.list_local()?);
        }
        Ok(self.cache.local.as_deref().unwrap_or_default())
    }

    fn remote(&mut self) -> Result<&[BackupRecord], EngineError> {
        if self.cache.remote.is_none() {
            debug!("listing remote backups");
            self.cache.remote = Some(self.backend.list_remote()?);
        }
        Ok(self.cache.remote.as_deref().unwrap_or_default())
    }

    fn merged(&mut self) -> Result<&[BackupRecord], EngineError> {
        if self.cache.merged.is_none() {
            let local = self.local()?.to_vec();
            let remote = self.remote()?.to_vec();
            self.cache.merged = Some(reconcile(&local, &remote)?);
        }
        Ok(self.cache.merged.as_deref().unwrap_or_default())
    }
}

/// Merge local and remote listings into one record per distinct name.
///
/// Local records come first in their own order, followed by remote-only
/// records in remote order. A name seen on both sides yields a single record
/// carrying the union of aliases and locations.
pub fn reconcile(
    local: &[BackupRecord],
    remote: &[BackupRecord],
) -> Result<Vec<BackupRecord>, EngineError> {
    let mut merged: Vec<BackupRecord> = Vec::with_capacity(local.len() + remote.len());
    let mut index: HashMap<&str, usize> = HashMap::new();

    for record in local.iter().chain(remote) {
        match index.get(record.name()) {
            Some(&i) => merged[i] = record.merge(&merged[i])?,
            None => {
                index.insert(record.name(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::{Arc, Mutex};

    fn record(name: &str, aliases: &[&str], locations: &[Location]) -> BackupRecord {
        BackupRecord::new(name, aliases.iter().copied(), locations.iter().copied())
    }

    /// Backend double that records every call.
    #[derive(Default)]
    struct MockBackend {
        remote: bool,
        calls: RefCell<Vec<String>>,
        local: Vec<BackupRecord>,
        remote_records: Vec<BackupRecord>,
        uploaded: RefCell<Vec<BackupRecord>>,
    }

    impl MockBackend {
        fn with(local: Vec<BackupRecord>, remote: Vec<BackupRecord>) -> Self {
            MockBackend {
                remote: true,
                local,
                remote_records: remote,
                ..MockBackend::default()
            }
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.borrow_mut().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls.borrow().iter().filter(|c| c.as_str() == call).count()
        }
    }

    impl VersioningBackend for MockBackend {
        fn has_remote(&self) -> bool {
            self.remote
        }

        fn setup(&self) -> Result<(), EngineError> {
            self.log("setup");
            Ok(())
        }

        fn commit_change_set(&self, files: &[String], _message: Option<&str>) -> Result<bool, EngineError> {
            self.log(format!("commit {}", files.join(",")));
            Ok(true)
        }

        fn restore_to(&self, record: &BackupRecord) -> Result<bool, EngineError> {
            self.log(format!("restore {}", record.name()));
            Ok(true)
        }

        fn upload_all(&self, records: &[BackupRecord]) -> Result<bool, EngineError> {
            self.log("upload");
            self.uploaded.borrow_mut().extend_from_slice(records);
            Ok(true)
        }

        fn fetch_one(&self, record: &BackupRecord) -> Result<bool, EngineError> {
            if record.aliases().is_empty() {
                return Err(EngineError::NeedsNamedRef {
                    name: record.name().to_string(),
                });
            }
            self.log(format!("fetch {}", record.name()));
            Ok(true)
        }

        fn list_local(&self) -> Result<Vec<BackupRecord>, EngineError> {
            self.log("list_local");
            Ok(self.local.clone())
        }

        fn list_remote(&self) -> Result<Vec<BackupRecord>, EngineError> {
            self.log("list_remote");
            Ok(self.remote_records.clone())
        }

        fn prune(&self) -> Result<bool, EngineError> {
            self.log("prune");
            Ok(true)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingReporter {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingReporter {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn on_notice(&self, message: &str) {
            self.lines.lock().unwrap().push(message.to_string());
        }

        fn on_records(&self, scope: RecordScope, records: &[BackupRecord]) {
            let mut lines = self.lines.lock().unwrap();
            lines.push(format!("{scope} backups:"));
            lines.extend(records.iter().map(|r| format!("  {r}")));
        }
    }

    fn engine(backend: MockBackend) -> (StorageEngine<MockBackend>, RecordingReporter) {
        let reporter = RecordingReporter::default();
        (StorageEngine::new(backend, Box::new(reporter.clone())), reporter)
    }

    fn sample() -> MockBackend {
        MockBackend::with(
            vec![record("abc", &["master"], &[Location::Local])],
            vec![
                record("abc", &["v1"], &[Location::Remote]),
                record("def", &["v2"], &[Location::Remote]),
            ],
        )
    }

    #[test]
    fn test_reconcile_merges_by_name() {
        let local = vec![record("abc", &[], &[Location::Local])];
        let remote = vec![
            record("abc", &["v1"], &[Location::Remote]),
            record("def", &["v2"], &[Location::Remote]),
        ];

        let merged = reconcile(&local, &remote).unwrap();
        assert_eq!(
            merged,
            vec![
                record("abc", &["v1"], &[Location::Local, Location::Remote]),
                record("def", &["v2"], &[Location::Remote]),
            ]
        );
    }

    #[test]
    fn test_reconcile_one_record_per_name() {
        let local = vec![
            record("abc", &["a"], &[Location::Local]),
            record("abc", &["b"], &[Location::Local]),
        ];
        let merged = reconcile(&local, &[]).unwrap();
        assert_eq!(merged, vec![record("abc", &["a", "b"], &[Location::Local])]);
    }

    #[test]
    fn test_backup_of_nothing_never_touches_backend() {
        let (mut engine, reporter) = engine(MockBackend::default());

        assert!(!engine.backup(&[], None).unwrap());
        assert!(engine.backend().calls().is_empty());
        assert_eq!(reporter.lines(), vec!["Nothing to backup"]);
    }

    #[test]
    fn test_setup_runs_once() {
        let (mut engine, _) = engine(sample());

        engine.setup().unwrap();
        engine.list_local().unwrap();
        engine.prune().unwrap();
        assert_eq!(engine.backend().count("setup"), 1);
    }

    #[test]
    fn test_backup_invalidates_local_view() {
        let (mut engine, _) = engine(sample());

        engine.list_all().unwrap();
        assert!(engine.backup(&["a.txt".to_string()], None).unwrap());
        engine.list_all().unwrap();

        assert_eq!(engine.backend().count("list_local"), 2);
        assert_eq!(engine.backend().count("list_remote"), 1);
        assert!(engine.backend().calls().contains(&"commit a.txt".to_string()));
    }

    #[test]
    fn test_views_are_cached_between_reads() {
        let (mut engine, _) = engine(sample());

        engine.list_local().unwrap();
        engine.list_all().unwrap();
        engine.list_remote().unwrap();
        engine.list_all().unwrap();

        assert_eq!(engine.backend().count("list_local"), 1);
        assert_eq!(engine.backend().count("list_remote"), 1);
    }

    #[test]
    fn test_restore_finds_local_alias() {
        let (mut engine, _) = engine(sample());

        assert!(engine.restore("master").unwrap());
        assert!(engine.backend().calls().contains(&"restore abc".to_string()));
    }

    #[test]
    fn test_restore_ignores_remote_only_records() {
        let (mut engine, _) = engine(sample());

        let err = engine.restore("v2").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { reference } if reference == "v2"));
        assert_eq!(engine.backend().count("list_remote"), 0);
    }

    #[test]
    fn test_fetch_skips_records_already_local() {
        let (mut engine, reporter) = engine(sample());

        // "v1" is only a remote alias, but it names a commit we already have
        assert!(engine.fetch("v1").unwrap());
        assert!(!engine.backend().calls().iter().any(|c| c.starts_with("fetch")));
        assert_eq!(reporter.lines(), vec!["Already present in local repository"]);
    }

    #[test]
    fn test_fetch_remote_only_record() {
        let (mut engine, _) = engine(sample());

        assert!(engine.fetch("v2").unwrap());
        assert!(engine.backend().calls().contains(&"fetch def".to_string()));

        // Local view is recomputed, remote is not
        engine.list_all().unwrap();
        assert_eq!(engine.backend().count("list_local"), 2);
        assert_eq!(engine.backend().count("list_remote"), 1);
    }

    #[test]
    fn test_fetch_unknown_and_unnamed() {
        let backend = MockBackend::with(vec![], vec![record("fff", &[], &[Location::Remote])]);
        let (mut engine, _) = engine(backend);

        assert!(matches!(
            engine.fetch("nope"),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            engine.fetch("fff"),
            Err(EngineError::NeedsNamedRef { .. })
        ));
    }

    #[test]
    fn test_upload_sends_only_records_missing_remotely() {
        let backend = MockBackend::with(
            vec![
                record("abc", &["master"], &[Location::Local]),
                record("new", &[], &[Location::Local]),
            ],
            vec![record("abc", &["master"], &[Location::Remote])],
        );
        let (mut engine, _) = engine(backend);

        assert!(engine.upload().unwrap());
        let uploaded = engine.backend().uploaded.borrow().clone();
        assert_eq!(uploaded, vec![record("new", &[], &[Location::Local])]);

        // Remote view is recomputed after an upload, local is not
        engine.list_all().unwrap();
        assert_eq!(engine.backend().count("list_remote"), 2);
        assert_eq!(engine.backend().count("list_local"), 1);
    }

    #[test]
    fn test_upload_with_nothing_pending() {
        let backend = MockBackend::with(
            vec![record("abc", &[], &[Location::Local])],
            vec![record("abc", &["master"], &[Location::Remote])],
        );
        let (mut engine, reporter) = engine(backend);

        assert!(engine.upload().unwrap());
        assert_eq!(engine.backend().count("upload"), 0);
        assert_eq!(reporter.lines(), vec!["Nothing to upload"]);
    }

    #[test]
    fn test_list_all_reports_merged_view() {
        let (mut engine, reporter) = engine(sample());

        let records = engine.list_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            reporter.lines(),
            vec![
                "All backups:",
                "  abc (master, v1) [local, remote]",
                "  def (v2) [remote]",
            ]
        );
    }

    #[test]
    fn test_remote_operations_without_remote() {
        let backend = MockBackend {
            local: vec![record("abc", &["master"], &[Location::Local])],
            ..MockBackend::default()
        };
        let (mut engine, _) = engine(backend);

        assert!(matches!(engine.fetch("v9"), Err(EngineError::RemoteNotConfigured)));
        assert!(matches!(engine.fetch("abc"), Err(EngineError::RemoteNotConfigured)));
        assert!(matches!(engine.upload(), Err(EngineError::RemoteNotConfigured)));
        assert_eq!(engine.backend().calls(), vec!["setup"]);

        // Listing still works and simply shows no remote side
        assert_eq!(engine.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_exact_name_wins_over_alias() {
        let backend = MockBackend::with(
            vec![
                record("abc", &["def"], &[Location::Local]),
                record("def", &[], &[Location::Local]),
            ],
            vec![],
        );
        let (mut engine, _) = engine(backend);

        assert!(engine.restore("def").unwrap());
        assert!(engine.backend().calls().contains(&"restore def".to_string()));
    }

    #[test]
    fn test_prune_invalidates_local_only() {
        let (mut engine, _) = engine(sample());

        engine.list_all().unwrap();
        assert!(engine.prune().unwrap());
        engine.list_all().unwrap();

        assert_eq!(engine.backend().count("prune"), 1);
        assert_eq!(engine.backend().count("list_local"), 2);
        assert_eq!(engine.backend().count("list_remote"), 1);
    }
}
