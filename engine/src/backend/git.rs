//! Git storage backend.
//!
//! Snapshots are commits in a dedicated repository whose work tree is the
//! protected directory. The local mainline (`refs/heads/master`) always
//! points at the latest backup or the last restored one; it is rebuilt by
//! every restore, which is why uploads push it with force.
//!
//! All tracked-state changes go through the repository's index and refs.
//! The only writes to the live tree are the symlink swap while an operation
//! runs and the hard reset performed by a restore.

use crate::backend::VersioningBackend;
use crate::changeset::{self, StatusEntry};
use crate::config::{validate_ref_name, RepositoryConfig};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{BackupRecord, ChangeAction, Location};
use crate::process::{Git, ProcessOutput};
use crate::staging::{StagingMap, SymlinkStager};
use chrono::Local;
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsStr;
use std::fs;
use tracing::{debug, error, info, warn};

/// Local mainline ref.
pub const MAINLINE_REF: &str = "refs/heads/master";

/// Namespace that fetched remote refs land in.
pub const FETCH_NAMESPACE: &str = "refs/backups/";

/// Number of most recent mainline commits kept by `prune`.
// TODO: make this configurable once the retention heuristic is settled.
pub const RETAINED_COMMITS: usize = 6;

/// `VersioningBackend` on top of the `git` binary.
#[derive(Debug, Clone)]
pub struct GitBackend {
    config: RepositoryConfig,
    git: Git,
    stager: SymlinkStager,
}

impl GitBackend {
    /// Build a backend for a validated configuration.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfig` if validation fails, or
    /// `EngineError::Io` if relative paths cannot be resolved.
    pub fn new(config: RepositoryConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let work_tree = config.resolved_work_tree()?;
        let git_dir = config.resolved_repository()?;

        Ok(GitBackend {
            git: Git::new(git_dir, work_tree.clone(), config.identity.clone()),
            stager: SymlinkStager::new(work_tree),
            config,
        })
    }

    /// Run one whole-operation step. A failing step is logged with its
    /// captured output and yields `None`.
    fn checked<I, S>(&self, step: &str, args: I) -> Result<Option<ProcessOutput>, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.git.run(args)?.ensure_success() {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                error!(step, error = %e, "backend step failed");
                Ok(None)
            }
        }
    }

    fn stage(&self, paths: &[String]) -> Option<StagingMap> {
        match self.stager.acquire(paths) {
            Ok(map) => Some(map),
            Err(e) => {
                error!(error = %e, "failed to stage symlinks");
                None
            }
        }
    }

    /// Commit id a revision resolves to, if any.
    fn resolve_commit(&self, rev: &str) -> Result<Option<String>, EngineError> {
        let output = self.git.run([
            "rev-parse",
            "--verify",
            "--quiet",
            format!("{rev}^{{commit}}").as_str(),
        ])?;
        Ok(output
            .success()
            .then(|| output.stdout.trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    fn tracked_paths(&self, rev: &str) -> Result<Option<Vec<String>>, EngineError> {
        Ok(self
            .checked("ls-tree", ["ls-tree", "--full-tree", "-r", "--name-only", "-z", rev])?
            .map(|out| out.nul_fields().map(str::to_string).collect()))
    }

    fn status(&self) -> Result<Option<Vec<StatusEntry>>, EngineError> {
        Ok(self
            .checked("status", ["status", "--porcelain", "-z"])?
            .map(|out| changeset::parse_porcelain_z(&out.stdout)))
    }

    fn default_message(&self) -> String {
        format!(
            "Backup: {}\n\n  remote: {}\n  branch: {}",
            Local::now().format("%Y%m%d%H%M%S"),
            self.config.remote.as_deref().unwrap_or("(none)"),
            self.config.branch
        )
    }

    /// Stage, resolve and commit while the symlink swap is in place.
    fn record_changes(&self, files: &[String], message: Option<&str>) -> Result<bool, EngineError> {
        let Some(status) = self.status()? else {
            return Ok(false);
        };

        let tracked = if self.resolve_commit(MAINLINE_REF)?.is_some() {
            match self.tracked_paths(MAINLINE_REF)? {
                Some(paths) => paths,
                None => return Ok(false),
            }
        } else {
            Vec::new()
        };

        let work_tree = self.git.work_tree();
        let changes = changeset::resolve(files, &status, &tracked, |path| {
            fs_ops::is_regular_file(&work_tree.join(path))
        });

        if changes.is_empty() {
            info!("No changes since last backup.");
            return Ok(false);
        }

        for change in &changes {
            info!("{change}");
            let path = change.path.as_str();
            let output = match change.action {
                ChangeAction::Add | ChangeAction::Modify => self.git.run(["add", "-f", "--", path])?,
                ChangeAction::Delete => self.git.run([
                    "rm",
                    "--cached",
                    "--quiet",
                    "--ignore-unmatch",
                    "--",
                    path,
                ])?,
            };
            if let Err(e) = output.ensure_success() {
                warn!(path, error = %e, "failed to apply change; continuing");
            }
        }

        let message = message.map_or_else(|| self.default_message(), str::to_string);
        let committed = self
            .checked("commit", ["commit", "--quiet", "--no-verify", "-m", message.as_str()])?
            .is_some();
        if committed {
            info!(changes = changes.len(), "backup committed");
        }
        Ok(committed)
    }

    /// Whether the current head would become unreachable by moving the
    /// mainline to `target` and therefore needs a protective tag.
    /// `None` when one of the queries failed.
    fn head_at_risk(&self, head: &str, target: &str) -> Result<Option<bool>, EngineError> {
        let Some(tags) = self.checked("tag --contains", ["tag", "--contains", head])? else {
            return Ok(None);
        };
        let tagged = tags.lines().next().is_some();

        let range = format!("{target}..{head}");
        let Some(count) = self.checked("rev-list", ["rev-list", "--count", range.as_str()])? else {
            return Ok(None);
        };
        let Some(unreachable) = parse_count(&count.stdout) else {
            error!(output = %count.stdout.trim(), "unexpected rev-list output");
            return Ok(None);
        };

        Ok(Some(needs_safety_tag(tagged, unreachable)))
    }

    fn free_tag_name(&self, base: &str) -> Result<String, EngineError> {
        let mut name = base.to_string();
        let mut suffix = 1;
        while self.resolve_commit(&format!("refs/tags/{name}"))?.is_some() {
            name = format!("{base}-{suffix}");
            suffix += 1;
        }
        Ok(name)
    }

    fn create_safety_tag(&self, head: &str, target: &str) -> Result<bool, EngineError> {
        let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let name = self.free_tag_name(&format!("restore-{timestamp}"))?;
        let message = format!(
            "Restoring a backup (at {timestamp})\n\n   remote: {}\n   branch: {}\n  old ref: {head}\n  new ref: {target}",
            self.config.remote.as_deref().unwrap_or("(none)"),
            self.config.branch
        );

        if self
            .checked("tag", ["tag", "-a", "-m", message.as_str(), name.as_str(), head])?
            .is_none()
        {
            return Ok(false);
        }
        info!(tag = %name, head, "tagged current head before restore");

        match self.config.remote.as_deref() {
            Some(remote) => {
                let refspec = format!("refs/tags/{name}");
                if self
                    .checked("push tag", ["push", "--quiet", remote, refspec.as_str()])?
                    .is_none()
                {
                    warn!(tag = %name, "safety tag kept locally only");
                }
            }
            None => debug!(tag = %name, "no remote configured; safety tag kept locally"),
        }

        Ok(true)
    }
}

impl VersioningBackend for GitBackend {
    fn has_remote(&self) -> bool {
        self.config.remote.is_some()
    }

    fn setup(&self) -> Result<(), EngineError> {
        let git_dir = self.git.git_dir();
        if git_dir.is_dir() {
            return Ok(());
        }

        let init_error = |reason: String| EngineError::Initialization {
            path: git_dir.to_path_buf(),
            reason,
        };

        if git_dir.exists() {
            return Err(init_error("path exists but is not a directory".to_string()));
        }

        info!(repository = %git_dir.display(), "initializing backup repository");
        self.git
            .run_checked(["init", "--quiet"])
            .map_err(|e| init_error(e.to_string()))?;
        self.git
            .run_checked(["symbolic-ref", "HEAD", MAINLINE_REF])
            .map_err(|e| init_error(e.to_string()))?;
        Ok(())
    }

    fn commit_change_set(&self, files: &[String], message: Option<&str>) -> Result<bool, EngineError> {
        let Some(staged) = self.stage(files) else {
            return Ok(false);
        };

        let outcome = self.record_changes(files, message);
        staged.release()?;
        outcome
    }

    fn restore_to(&self, record: &BackupRecord) -> Result<bool, EngineError> {
        let target = record.name();
        if target.starts_with('-') || self.resolve_commit(target)?.is_none() {
            return Err(EngineError::NotFound {
                reference: target.to_string(),
            });
        }

        match self.resolve_commit("HEAD")? {
            Some(head) if head == target => info!("Already at {target}"),
            Some(head) => match self.head_at_risk(&head, target)? {
                None => return Ok(false),
                Some(true) => {
                    if !self.create_safety_tag(&head, target)? {
                        return Ok(false);
                    }
                }
                Some(false) => {}
            },
            None => {}
        }

        let Some(paths) = self.tracked_paths(target)? else {
            return Ok(false);
        };
        let Some(staged) = self.stage(&paths) else {
            return Ok(false);
        };

        let reset = self
            .checked("reset", ["reset", "--hard", "--quiet", target])
            .map(|out| out.is_some());
        staged.release()?;

        let reset = reset?;
        if reset {
            info!(backup = target, "restored backup");
        }
        Ok(reset)
    }

    fn upload_all(&self, records: &[BackupRecord]) -> Result<bool, EngineError> {
        let remote = self.config.require_remote()?;
        let branch_refspec = format!("{MAINLINE_REF}:refs/heads/{}", self.config.branch);

        info!(count = records.len(), remote, "uploading backups");
        Ok(self
            .checked(
                "push",
                ["push", "--force", "--quiet", "--tags", remote, branch_refspec.as_str()],
            )?
            .is_some())
    }

    fn fetch_one(&self, record: &BackupRecord) -> Result<bool, EngineError> {
        let Some(alias) = fetch_alias(record, &self.config.branch) else {
            return Err(EngineError::NeedsNamedRef {
                name: record.name().to_string(),
            });
        };
        let remote = self.config.require_remote()?;
        validate_ref_name("alias", alias)?;

        // A remote mainline must not land where it would shadow the local one
        let refspec = if alias == self.config.branch {
            format!("+{alias}:{FETCH_NAMESPACE}{alias}")
        } else {
            format!("{alias}:refs/tags/{alias}")
        };
        info!(alias = %alias, remote, "fetching backup");
        Ok(self
            .checked("fetch", ["fetch", "--quiet", "--no-tags", remote, refspec.as_str()])?
            .is_some())
    }

    fn list_local(&self) -> Result<Vec<BackupRecord>, EngineError> {
        if !self.git.git_dir().is_dir() {
            return Ok(Vec::new());
        }

        let refs = self
            .git
            .run_checked(["for-each-ref", "--format=%(objectname) %(*objectname) %(refname)"])?;
        if refs.lines().next().is_none() {
            return Ok(Vec::new());
        }

        let commits = self.git.run_checked(["rev-list", "--all"])?;
        Ok(local_records(&commits, &refs))
    }

    fn list_remote(&self) -> Result<Vec<BackupRecord>, EngineError> {
        let Some(remote) = self.config.remote.as_deref() else {
            debug!("no remote configured; no remote backups");
            return Ok(Vec::new());
        };

        let output = self.git.run_checked(["ls-remote", "--heads", "--tags", remote])?;
        Ok(remote_records(&output))
    }

    fn prune(&self) -> Result<bool, EngineError> {
        let Some(refs) = self.checked("for-each-ref", ["for-each-ref", "--format=%(refname)"])?
        else {
            return Ok(false);
        };

        let candidates: Vec<String> = refs
            .lines()
            .filter(|r| *r != MAINLINE_REF)
            .map(str::to_string)
            .collect();

        for refname in retain_mainline(candidates) {
            debug!(refname = %refname, "deleting ref");
            if let Err(e) = self.git.run(["update-ref", "-d", refname.as_str()])?.ensure_success() {
                warn!(refname = %refname, error = %e, "failed to delete ref");
            }
        }

        let boundary = format!("{MAINLINE_REF}~{}", RETAINED_COMMITS - 1);
        if let Some(id) = self.resolve_commit(&boundary)? {
            let shallow = self.git.git_dir().join("shallow");
            if let Err(e) = fs::write(&shallow, format!("{id}\n")) {
                error!(error = %EngineError::io(&shallow, e), "failed to record history boundary");
                return Ok(false);
            }
            info!(boundary = %id, kept = RETAINED_COMMITS, "history boundary recorded");
        }

        if self
            .checked("reflog expire", ["reflog", "expire", "--expire=now", "--all"])?
            .is_none()
        {
            return Ok(false);
        }
        Ok(self
            .checked("gc", ["gc", "--prune=now", "--quiet"])?
            .is_some())
    }
}

/// A head needs a protective tag when no tag reaches it and moving the
/// mainline would strand at least one commit.
pub fn needs_safety_tag(tagged: bool, unreachable_commits: usize) -> bool {
    !tagged && unreachable_commits > 0
}

/// Number printed by `rev-list --count`.
fn parse_count(output: &str) -> Option<usize> {
    output.trim().parse().ok()
}

/// Drop the mainline from a set of refs about to be deleted.
pub fn retain_mainline(refs: Vec<String>) -> Vec<String> {
    refs.into_iter()
        .filter(|r| {
            let keep = r == MAINLINE_REF;
            if keep {
                warn!("refusing to delete the mainline ref");
            }
            !keep
        })
        .collect()
}

/// `refs/heads/master` -> `master`, `refs/tags/v1` -> `v1`. Other namespaces
/// keep their prefix (`refs/backups/master` -> `backups/master`), so fetched
/// refs never collide with local branch names.
pub fn strip_namespace(refname: &str) -> &str {
    refname
        .strip_prefix("refs/heads/")
        .or_else(|| refname.strip_prefix("refs/tags/"))
        .or_else(|| refname.strip_prefix("refs/"))
        .unwrap_or(refname)
}

/// Alias to fetch `record` by: a tag when the record has one, the remote
/// mainline otherwise.
fn fetch_alias<'a>(record: &'a BackupRecord, branch: &str) -> Option<&'a str> {
    let aliases = record.aliases();
    aliases
        .iter()
        .find(|a| a.as_str() != branch)
        .or_else(|| aliases.iter().next())
        .map(String::as_str)
}

/// Build local records from `rev-list --all` and `for-each-ref` output
/// (`<object> <peeled object> <refname>` per line).
fn local_records(commits: &ProcessOutput, refs: &ProcessOutput) -> Vec<BackupRecord> {
    let mut aliases: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    let mut mainline = None;

    for line in refs.lines() {
        let mut parts = line.splitn(3, ' ');
        let (Some(object), Some(peeled), Some(refname)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let id = if peeled.is_empty() { object } else { peeled };
        if refname == MAINLINE_REF {
            mainline = Some(id);
        }
        aliases.entry(id).or_default().insert(strip_namespace(refname));
    }

    let mut records: Vec<BackupRecord> = commits
        .lines()
        .map(|id| {
            let names = aliases.remove(id).unwrap_or_default();
            BackupRecord::new(id, names, [Location::Local])
        })
        .collect();

    // The mainline leads so that alias lookups resolve to it first
    if let Some(pos) = mainline.and_then(|id| records.iter().position(|r| r.name() == id)) {
        records[..=pos].rotate_right(1);
    }
    records
}

/// Build remote records from `ls-remote` output (`<id>\t<refname>` per line),
/// one per commit in first-seen order. Annotated tags are listed under the
/// commit they peel to, matching what `local_records` reports.
fn remote_records(output: &ProcessOutput) -> Vec<BackupRecord> {
    let mut refs: Vec<(&str, &str)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for line in output.lines() {
        let Some((id, refname)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let refname = refname.trim();
        match refname.strip_suffix("^{}") {
            Some(tag) => {
                if let Some(&i) = index.get(tag) {
                    refs[i].1 = id;
                }
            }
            None => {
                index.insert(refname, refs.len());
                refs.push((refname, id));
            }
        }
    }

    let mut order: Vec<&str> = Vec::new();
    let mut aliases: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for (refname, id) in refs {
        if !aliases.contains_key(id) {
            order.push(id);
        }
        aliases.entry(id).or_default().insert(strip_namespace(refname));
    }

    order
        .into_iter()
        .map(|id| {
            let names = aliases.remove(id).unwrap_or_default();
            BackupRecord::new(id, names, [Location::Remote])
        })
        .collect()
}
