//! gitbak - Command-line interface for the backup engine.
//!
//! Parses arguments, merges them over an optional JSON profile, and runs one
//! storage engine operation. Record listings and notices go to stdout; logs
//! go to stderr.
//!
//! Exit codes: 0 on success, 1 when the operation reported failure, 2 on
//! error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    resolve_files, BackupRecord, GitBackend, RecordScope, Reporter, RepositoryConfig, StorageEngine,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// gitbak - versioned backups of selected files, stored in git
#[derive(Parser, Debug)]
#[command(name = "gitbak")]
#[command(version)]
#[command(about = "Back up, restore and synchronise file snapshots using git")]
struct Args {
    /// JSON profile with repository settings and include/exclude lists
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup repository path (relative paths resolve against the work tree)
    #[arg(long, global = true, value_name = "PATH")]
    repository: Option<PathBuf>,

    /// Root of the protected files
    #[arg(long, global = true, value_name = "PATH")]
    work_tree: Option<PathBuf>,

    /// Remote repository URL
    #[arg(long = "remote-url", global = true, value_name = "URL")]
    remote: Option<String>,

    /// Remote branch receiving the mainline
    #[arg(long, global = true, value_name = "NAME")]
    branch: Option<String>,

    /// File or directory to back up (repeatable)
    #[arg(long, short = 'i', global = true, value_name = "PATH")]
    include: Vec<PathBuf>,

    /// File or directory to leave out (repeatable)
    #[arg(long, short = 'x', global = true, value_name = "PATH")]
    exclude: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Print listings and notices as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Record the selected files as a new backup
    Backup {
        /// Commit message
        #[arg(long, short = 'm')]
        message: Option<String>,
    },
    /// Make the selected files match a local backup
    Restore {
        /// Backup name or alias
        reference: String,
    },
    /// Send local backups to the remote
    Upload,
    /// Bring a remote backup into the local repository
    Fetch {
        /// Backup name or alias
        reference: String,
    },
    /// Drop disposable refs and old history
    Prune,
    /// List known backups (local and remote by default)
    List {
        #[arg(long, conflicts_with = "remote_only")]
        local: bool,
        #[arg(long = "remote", id = "remote_only")]
        remote: bool,
    },
    /// Back up, then upload
    Push {
        #[arg(long, short = 'm')]
        message: Option<String>,
    },
    /// Fetch, then restore
    Pull {
        reference: String,
    },
}

/// Contents of a `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Profile {
    #[serde(flatten)]
    repository: RepositoryConfig,
    include: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
}

impl Profile {
    fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid profile {}", path.display()))
    }

    /// Apply command line values over the profile.
    fn with_overrides(mut self, args: &Args) -> Self {
        if let Some(repository) = &args.repository {
            self.repository.repository = repository.clone();
        }
        if let Some(work_tree) = &args.work_tree {
            self.repository.work_tree = work_tree.clone();
        }
        if let Some(remote) = &args.remote {
            self.repository.remote = Some(remote.clone());
        }
        if let Some(branch) = &args.branch {
            self.repository.branch = branch.clone();
        }
        if !args.include.is_empty() {
            self.include = args.include.clone();
        }
        self.exclude.extend(args.exclude.iter().cloned());
        self
    }
}

/// Prints engine notices and listings to stdout
struct ConsoleReporter {
    json: bool,
}

impl Reporter for ConsoleReporter {
    fn on_notice(&self, message: &str) {
        if self.json {
            println!("{}", serde_json::json!({ "notice": message }));
        } else {
            println!("{message}");
        }
    }

    fn on_records(&self, scope: RecordScope, records: &[BackupRecord]) {
        if self.json {
            let scope = scope.to_string().to_lowercase();
            println!("{}", serde_json::json!({ "scope": scope, "records": records }));
            return;
        }

        println!("{scope} backups:");
        for record in records {
            println!("  {record}");
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<bool> {
    let profile = match &args.config {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    }
    .with_overrides(args);

    let backend = GitBackend::new(profile.repository.clone()).context("Invalid configuration")?;
    let reporter = Box::new(ConsoleReporter { json: args.json });
    let mut storage = StorageEngine::new(backend, reporter);

    let ok = match &args.command {
        Command::Backup { message } => {
            let files = selected_files(&profile)?;
            storage.backup(&files, message.as_deref())?
        }
        Command::Restore { reference } => storage.restore(reference)?,
        Command::Upload => storage.upload()?,
        Command::Fetch { reference } => storage.fetch(reference)?,
        Command::Prune => storage.prune()?,
        Command::List { local, remote } => {
            match (*local, *remote) {
                (true, _) => storage.list_local()?,
                (_, true) => storage.list_remote()?,
                _ => storage.list_all()?,
            };
            true
        }
        Command::Push { message } => {
            let files = selected_files(&profile)?;
            storage.backup(&files, message.as_deref())? && storage.upload()?
        }
        Command::Pull { reference } => storage.fetch(reference)? && storage.restore(reference)?,
    };

    Ok(ok)
}

/// Resolve the profile's include/exclude lists below the work tree.
///
/// The backup repository itself is always excluded.
fn selected_files(profile: &Profile) -> Result<Vec<String>> {
    let config = &profile.repository;
    let work_tree = config.resolved_work_tree()?;
    let repository = config.resolved_repository()?;

    let exclude = profile
        .exclude
        .iter()
        .map(|p| p.as_path())
        .chain(std::iter::once(repository.as_path()));
    let files = resolve_files(&work_tree, &profile.include, exclude)?;
    debug!(count = files.len(), "selected files");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(work_tree: &Path, command: Command) -> Args {
        Args {
            config: None,
            repository: None,
            work_tree: Some(work_tree.to_path_buf()),
            remote: None,
            branch: None,
            include: Vec::new(),
            exclude: Vec::new(),
            verbose: false,
            json: false,
            command,
        }
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "gitbak", "backup", "-m", "nightly", "--include", "etc", "--remote-url", "/srv/remote.git",
        ])
        .expect("Failed to parse");

        assert_eq!(args.include, vec![PathBuf::from("etc")]);
        assert_eq!(args.remote.as_deref(), Some("/srv/remote.git"));
        assert!(matches!(args.command, Command::Backup { message: Some(ref m) } if m == "nightly"));
    }

    #[test]
    fn test_cli_list_scopes_conflict() {
        assert!(Args::try_parse_from(["gitbak", "list", "--local", "--remote"]).is_err());
        let args = Args::try_parse_from(["gitbak", "list", "--remote"]).expect("Failed to parse");
        assert!(matches!(args.command, Command::List { local: false, remote: true }));
    }

    #[test]
    fn test_cli_backup_with_nothing_selected() {
        let work_tree = TempDir::new().expect("Failed to create temp dir");

        let args = args(work_tree.path(), Command::Backup { message: None });
        let result = run_cli(&args).expect("Backup of nothing should not error");

        assert!(!result, "Empty backup should report failure");
        assert!(!work_tree.path().join("tmp/backup.git").exists());
    }

    #[test]
    fn test_cli_rejects_invalid_branch() {
        let work_tree = TempDir::new().expect("Failed to create temp dir");

        let mut args = args(work_tree.path(), Command::Prune);
        args.branch = Some("-bad".to_string());

        assert!(run_cli(&args).is_err(), "CLI should reject a branch starting with '-'");
    }

    #[test]
    fn test_cli_rejects_missing_profile() {
        let work_tree = TempDir::new().expect("Failed to create temp dir");

        let mut args = args(work_tree.path(), Command::Upload);
        args.config = Some(work_tree.path().join("missing.json"));

        assert!(run_cli(&args).is_err(), "CLI should reject a missing profile");
    }

    #[test]
    fn test_profile_overrides() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("profile.json");
        fs::write(
            &path,
            r#"{
                "work_tree": "/srv/app",
                "remote": "git@example.org:backups.git",
                "branch": "nightly",
                "include": ["etc", "data"],
                "exclude": ["data/cache"]
            }"#,
        )
        .expect("Failed to write profile");

        let mut args = args(Path::new("/srv/other"), Command::Upload);
        args.branch = Some("weekly".to_string());
        args.exclude = vec![PathBuf::from("etc/secret")];

        let profile = Profile::load(&path).expect("Failed to load").with_overrides(&args);
        assert_eq!(profile.repository.work_tree, PathBuf::from("/srv/other"));
        assert_eq!(profile.repository.remote.as_deref(), Some("git@example.org:backups.git"));
        assert_eq!(profile.repository.branch, "weekly");
        assert_eq!(profile.repository.repository, PathBuf::from("tmp/backup.git"));
        assert_eq!(profile.include, vec![PathBuf::from("etc"), PathBuf::from("data")]);
        assert_eq!(
            profile.exclude,
            vec![PathBuf::from("data/cache"), PathBuf::from("etc/secret")]
        );
    }

    #[test]
    fn test_selected_files_skip_repository() {
        let work_tree = TempDir::new().expect("Failed to create temp dir");
        let root = work_tree.path();
        fs::create_dir_all(root.join("tmp/backup.git")).unwrap();
        fs::write(root.join("tmp/backup.git/HEAD"), "ref: refs/heads/master").unwrap();
        fs::write(root.join("tmp/notes.txt"), "notes").unwrap();

        let mut args = args(root, Command::Backup { message: None });
        args.include = vec![PathBuf::from(".")];
        let profile = Profile::default().with_overrides(&args);

        let files = selected_files(&profile).expect("Failed to select files");
        assert_eq!(files, vec!["tmp/notes.txt"]);
    }

    #[test]
    fn test_cli_backup_and_list() {
        if !engine::process::git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let work_tree = TempDir::new().expect("Failed to create temp dir");
        let profile = work_tree.path().join("profile.json");
        fs::write(work_tree.path().join("app.conf"), "setting = 1").unwrap();
        fs::write(
            &profile,
            r#"{
                "identity": { "name": "Backup Test", "email": "backup@example.org" },
                "include": ["app.conf"]
            }"#,
        )
        .unwrap();

        let mut backup = args(work_tree.path(), Command::Backup { message: Some("first".to_string()) });
        backup.config = Some(profile.clone());
        assert!(run_cli(&backup).expect("Backup failed"));

        let mut list = args(work_tree.path(), Command::List { local: true, remote: false });
        list.config = Some(profile.clone());
        assert!(run_cli(&list).expect("List failed"));

        let mut upload = args(work_tree.path(), Command::Upload);
        upload.config = Some(profile);
        assert!(run_cli(&upload).is_err(), "Upload without a remote should error");
    }
}
