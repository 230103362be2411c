//! External process invocation.
//!
//! Every backend call goes through [`Git::run`]: the binary is started with an
//! argument vector (no shell, no interpolation), the repository location is
//! passed through per-command environment variables, and the result comes
//! back as a [`ProcessOutput`] carrying exit status and captured output.

use crate::config::CommitIdentity;
use crate::error::EngineError;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Output from one external command.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Human-readable command line, for diagnostics only
    pub command: String,
    /// Exit code (None if terminated by signal)
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into `EngineError::ProcessFailure`.
    pub fn ensure_success(self) -> Result<ProcessOutput, EngineError> {
        if self.success() {
            Ok(self)
        } else {
            Err(EngineError::ProcessFailure {
                command: self.command,
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }

    /// Stdout split on NUL, for `-z` output.
    pub fn nul_fields(&self) -> impl Iterator<Item = &str> {
        self.stdout.split('\0').filter(|field| !field.is_empty())
    }

    /// Non-empty stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|line| !line.is_empty())
    }
}

/// A `git` invocation context bound to one repository and work tree.
#[derive(Debug, Clone)]
pub struct Git {
    program: OsString,
    git_dir: PathBuf,
    work_tree: PathBuf,
    identity: Option<CommitIdentity>,
}

impl Git {
    pub fn new(git_dir: PathBuf, work_tree: PathBuf, identity: Option<CommitIdentity>) -> Self {
        Git {
            program: OsString::from("git"),
            git_dir,
            work_tree,
            identity,
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Run `git <args>` and capture its output. A non-zero exit is not an
    /// error here; callers decide through [`ProcessOutput::ensure_success`].
    ///
    /// # Errors
    /// Returns `EngineError::Spawn` if the binary could not be started.
    pub fn run<I, S>(&self, args: I) -> Result<ProcessOutput, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);

        if let Some(identity) = &self.identity {
            cmd.arg("-c")
                .arg(format!("user.name={}", identity.name))
                .arg("-c")
                .arg(format!("user.email={}", identity.email));
        }

        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command = describe(&self.program, &args);
        debug!(command = %command, "running backend command");

        let output = cmd
            .args(&args)
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.work_tree)
            .current_dir(&self.work_tree)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EngineError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        Ok(ProcessOutput {
            command,
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and require a zero exit.
    pub fn run_checked<I, S>(&self, args: I) -> Result<ProcessOutput, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(args)?.ensure_success()
    }
}

fn describe(program: &OsStr, args: &[OsString]) -> String {
    let mut parts = vec![program.to_string_lossy().into_owned()];
    parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// True if a `git` binary can be started.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
