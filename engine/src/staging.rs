//! Symlink staging.
//!
//! The backend records a symbolic link as a link, not as the content it points
//! at. For the duration of one backend operation every symlink on the way from
//! a desired path up to the work tree root is swapped for a hard link to its
//! resolved target, so the backend sees ordinary file content.
//!
//! [`SymlinkStager::acquire`] returns a [`StagingMap`] that puts the original
//! links back when released or dropped, so every exit path of the enclosing
//! operation (including `?` returns and unwinding) restores the live tree.
//! Abrupt termination of the process is not covered.

use crate::error::EngineError;
use crate::fs_ops;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// One swapped symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLink {
    /// Absolute path of the link inside the work tree
    pub path: PathBuf,
    /// Canonical file the link resolved to
    pub target: PathBuf,
    /// Link text exactly as it was stored
    pub link_text: PathBuf,
}

/// Swaps symlinks for hard links below one work tree root.
#[derive(Debug, Clone)]
pub struct SymlinkStager {
    root: PathBuf,
}

impl SymlinkStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SymlinkStager { root: root.into() }
    }

    /// Swap every symlink found between each desired path and the root.
    ///
    /// Paths are relative to the root. Symlinks to directories cannot be
    /// hard linked and are left alone. A link whose target cannot be hard
    /// linked (e.g. it lives on another filesystem) is put back immediately
    /// and skipped.
    ///
    /// # Errors
    /// Returns `EngineError::Staging` if a link cannot be inspected or
    /// removed. Links already swapped by this call are restored first.
    pub fn acquire<S: AsRef<str>>(&self, paths: &[S]) -> Result<StagingMap, EngineError> {
        let mut map = StagingMap::empty();
        let mut visited: HashSet<PathBuf> = HashSet::new();

        for path in paths {
            let mut current = Some(PathBuf::from(path.as_ref()));

            while let Some(relative) = current {
                if relative.as_os_str().is_empty() || !visited.insert(relative.clone()) {
                    break;
                }

                let absolute = self.root.join(&relative);
                if fs_ops::is_symlink(&absolute) {
                    if let Some(link) = swap_for_hard_link(&absolute)? {
                        map.entries.push(link);
                    }
                }

                current = relative.parent().map(Path::to_path_buf);
            }
        }

        if !map.entries.is_empty() {
            debug!(count = map.entries.len(), "staged symlinks as hard links");
        }
        Ok(map)
    }
}

fn swap_for_hard_link(path: &Path) -> Result<Option<StagedLink>, EngineError> {
    let link_text = fs::read_link(path).map_err(|e| EngineError::staging(path, e))?;
    let target = match fs::canonicalize(path) {
        Ok(target) => target,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "dangling symlink left in place");
            return Ok(None);
        }
    };

    if target.is_dir() {
        debug!(path = %path.display(), "symlinked directory left in place");
        return Ok(None);
    }

    fs::remove_file(path).map_err(|e| EngineError::staging(path, e))?;

    if let Err(e) = fs::hard_link(&target, path) {
        warn!(
            path = %path.display(),
            target = %target.display(),
            error = %e,
            "cannot hard link symlink target; keeping the symlink"
        );
        symlink(&link_text, path).map_err(|e| EngineError::staging(path, e))?;
        return Ok(None);
    }

    Ok(Some(StagedLink {
        path: path.to_path_buf(),
        target,
        link_text,
    }))
}

/// Symlinks currently swapped for hard links.
///
/// Dropping the map without calling [`StagingMap::release`] still restores
/// the links; errors are then only logged.
#[derive(Debug)]
pub struct StagingMap {
    entries: Vec<StagedLink>,
    released: bool,
}

impl StagingMap {
    fn empty() -> Self {
        StagingMap {
            entries: Vec::new(),
            released: false,
        }
    }

    pub fn entries(&self) -> &[StagedLink] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restore every original symlink.
    ///
    /// If the backend replaced a hard link with a new file (a restore writes
    /// fresh files), that content is copied into the link target first so
    /// the restore reaches the real file.
    ///
    /// # Errors
    /// Returns the first failure; the remaining links are still attempted.
    pub fn release(mut self) -> Result<(), EngineError> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> Result<(), EngineError> {
        self.released = true;
        let mut first_error = None;

        for link in self.entries.iter().rev() {
            if let Err(e) = restore_link(link) {
                error!(path = %link.path.display(), error = %e, "failed to restore symlink");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for StagingMap {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.restore_all();
        }
    }
}

fn restore_link(link: &StagedLink) -> Result<(), EngineError> {
    if fs_ops::is_regular_file(&link.path)
        && !fs_ops::is_symlink(&link.path)
        && !fs_ops::same_file(&link.path, &link.target)
    {
        fs_ops::copy_file_with_metadata(&link.path, &link.target)?;
    }

    match fs::remove_file(&link.path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(EngineError::staging(&link.path, e)),
    }

    fs_ops::ensure_parent_dir_exists(&link.path)?;
    symlink(&link.link_text, &link.path).map_err(|e| EngineError::staging(&link.path, e))
}
