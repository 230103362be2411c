//! File selection.
//!
//! Turns include and exclude lists into the sorted set of work-tree-relative
//! regular files handed to a backup. Directories in the include list are
//! expanded recursively; an excluded directory removes everything below it.

use crate::error::EngineError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Resolve `include` minus `exclude` to the files a backup should record.
///
/// Paths may be relative to `work_tree` or absolute below it. Missing paths
/// and paths outside the work tree are skipped with a warning. Symlinks to
/// files count as files; symlinked directories are not descended into, and
/// nested `.git` directories are never expanded.
///
/// # Errors
/// Returns `EngineError::Io` if an included directory cannot be read.
pub fn resolve_files<I, E>(work_tree: &Path, include: I, exclude: E) -> Result<Vec<String>, EngineError>
where
    I: IntoIterator,
    I::Item: AsRef<Path>,
    E: IntoIterator,
    E::Item: AsRef<Path>,
{
    let excluded: Vec<PathBuf> = exclude
        .into_iter()
        .filter_map(|p| relative_to(work_tree, p.as_ref()))
        .collect();
    let is_excluded = |rel: &Path| excluded.iter().any(|ex| rel.starts_with(ex));

    let mut files = BTreeSet::new();

    for path in include {
        let Some(relative) = relative_to(work_tree, path.as_ref()) else {
            warn!(path = %path.as_ref().display(), "path is outside the work tree; skipped");
            continue;
        };
        if is_excluded(&relative) {
            continue;
        }

        let absolute = work_tree.join(&relative);
        match fs::symlink_metadata(&absolute) {
            Ok(meta) if meta.is_dir() => {
                collect_dir(&absolute, &relative, &is_excluded, &mut files)?;
            }
            Ok(_) if absolute.is_file() => {
                files.insert(relative);
            }
            Ok(_) => debug!(path = %relative.display(), "not a regular file; skipped"),
            Err(e) => warn!(path = %relative.display(), error = %e, "cannot read path; skipped"),
        }
    }

    debug!(count = files.len(), "resolved backup file set");
    Ok(files
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect())
}

fn collect_dir(
    path: &Path,
    rel_path: &Path,
    is_excluded: &dyn Fn(&Path) -> bool,
    files: &mut BTreeSet<PathBuf>,
) -> Result<(), EngineError> {
    let entries = fs::read_dir(path).map_err(|e| EngineError::io(path, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(path, e))?;
        let file_name = entry.file_name();
        let rel_full_path = rel_path.join(&file_name);
        if is_excluded(&rel_full_path) {
            continue;
        }

        let entry_path = entry.path();
        let file_type = entry.file_type().map_err(|e| EngineError::io(&entry_path, e))?;

        if file_type.is_dir() {
            if file_name != ".git" {
                collect_dir(&entry_path, &rel_full_path, is_excluded, files)?;
            }
        } else if entry_path.is_file() {
            files.insert(rel_full_path);
        }
    }

    Ok(())
}

/// Normalise `path` to a plain relative path below `work_tree`.
fn relative_to(work_tree: &Path, path: &Path) -> Option<PathBuf> {
    let stripped = if path.is_absolute() {
        path.strip_prefix(work_tree).ok()?
    } else {
        path
    };

    let mut out = PathBuf::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
