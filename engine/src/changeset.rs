//! Changeset computation.
//!
//! Given the desired file set, the paths tracked by the last backup and the
//! backend's working-tree status, work out the minimal list of add/modify/
//! delete operations that makes the next backup match the desired set.
//!
//! The status report alone is not enough: files that were never staged
//! before (first backup, or an interrupted run) show up in neither status nor
//! the tracked tree listing, so a final pass picks them up from the desired
//! set itself.

use crate::model::{Change, ChangeAction};
use std::collections::HashSet;

/// How the backend reports one changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    Unchanged,
    Modified,
    Added,
    Untracked,
    Copied,
    Deleted,
    Renamed { from: String },
}

/// One entry of the backend's working-tree status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub kind: StatusKind,
    pub path: String,
}

impl StatusEntry {
    pub fn new(kind: StatusKind, path: impl Into<String>) -> Self {
        StatusEntry {
            kind,
            path: path.into(),
        }
    }
}

/// Parse `git status --porcelain -z` output.
///
/// The first non-blank column of the two-letter code decides the kind, so
/// both staged and unstaged changes count. Rename and copy entries are
/// followed by a separate field holding the original path.
pub fn parse_porcelain_z(output: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut fields = output.split('\0').filter(|f| !f.is_empty());

    while let Some(field) = fields.next() {
        if field.len() < 4 {
            continue;
        }
        let (code, path) = field.split_at(3);
        let mut code_chars = code.chars();
        let x = code_chars.next().unwrap_or(' ');
        let y = code_chars.next().unwrap_or(' ');
        let status = if x != ' ' { x } else { y };
        let has_origin = matches!(x, 'R' | 'C') || matches!(y, 'R' | 'C');
        let origin = if has_origin { fields.next() } else { None };

        let kind = match status {
            ' ' => StatusKind::Unchanged,
            'M' | 'T' | 'U' => StatusKind::Modified,
            'A' => StatusKind::Added,
            '?' => StatusKind::Untracked,
            'D' => StatusKind::Deleted,
            'R' => match origin {
                Some(from) => StatusKind::Renamed {
                    from: from.to_string(),
                },
                None => StatusKind::Added,
            },
            'C' => StatusKind::Copied,
            // Ignored ('!') and anything unknown
            _ => continue,
        };

        entries.push(StatusEntry::new(kind, path));
    }

    entries
}

/// Compute the ordered, deduplicated changeset.
///
/// * `desired` - regular files that should be in the next backup
/// * `status` - working-tree status entries
/// * `tracked` - paths in the last committed tree
/// * `is_regular_file` - whether a desired path still exists as a regular file
pub fn resolve<F>(
    desired: &[String],
    status: &[StatusEntry],
    tracked: &[String],
    is_regular_file: F,
) -> Vec<Change>
where
    F: Fn(&str) -> bool,
{
    let wanted: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let mut handled: HashSet<&str> = HashSet::new();
    let mut changes = Vec::new();

    for entry in status {
        let path = entry.path.as_str();
        match &entry.kind {
            StatusKind::Unchanged => continue,
            StatusKind::Renamed { from } => {
                if wanted.contains(path) {
                    changes.push(Change::new(ChangeAction::Add, path));
                }
                changes.push(Change::new(ChangeAction::Delete, from.as_str()));
                handled.insert(from.as_str());
            }
            StatusKind::Modified => {
                if wanted.contains(path) {
                    changes.push(Change::new(ChangeAction::Modify, path));
                }
            }
            StatusKind::Added | StatusKind::Untracked | StatusKind::Copied => {
                if wanted.contains(path) {
                    changes.push(Change::new(ChangeAction::Add, path));
                }
            }
            StatusKind::Deleted => {
                changes.push(Change::new(ChangeAction::Delete, path));
            }
        }
        handled.insert(path);
    }

    for path in tracked {
        if !wanted.contains(path.as_str()) {
            changes.push(Change::new(ChangeAction::Delete, path.as_str()));
        }
        handled.insert(path.as_str());
    }

    for path in desired {
        if !handled.contains(path.as_str()) && is_regular_file(path) {
            changes.push(Change::new(ChangeAction::Add, path.as_str()));
        }
    }

    dedup_in_order(changes)
}

fn dedup_in_order(changes: Vec<Change>) -> Vec<Change> {
    let mut seen = HashSet::new();
    changes
        .into_iter()
        .filter(|change| seen.insert(change.clone()))
        .collect()
}
