use super::Directory;
use crate::error::{Error, Result};
use crate::util::fs::{copy_entry, remove_path, to_slash};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeKind {
    fn marker(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Removed => 'D',
            ChangeKind::Modified => 'M',
        }
    }
}

/// One changed path; directories carry a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File(String),
    Symlink(PathBuf),
}

/// Differences between a base snapshot and a later one.
#[derive(Debug, Clone)]
pub struct Changeset {
    before: Directory,
    after: Directory,
    changes: Vec<Change>,
}

impl Changeset {
    pub fn compute(before: &Directory, after: &Directory) -> Result<Self> {
        let old = scan(before.path())?;
        let new = scan(after.path())?;
        let mut changes = Vec::new();

        for (path, entry) in &new {
            match old.get(path) {
                None => changes.push(Change {
                    kind: ChangeKind::Added,
                    path: display_path(path, entry),
                }),
                Some(previous) if previous != entry => {
                    // A directory replaced by a file (or the reverse) shows as both.
                    if matches!(previous, Entry::Dir) != matches!(entry, Entry::Dir) {
                        changes.push(Change {
                            kind: ChangeKind::Removed,
                            path: display_path(path, previous),
                        });
                        changes.push(Change {
                            kind: ChangeKind::Added,
                            path: display_path(path, entry),
                        });
                    } else {
                        changes.push(Change {
                            kind: ChangeKind::Modified,
                            path: display_path(path, entry),
                        });
                    }
                }
                Some(_) => {}
            }
        }

        for (path, entry) in &old {
            if !new.contains_key(path) {
                changes.push(Change {
                    kind: ChangeKind::Removed,
                    path: display_path(path, entry),
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));

        Ok(Self {
            before: before.clone(),
            after: after.clone(),
            changes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn added_paths(&self) -> Vec<&str> {
        self.paths(ChangeKind::Added)
    }

    pub fn removed_paths(&self) -> Vec<&str> {
        self.paths(ChangeKind::Removed)
    }

    pub fn modified_paths(&self) -> Vec<&str> {
        self.paths(ChangeKind::Modified)
    }

    fn paths(&self, kind: ChangeKind) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|change| change.kind == kind)
            .map(|change| change.path.as_str())
            .collect()
    }

    /// Drop changes at or below any of the root-relative `paths`.
    pub fn excluding(mut self, paths: &[&str]) -> Self {
        self.changes.retain(|change| {
            let path = change.path.trim_end_matches('/');
            !paths.iter().any(|excluded| {
                let excluded = excluded.trim_end_matches('/');
                path == excluded
                    || path
                        .strip_prefix(excluded)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        });
        self
    }

    pub fn before(&self) -> &Directory {
        &self.before
    }

    pub fn after(&self) -> &Directory {
        &self.after
    }

    /// Apply the changes onto `dest`, usually the host copy of the base snapshot.
    pub fn export(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|err| Error::io(dest, err))?;

        // Deepest removals first so directories are already empty of tracked entries.
        for change in self.changes.iter().rev() {
            if change.kind == ChangeKind::Removed {
                remove_path(&dest.join(change.path.trim_end_matches('/')))?;
            }
        }

        for change in &self.changes {
            if change.kind == ChangeKind::Removed {
                continue;
            }
            let relative = change.path.trim_end_matches('/');
            copy_entry(&self.after.path().join(relative), &dest.join(relative))?;
        }

        Ok(())
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            writeln!(f, "{} {}", change.kind.marker(), change.path)?;
        }
        Ok(())
    }
}

fn display_path(path: &str, entry: &Entry) -> String {
    match entry {
        Entry::Dir => format!("{path}/"),
        _ => path.to_string(),
    }
}

fn scan(root: &Path) -> Result<BTreeMap<String, Entry>> {
    let mut entries = BTreeMap::new();
    if !root.exists() {
        return Ok(entries);
    }

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            Error::io(path, err.into())
        })?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let file_type = entry.file_type();

        let value = if file_type.is_dir() {
            Entry::Dir
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|err| Error::io(entry.path(), err))?;
            Entry::Symlink(target)
        } else {
            let digest = crate::installers::compute_sha256(entry.path())?;
            Entry::File(crate::installers::format_digest(&digest))
        };

        entries.insert(to_slash(relative), value);
    }

    Ok(entries)
}
