// src/filelist.rs
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::fsutil;

/// Snapshot of the regular files under a root, keyed by their
/// root-relative forward-slash path. Two snapshots compare by exact
/// string equality on those relative paths.
#[derive(Debug, Clone)]
pub struct FileList {
    root: PathBuf,
    entries: HashSet<String>,
}

/// Result of diffing two snapshots, resolved back to absolute paths
/// against each side's own root.
#[derive(Debug, Default)]
pub struct FileListDiff {
    pub only_in_self: Vec<PathBuf>,
    pub only_in_other: Vec<PathBuf>,
}

impl FileList {
    /// Walk `root` (optionally recursing) and capture every regular file.
    ///
    /// Failure to read the root itself is an error; unreadable
    /// subdirectories are logged and skipped so one bad directory cannot
    /// hide the rest of the tree.
    pub async fn capture(root: &Path, recursive: bool) -> Result<Self> {
        let root = fsutil::normalize(root);
        let mut entries = HashSet::new();
        let mut pending = vec![root.clone()];
        let mut first = true;

        while let Some(dir) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if first => {
                    return Err(e)
                        .with_context(|| format!("failed to read directory {}", dir.display()));
                }
                Err(e) => {
                    warn!("skipping unreadable directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            first = false;

            while let Some(entry) = read_dir
                .next_entry()
                .await
                .with_context(|| format!("failed to read directory {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(e) => {
                        warn!("cannot stat {}: {}", path.display(), e);
                        continue;
                    }
                };
                if file_type.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                } else if file_type.is_file() {
                    if let Some(rel) = fsutil::relative_slash(&root, &fsutil::normalize(&path)) {
                        entries.insert(rel);
                    }
                }
            }
        }

        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the snapshot holds the given absolute path.
    pub fn contains(&self, path: &Path) -> bool {
        match fsutil::relative_slash(&self.root, &fsutil::normalize(path)) {
            Some(rel) => self.entries.contains(&rel),
            None => false,
        }
    }

    /// Drop an absolute path from the snapshot. Tolerant of paths that
    /// are absent or outside the root.
    pub fn remove(&mut self, path: &Path) {
        if let Some(rel) = fsutil::relative_slash(&self.root, &fsutil::normalize(path)) {
            self.entries.remove(&rel);
        }
    }

    /// All captured files as absolute paths, sorted for deterministic
    /// iteration order.
    pub fn absolute_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.entries.iter().map(|rel| self.root.join(rel)).collect();
        paths.sort();
        paths
    }

    /// Set-difference against another snapshot.
    pub fn compare(&self, other: &FileList) -> FileListDiff {
        let mut only_in_self: Vec<PathBuf> = self
            .entries
            .difference(&other.entries)
            .map(|rel| self.root.join(rel))
            .collect();
        let mut only_in_other: Vec<PathBuf> = other
            .entries
            .difference(&self.entries)
            .map(|rel| other.root.join(rel))
            .collect();
        only_in_self.sort();
        only_in_other.sort();
        FileListDiff {
            only_in_self,
            only_in_other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch(path: &Path) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn capture_recursive_and_flat() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.mp4")).await;
        touch(&tmp.path().join("sub/b.mp4")).await;

        let recursive = FileList::capture(tmp.path(), true).await.unwrap();
        assert_eq!(recursive.len(), 2);
        assert!(recursive.contains(&tmp.path().join("sub/b.mp4")));

        let flat = FileList::capture(tmp.path(), false).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert!(!flat.contains(&tmp.path().join("sub/b.mp4")));
    }

    #[tokio::test]
    async fn capture_missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let gone = tmp.path().join("nope");
        assert!(FileList::capture(&gone, true).await.is_err());
    }

    #[tokio::test]
    async fn compare_reports_both_sides() {
        let left_dir = tempfile::tempdir().unwrap();
        let right_dir = tempfile::tempdir().unwrap();
        touch(&left_dir.path().join("both.mp4")).await;
        touch(&left_dir.path().join("left-only.mp4")).await;
        touch(&right_dir.path().join("both.mp4")).await;
        touch(&right_dir.path().join("sub/right-only.mp4")).await;

        let left = FileList::capture(left_dir.path(), true).await.unwrap();
        let right = FileList::capture(right_dir.path(), true).await.unwrap();

        let diff = left.compare(&right);
        assert_eq!(diff.only_in_self, vec![left_dir.path().join("left-only.mp4")]);
        assert_eq!(
            diff.only_in_other,
            vec![right_dir.path().join("sub/right-only.mp4")]
        );
    }

    #[tokio::test]
    async fn remove_is_tolerant() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.mp4")).await;

        let mut list = FileList::capture(tmp.path(), true).await.unwrap();
        list.remove(&tmp.path().join("a.mp4"));
        list.remove(&tmp.path().join("a.mp4"));
        list.remove(Path::new("/not/under/root.mp4"));
        assert!(list.is_empty());
    }
}
