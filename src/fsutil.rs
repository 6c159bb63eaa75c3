// src/fsutil.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Render a path in the forward-slash form used for every stored or
/// emitted path, including on Windows.
pub fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.contains('\\') {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Normalize a path to its forward-slash form.
pub fn normalize(path: &Path) -> PathBuf {
    PathBuf::from(to_slash(path))
}

/// Root-relative forward-slash path of `path`, or `None` when `path` is
/// not under `root`. Returns an empty string when the two are equal.
pub fn relative_slash(root: &Path, path: &Path) -> Option<String> {
    let root = to_slash(root);
    let path = to_slash(path);
    let root = root.trim_end_matches('/');

    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        return Some(String::new());
    }
    // Reject prefix matches on a partial component ("/media" vs "/mediafoo").
    rest.strip_prefix('/').map(str::to_string)
}

/// Create the parent directory of `path` (and any missing ancestors).
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_slash_replaces_backslashes() {
        assert_eq!(to_slash(Path::new(r"c:\media\a.mp4")), "c:/media/a.mp4");
        assert_eq!(to_slash(Path::new("/media/a.mp4")), "/media/a.mp4");
    }

    #[test]
    fn relative_slash_basic() {
        let root = Path::new("/m");
        assert_eq!(
            relative_slash(root, Path::new("/m/sub/a.mp4")),
            Some("sub/a.mp4".to_string())
        );
        assert_eq!(relative_slash(root, Path::new("/m")), Some(String::new()));
        assert_eq!(relative_slash(root, Path::new("/other/a.mp4")), None);
    }

    #[test]
    fn relative_slash_rejects_partial_component() {
        assert_eq!(relative_slash(Path::new("/m"), Path::new("/media/a.mp4")), None);
    }

    #[test]
    fn relative_slash_tolerates_trailing_separator() {
        assert_eq!(
            relative_slash(Path::new("/m/"), Path::new("/m/a.mp4")),
            Some("a.mp4".to_string())
        );
    }

    #[tokio::test]
    async fn ensure_parent_dir_creates_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a/b/c.mp4");
        ensure_parent_dir(&target).await.unwrap();
        assert!(target.parent().unwrap().is_dir());
        // Idempotent.
        ensure_parent_dir(&target).await.unwrap();
    }
}
