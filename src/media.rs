// src/media.rs
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::convert::Transcoder;
use crate::fsutil;

/// Extensions served by the index, lowercase with the leading dot.
pub const ACCEPTED_EXTENSIONS: [&str; 5] = [".mp4", ".mp3", ".jpeg", ".jpg", ".png"];

/// Category value for files sitting directly in the source root.
pub const ROOT_CATEGORY: &str = "ROOT";

/// Lowercase extension of `path` including the dot, or an empty string.
pub fn ext_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// Check whether a path carries one of the accepted media extensions.
pub fn is_acceptable(path: &Path) -> bool {
    ACCEPTED_EXTENSIONS.contains(&ext_lower(path).as_str())
}

/// Filename without its extension.
pub fn title_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Category of a file under `root`: `"ROOT"` for files directly in the
/// root, otherwise the root-relative directory path in forward-slash form.
pub fn category_for(root: &Path, path: &Path) -> String {
    let root = fsutil::normalize(root);
    let dir = match path.parent() {
        Some(dir) => fsutil::normalize(dir),
        None => return ROOT_CATEGORY.to_string(),
    };
    match fsutil::relative_slash(&root, &dir) {
        Some(rel) if !rel.is_empty() => rel,
        _ => ROOT_CATEGORY.to_string(),
    }
}

/// MIME type for an accepted extension.
pub fn mime_for(ext: &str) -> &'static str {
    match ext {
        ".mp3" => "audio/mpeg",
        ".mp4" => "video/mp4",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        _ => "video/mp4",
    }
}

/// Coarse media class used by the client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Photo,
}

impl MediaKind {
    pub fn from_ext(ext: &str) -> Self {
        match ext {
            ".mp3" => MediaKind::Audio,
            ".jpg" | ".jpeg" | ".png" => MediaKind::Photo,
            _ => MediaKind::Video,
        }
    }

    /// Single-letter protocol code: `v`, `a` or `p`.
    pub fn code(self) -> char {
        match self {
            MediaKind::Video => 'v',
            MediaKind::Audio => 'a',
            MediaKind::Photo => 'p',
        }
    }
}

/// One indexed file as observed on disk.
///
/// `path` is absolute and forward-slash normalized; it is the unique key
/// across all sources. `duration` is only meaningful for mp4/mp3 and is
/// derived through ffprobe at construction time.
#[derive(Debug, Clone, Serialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub ext: String,
    pub title: String,
    pub category: String,
    pub length: u64,
    pub date: i64,
    pub duration: f64,
}

impl MediaFile {
    /// Stat `path` and build the value, probing duration for mp4/mp3.
    ///
    /// A probe failure is an error: the caller decides whether to skip the
    /// file or to schedule a retry through the watcher feedback channel.
    pub async fn probe(root: &Path, path: &Path, transcoder: &dyn Transcoder) -> Result<Self> {
        let path = fsutil::normalize(path);
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?;
        let ext = ext_lower(&path);
        let duration = if ext == ".mp4" || ext == ".mp3" {
            transcoder
                .duration(&path)
                .await
                .with_context(|| format!("cannot probe duration of {}", path.display()))?
        } else {
            0.0
        };
        Ok(Self {
            ext,
            title: title_of(&path),
            category: category_for(root, &path),
            length: meta.len(),
            date: mtime_millis(&meta),
            duration,
            path,
        })
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::from_ext(&self.ext)
    }

    pub fn mime(&self) -> &'static str {
        mime_for(&self.ext)
    }
}

/// Modification time in milliseconds since the Unix epoch.
pub fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
