use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod cloud;
pub mod local;

pub use cloud::CloudWatcher;
pub use local::LocalWatcher;

/// A change observed under a watched root.
///
/// Paths are absolute and forward-slash normalized. Per watcher, events
/// are delivered in emission order; no ordering holds across watchers.
#[derive(Debug, Clone)]
pub enum FileChangeEvent {
    Created { path: PathBuf },
    Changed { path: PathBuf },
    Deleted { path: PathBuf },
    Renamed { path: PathBuf, old_path: PathBuf },
}

impl FileChangeEvent {
    /// The path the event primarily concerns (the new path for renames).
    pub fn path(&self) -> &Path {
        match self {
            FileChangeEvent::Created { path }
            | FileChangeEvent::Changed { path }
            | FileChangeEvent::Deleted { path }
            | FileChangeEvent::Renamed { path, .. } => path,
        }
    }
}

/// Uniform capability set over the two watcher backends.
///
/// Each instance is bound to a single root for its lifetime.
#[async_trait]
pub trait SourceWatcher: Send + Sync {
    /// Start observing the root. Calling start on a running watcher is a
    /// no-op that leaves the existing observer untouched.
    async fn start(&self) -> Result<()>;

    /// Stop observing. Once this resolves the backend emits no further
    /// events for the root. Returns whether the watcher was running.
    async fn stop(&self) -> bool;

    /// Hint that a freshly reported path could not be read and should be
    /// re-reported on the next cycle. Only meaningful for the polling
    /// backend; the OS backend re-notifies on the next mutation anyway.
    fn feedback_creation_error(&self, path: &Path);

    /// Take the event stream. The stream is created once per watcher;
    /// subsequent calls return `None`.
    fn take_events(&self) -> Option<mpsc::Receiver<FileChangeEvent>>;
}

/// Pick the backend for a root: OS change notifications for local
/// directories, periodic rescan-by-diff for cloud-mounted ones.
pub fn create_watcher(
    root: &Path,
    recursive: bool,
    cloud: bool,
    scan_interval: Duration,
) -> Arc<dyn SourceWatcher> {
    if cloud {
        Arc::new(CloudWatcher::new(root, recursive, scan_interval))
    } else {
        Arc::new(LocalWatcher::new(root, recursive))
    }
}
