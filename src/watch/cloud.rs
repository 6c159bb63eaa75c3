use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{FileChangeEvent, SourceWatcher};
use crate::filelist::FileList;
use crate::fsutil;

const CHANNEL_CAPACITY: usize = 1024;

/// Rescan-by-diff backend for cloud-mounted roots where OS notifications
/// are unreliable or absent.
///
/// Each tick captures a fresh snapshot and diffs it against the previous
/// one, emitting `Deleted` for vanished paths and `Created` for new ones.
/// A consumer that fails to read a just-announced file (bytes still
/// downloading) calls `feedback_creation_error`; the path is then removed
/// from the committed snapshot so the next tick re-announces it.
pub struct CloudWatcher {
    root: PathBuf,
    recursive: bool,
    interval: Duration,
    events_tx: mpsc::Sender<FileChangeEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<FileChangeEvent>>>,
    // Survives stop/start cycles so a resumed watcher diffs against what
    // it last announced instead of re-announcing the whole root.
    snapshot: Arc<Mutex<Option<FileList>>>,
    retries: Arc<StdMutex<Vec<PathBuf>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl CloudWatcher {
    pub fn new(root: &Path, recursive: bool, interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            root: fsutil::normalize(root),
            recursive,
            interval,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            snapshot: Arc::new(Mutex::new(None)),
            retries: Arc::new(StdMutex::new(Vec::new())),
            scanner: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// One scan tick, exposed for tests; ticks never overlap because they
    /// all run on the single scanner task.
    pub async fn scan_once(&self) -> Result<()> {
        scan_once(
            &self.root,
            self.recursive,
            &self.events_tx,
            &self.snapshot,
            &self.retries,
        )
        .await
    }
}

async fn scan_once(
    root: &Path,
    recursive: bool,
    events_tx: &mpsc::Sender<FileChangeEvent>,
    snapshot: &Mutex<Option<FileList>>,
    retries: &StdMutex<Vec<PathBuf>>,
) -> Result<()> {
    let current = FileList::capture(root, recursive).await?;

    // Only consume the retry list once a snapshot was taken; a failed
    // capture must not eat pending retries.
    let retry: Vec<PathBuf> = match retries.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => Vec::new(),
    };

    let mut guard = snapshot.lock().await;
    match guard.as_mut() {
        Some(previous) => {
            for path in &retry {
                previous.remove(path);
            }
            let diff = previous.compare(&current);
            for path in diff.only_in_self {
                debug!("cloud scan: {} vanished", path.display());
                let _ = events_tx.send(FileChangeEvent::Deleted { path }).await;
            }
            for path in diff.only_in_other {
                debug!("cloud scan: {} appeared", path.display());
                let _ = events_tx.send(FileChangeEvent::Created { path }).await;
            }
        }
        None => {
            // First scan establishes the baseline; only paths explicitly
            // fed back (a failed read during startup ingestion) are
            // announced, everything else was already indexed by the scan.
            for path in retry {
                if current.contains(&path) {
                    let _ = events_tx.send(FileChangeEvent::Created { path }).await;
                }
            }
        }
    }
    *guard = Some(current);
    Ok(())
}

#[async_trait]
impl SourceWatcher for CloudWatcher {
    async fn start(&self) -> Result<()> {
        let mut scanner = self.scanner.lock().await;
        if scanner.is_some() {
            debug!("cloud watcher for {} already running", self.root.display());
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let root = self.root.clone();
        let recursive = self.recursive;
        let events_tx = self.events_tx.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let retries = Arc::clone(&self.retries);
        let period = self.interval;

        info!(
            "polling {} every {}s",
            root.display(),
            period.as_secs_f64()
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scan_once(&root, recursive, &events_tx, &snapshot, &retries).await {
                            warn!("cloud scan of {} failed: {e:#}", root.display());
                        }
                    }
                }
            }
        });

        *scanner = Some(handle);
        *self.shutdown.lock().await = Some(shutdown_tx);
        Ok(())
    }

    async fn stop(&self) -> bool {
        // Cancels the pending timer. A scan already in flight finishes on
        // its own; its late announcements are absorbed downstream by the
        // (size, mtime) coalescer and idempotent ingestion.
        let handle = self.scanner.lock().await.take();
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        handle.is_some()
    }

    fn feedback_creation_error(&self, path: &Path) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.push(fsutil::normalize(path));
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<FileChangeEvent>> {
        self.events_rx.lock().ok().and_then(|mut slot| slot.take())
    }
}
