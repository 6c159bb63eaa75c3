// src/source/mod.rs
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{RawDataConfig, SourceConfig};
use crate::convert::Transcoder;
use crate::filelist::FileList;
use crate::fsutil;
use crate::media::{self, MediaFile};
use crate::watch::{create_watcher, FileChangeEvent, SourceWatcher};

/// A change to a source's indexed file set, as delivered to the manager.
#[derive(Debug, Clone)]
pub enum MediaChange {
    Created(MediaFile),
    Changed(MediaFile),
    Deleted(MediaFile),
    Renamed { file: MediaFile, old_path: PathBuf },
}

/// Per-root orchestrator: owns the in-memory index of one source root,
/// its watcher(s) and the ingestion of the optional raw-data root.
///
/// All event handling runs on a single task per source so cache
/// mutations, store-bound emissions and watcher suspension never
/// interleave.
pub struct MediaSource {
    name: String,
    root: PathBuf,
    recursive: bool,
    raw_data: Option<RawDataConfig>,
    files: RwLock<HashMap<PathBuf, MediaFile>>,
    watcher: Arc<dyn SourceWatcher>,
    raw_watcher: Option<Arc<dyn SourceWatcher>>,
    transcoder: Arc<dyn Transcoder>,
    changes: mpsc::Sender<MediaChange>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MediaSource {
    pub fn new(
        config: &SourceConfig,
        scan_interval: Duration,
        transcoder: Arc<dyn Transcoder>,
        changes: mpsc::Sender<MediaChange>,
    ) -> Self {
        let root = fsutil::normalize(&config.path);
        let watcher = create_watcher(&root, config.recursive, config.cloud, scan_interval);
        let raw_watcher = config.raw_data.as_ref().map(|raw| {
            create_watcher(
                &fsutil::normalize(&raw.path),
                raw.recursive,
                raw.cloud,
                scan_interval,
            )
        });
        Self {
            name: config.name.clone(),
            root,
            recursive: config.recursive,
            raw_data: config.raw_data.clone(),
            files: RwLock::new(HashMap::new()),
            watcher,
            raw_watcher,
            transcoder,
            changes,
            event_loop: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current index contents.
    pub async fn indexed_files(&self) -> Vec<MediaFile> {
        self.files.read().await.values().cloned().collect()
    }

    /// Walk the source root and rebuild the in-memory index, then ingest
    /// anything new under the raw-data root. Called before watching
    /// starts, so no suspension is needed around the ingestion here.
    pub async fn scan(&self) -> Result<()> {
        let listing = FileList::capture(&self.root, self.recursive)
            .await
            .with_context(|| format!("failed to scan source root {}", self.root.display()))?;

        let mut files = HashMap::new();
        for path in listing.absolute_paths() {
            if !media::is_acceptable(&path) {
                continue;
            }
            match MediaFile::probe(&self.root, &path, self.transcoder.as_ref()).await {
                Ok(file) => {
                    files.insert(file.path.clone(), file);
                }
                Err(e) => warn!("skipping {}: {e:#}", path.display()),
            }
        }
        info!(
            "source {}: indexed {} files under {}",
            self.name,
            files.len(),
            self.root.display()
        );
        *self.files.write().await = files;

        if self.raw_data.is_some() {
            self.reconcile_raw_data().await?;
        }
        Ok(())
    }

    /// Import every raw-data file that has no counterpart in the source.
    async fn reconcile_raw_data(&self) -> Result<()> {
        let raw = match &self.raw_data {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let raw_list = FileList::capture(&raw.path, raw.recursive)
            .await
            .with_context(|| format!("failed to scan raw-data root {}", raw.path.display()))?;
        let current = FileList::capture(&self.root, self.recursive).await?;

        let pending = raw_list.compare(&current).only_in_self;
        if !pending.is_empty() {
            info!(
                "source {}: {} raw files awaiting import",
                self.name,
                pending.len()
            );
        }
        for raw_path in pending {
            if let Err(e) = self.process_raw_file(&raw_path).await {
                warn!("raw import of {} failed: {e:#}", raw_path.display());
            }
        }
        Ok(())
    }

    /// Import one raw-data file into the source root.
    ///
    /// mp4 input that carries a video stream is normalized through the
    /// transcoder; everything else is copied. The primary watcher is
    /// suspended from just before the write until the cache mutation is
    /// done, so the source never observes its own writes.
    pub async fn process_raw_file(&self, raw_path: &Path) -> Result<()> {
        let raw = match &self.raw_data {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let raw_root = fsutil::normalize(&raw.path);
        let raw_path = fsutil::normalize(raw_path);
        let ext = media::ext_lower(&raw_path);

        let rel = match fsutil::relative_slash(&raw_root, &raw_path) {
            Some(rel) if !rel.is_empty() => rel,
            _ => {
                warn!(
                    "raw path {} is outside {}",
                    raw_path.display(),
                    raw_root.display()
                );
                return Ok(());
            }
        };
        let target = self.root.join(&rel);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            info!(
                "raw file {} already imported as {}, skipping",
                raw_path.display(),
                target.display()
            );
            return Ok(());
        }
        fsutil::ensure_parent_dir(&target).await?;

        // Probe before touching the source tree: on a cloud mount the
        // listing can precede the bytes. An unreadable file goes back to
        // the watcher for the next cycle.
        if ext == ".mp4" || ext == ".mp3" {
            if let Err(e) = self.transcoder.duration(&raw_path).await {
                debug!(
                    "raw file {} not readable yet ({e:#}), deferring",
                    raw_path.display()
                );
                if let Some(raw_watcher) = &self.raw_watcher {
                    raw_watcher.feedback_creation_error(&raw_path);
                }
                return Ok(());
            }
        }

        let was_running = self.watcher.stop().await;
        let result = self.import_raw(&raw_path, &target, &ext).await;
        // Resume must happen on the error path too, and must not start a
        // watcher that was not running when we suspended.
        if was_running {
            if let Err(e) = self.watcher.start().await {
                error!(
                    "failed to resume watcher for {}: {e:#}",
                    self.root.display()
                );
            }
        }
        result
    }

    async fn import_raw(&self, raw_path: &Path, target: &Path, ext: &str) -> Result<()> {
        let converted = if ext == ".mp4" {
            match self.transcoder.convert(raw_path, target).await {
                Ok(converted) => converted,
                Err(e) => {
                    // Leave no partial output behind; the raw file stays
                    // put and is retried on the next appearance.
                    let _ = tokio::fs::remove_file(target).await;
                    return Err(e)
                        .with_context(|| format!("conversion of {} failed", raw_path.display()));
                }
            }
        } else {
            false
        };

        if !converted {
            tokio::fs::copy(raw_path, target).await.with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    raw_path.display(),
                    target.display()
                )
            })?;
        }

        let file = MediaFile::probe(&self.root, target, self.transcoder.as_ref()).await?;
        info!("imported {} into {}", raw_path.display(), target.display());
        self.files
            .write()
            .await
            .insert(file.path.clone(), file.clone());
        self.emit(MediaChange::Created(file)).await;
        Ok(())
    }

    /// Start both watchers and the event loop that serializes handling.
    pub async fn start_watching(self: Arc<Self>) -> Result<()> {
        let mut event_loop = self.event_loop.lock().await;
        if event_loop.is_some() {
            return Ok(());
        }

        let mut primary_rx = self
            .watcher
            .take_events()
            .context("primary event stream already taken")?;
        let mut raw_rx = self.raw_watcher.as_ref().and_then(|w| w.take_events());

        self.watcher
            .start()
            .await
            .with_context(|| format!("failed to start watcher for {}", self.root.display()))?;
        if let Some(raw_watcher) = &self.raw_watcher {
            raw_watcher.start().await.with_context(|| {
                format!("failed to start raw-data watcher for source {}", self.name)
            })?;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let source = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = primary_rx.recv() => match event {
                        Some(event) => source.handle_primary_event(event).await,
                        None => break,
                    },
                    event = recv_opt(&mut raw_rx) => match event {
                        Some(event) => source.handle_raw_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("event loop for source {} stopped", source.name);
        });

        *event_loop = Some(handle);
        *self.shutdown.lock().await = Some(shutdown_tx);
        Ok(())
    }

    /// Stop watchers and the event loop. In-flight imports run to
    /// completion first.
    pub async fn stop_watching(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        self.watcher.stop().await;
        if let Some(raw_watcher) = &self.raw_watcher {
            raw_watcher.stop().await;
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            let _ = handle.await;
        }
        // A handler that was mid-import may have resumed the primary
        // watcher after our stop above.
        self.watcher.stop().await;
    }

    /// Dispatch one event from the primary watcher.
    ///
    /// Events for unacceptable extensions are dropped, except a rename
    /// out of the accepted set, which deletes the old entry.
    pub async fn handle_primary_event(&self, event: FileChangeEvent) {
        match event {
            FileChangeEvent::Created { path } | FileChangeEvent::Changed { path } => {
                if media::is_acceptable(&path) {
                    self.index_path(&path).await;
                }
            }
            FileChangeEvent::Deleted { path } => {
                if media::is_acceptable(&path) {
                    self.drop_path(&path).await;
                }
            }
            FileChangeEvent::Renamed { path, old_path } => {
                match (media::is_acceptable(&old_path), media::is_acceptable(&path)) {
                    (true, false) => self.drop_path(&old_path).await,
                    (_, true) => self.rename_path(&old_path, &path).await,
                    (false, false) => {}
                }
            }
        }
    }

    /// Dispatch one event from the raw-data watcher. Raw data is
    /// append-only staging: only creations are actionable.
    pub async fn handle_raw_event(&self, event: FileChangeEvent) {
        if !media::is_acceptable(event.path()) {
            return;
        }
        match event {
            FileChangeEvent::Created { path } => {
                if let Err(e) = self.process_raw_file(&path).await {
                    warn!("raw import of {} failed: {e:#}", path.display());
                }
            }
            other => debug!("ignoring {other:?} in raw-data root"),
        }
    }

    /// Observe a created or changed file: coalesce no-op changes, rebuild
    /// the cache entry and report it.
    async fn index_path(&self, path: &Path) {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("cannot stat {}: {}", path.display(), e);
                return;
            }
        };
        let length = meta.len();
        let date = media::mtime_millis(&meta);

        let previous = self.files.read().await.get(path).cloned();
        if let Some(prev) = &previous {
            if prev.length == length && prev.date == date {
                debug!("coalesced duplicate event for {}", path.display());
                return;
            }
        }

        let file = match MediaFile::probe(&self.root, path, self.transcoder.as_ref()).await {
            Ok(file) => file,
            Err(e) => {
                // Still being written or downloaded; ask to see it again.
                warn!("{} not readable yet ({e:#})", path.display());
                self.watcher.feedback_creation_error(path);
                return;
            }
        };

        self.files
            .write()
            .await
            .insert(file.path.clone(), file.clone());
        let change = if previous.is_some() {
            MediaChange::Changed(file)
        } else {
            MediaChange::Created(file)
        };
        self.emit(change).await;
    }

    async fn drop_path(&self, path: &Path) {
        let removed = self.files.write().await.remove(path);
        match removed {
            Some(file) => self.emit(MediaChange::Deleted(file)).await,
            None => debug!("delete for unindexed path {}", path.display()),
        }
    }

    async fn rename_path(&self, old_path: &Path, new_path: &Path) {
        let mut files = self.files.write().await;
        match files.remove(old_path) {
            Some(mut file) => {
                file.path = new_path.to_path_buf();
                file.title = media::title_of(new_path);
                file.category = media::category_for(&self.root, new_path);
                files.insert(file.path.clone(), file.clone());
                drop(files);
                self.emit(MediaChange::Renamed {
                    file,
                    old_path: old_path.to_path_buf(),
                })
                .await;
            }
            None => {
                drop(files);
                debug!(
                    "rename of unindexed {}, indexing {} fresh",
                    old_path.display(),
                    new_path.display()
                );
                self.index_path(new_path).await;
            }
        }
    }

    async fn emit(&self, change: MediaChange) {
        if self.changes.send(change).await.is_err() {
            warn!("change listener for source {} is gone", self.name);
        }
    }
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<FileChangeEvent>>) -> Option<FileChangeEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
