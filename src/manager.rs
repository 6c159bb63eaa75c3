// src/manager.rs
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::convert::Transcoder;
use crate::fsutil;
use crate::source::{MediaChange, MediaSource};
use crate::store::{MetaData, MetaDataStore};

/// Aggregator over all configured sources.
///
/// Owns the shared metadata store, reconciles it with the filesystem at
/// startup and applies the per-source change streams to it afterwards.
pub struct MediaFileManager {
    sources: Vec<Arc<MediaSource>>,
    store: Arc<MetaDataStore>,
    last_updated: AtomicI64,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MediaFileManager {
    /// Build all sources, reconcile the store with the filesystem truth
    /// and start watching. Fails if a source root cannot be scanned.
    pub async fn create(
        config: &AppConfig,
        store: Arc<MetaDataStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Arc<Self>> {
        let (changes_tx, changes_rx) = mpsc::channel(1024);
        let scan_interval = Duration::from_millis(config.cloud.scan_interval_ms);

        let sources: Vec<Arc<MediaSource>> = config
            .sources
            .iter()
            .map(|source_config| {
                Arc::new(MediaSource::new(
                    source_config,
                    scan_interval,
                    Arc::clone(&transcoder),
                    changes_tx.clone(),
                ))
            })
            .collect();

        let manager = Arc::new(Self {
            sources,
            store,
            last_updated: AtomicI64::new(0),
            pump: Mutex::new(None),
            shutdown: Mutex::new(None),
        });

        // The pump runs before reconciliation so change events emitted by
        // raw-data ingestion during the initial scans cannot back up.
        Self::start_pump(&manager, changes_rx).await;
        manager.reconcile().await?;
        for source in &manager.sources {
            Arc::clone(source).start_watching().await?;
        }
        Ok(manager)
    }

    /// Align the store with the filesystem: upsert files the store does
    /// not know, then delete records whose files have vanished.
    async fn reconcile(&self) -> Result<()> {
        let mut stale: HashSet<String> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|record| record.path)
            .collect();

        for source in &self.sources {
            source.scan().await?;
            for file in source.indexed_files().await {
                let key = fsutil::to_slash(&file.path);
                if !stale.remove(&key) {
                    self.store.upsert(&file).await?;
                }
            }
        }

        if !stale.is_empty() {
            info!("removing {} records for vanished files", stale.len());
            let paths: Vec<PathBuf> = stale.iter().map(PathBuf::from).collect();
            self.store.delete_many(&paths).await?;
        }
        self.touch();
        Ok(())
    }

    async fn start_pump(manager: &Arc<Self>, mut changes_rx: mpsc::Receiver<MediaChange>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pump_manager = Arc::clone(manager);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    change = changes_rx.recv() => match change {
                        Some(change) => pump_manager.apply_change(change).await,
                        None => break,
                    },
                }
            }
        });
        *manager.pump.lock().await = Some(handle);
        *manager.shutdown.lock().await = Some(shutdown_tx);
    }

    /// Apply one source change to the store. Failures are logged and
    /// swallowed so the event loop stays live; the next startup
    /// reconciliation repairs any drift they leave behind.
    ///
    /// `last_updated` only moves when a row actually changed; a delete
    /// for a path the store never had is a no-op.
    async fn apply_change(&self, change: MediaChange) {
        let result = match change {
            MediaChange::Created(file) | MediaChange::Changed(file) => {
                self.store.upsert(&file).await.map(|()| true)
            }
            MediaChange::Deleted(file) => self.store.delete(&file.path).await,
            MediaChange::Renamed { file, old_path } => {
                // The old record may predate this process and be unknown;
                // update_path is a no-op then and the upsert inserts fresh.
                // The upsert also refreshes category/size for the new
                // location while leaving user-authored fields alone.
                match self
                    .store
                    .update_path(&old_path, &file.path, Some(&file.title))
                    .await
                {
                    Ok(_) => self.store.upsert(&file).await.map(|()| true),
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(true) => self.touch(),
            Ok(false) => debug!("store event was a no-op, not touching last_updated"),
            Err(e) => error!("store update failed: {e:#}"),
        }
    }

    fn touch(&self) {
        self.last_updated
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Milliseconds since epoch of the last store mutation.
    pub fn last_updated(&self) -> i64 {
        self.last_updated.load(Ordering::SeqCst)
    }

    pub async fn all_files(&self) -> Result<Vec<MetaData>> {
        self.store.get_all().await
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<MetaData>> {
        self.store.get_by_id(id).await
    }

    pub fn store(&self) -> &MetaDataStore {
        &self.store
    }

    pub fn sources(&self) -> &[Arc<MediaSource>] {
        &self.sources
    }

    /// Stop all watchers and the change pump. Idempotent.
    pub async fn stop_watching(&self) {
        for source in &self.sources {
            source.stop_watching().await;
        }
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.pump.lock().await.take() {
            let _ = handle.await;
        }
    }
}
