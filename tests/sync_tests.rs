//! End-to-end synchronization scenarios: cold start, renames, raw-data
//! ingestion, cloud retry, store rebuild and byte-range serving.
//!
//! The ffmpeg toolchain is replaced by a mock transcoder so the engine
//! runs on plain temp files.

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

use booserv::config::{AppConfig, RawDataConfig, SourceConfig};
use booserv::convert::{Chapter, Transcoder};
use booserv::fsutil;
use booserv::manager::MediaFileManager;
use booserv::state::{AppState, CurrentItem};
use booserv::store::MetaDataStore;
use booserv::watch::FileChangeEvent;
use booserv::web::handlers;

/// Transcoder double: fixed durations, conversions that prepend a marker,
/// and per-path probe failures to model still-downloading cloud files.
struct MockTranscoder {
    conversions: AtomicUsize,
    fail_probe_for: Mutex<Vec<PathBuf>>,
}

impl MockTranscoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conversions: AtomicUsize::new(0),
            fail_probe_for: Mutex::new(Vec::new()),
        })
    }

    fn fail_probe(&self, path: &Path) {
        self.fail_probe_for
            .lock()
            .unwrap()
            .push(fsutil::normalize(path));
    }

    fn clear_failures(&self) {
        self.fail_probe_for.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn duration(&self, path: &Path) -> Result<f64> {
        let path = fsutil::normalize(path);
        if self.fail_probe_for.lock().unwrap().iter().any(|p| *p == path) {
            bail!("moov atom not yet available");
        }
        Ok(42.0)
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<bool> {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        let bytes = tokio::fs::read(input).await?;
        let mut converted = b"hvc1+faststart:".to_vec();
        converted.extend_from_slice(&bytes);
        tokio::fs::write(output, converted).await?;
        Ok(true)
    }

    async fn chapters(&self, _path: &Path) -> Result<Vec<Chapter>> {
        Ok(Vec::new())
    }
}

fn single_source_config(root: &Path, raw: Option<&Path>, cloud_raw: bool) -> AppConfig {
    let mut config = AppConfig::default();
    config.cloud.scan_interval_ms = 100;
    config.sources = vec![SourceConfig {
        path: root.to_path_buf(),
        name: "main".to_string(),
        recursive: true,
        cloud: false,
        raw_data: raw.map(|path| RawDataConfig {
            path: path.to_path_buf(),
            recursive: true,
            cloud: cloud_raw,
        }),
    }];
    config
}

async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// Cold start over an empty store: one probeable video is indexed, the
// stray text file is not.
#[tokio::test]
async fn cold_start_indexes_acceptable_files() {
    let media = tempfile::tempdir().unwrap();
    tokio::fs::write(media.path().join("a.mp4"), b"video bytes").await.unwrap();
    tokio::fs::write(media.path().join("notes.txt"), b"not media").await.unwrap();

    let config = single_source_config(media.path(), None, false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();
    let manager = MediaFileManager::create(&config, store.clone(), transcoder)
        .await
        .unwrap();

    let records = store.get_all().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.path, fsutil::to_slash(&media.path().join("a.mp4")));
    assert_eq!(record.ext, ".mp4");
    assert_eq!(record.category, "ROOT");
    assert_eq!(record.duration, 42.0);
    assert!(manager.last_updated() > 0);

    manager.stop_watching().await;
}

// Rename moves the record to the new path, retitles and recategorizes it,
// and leaves user-authored fields alone.
#[tokio::test]
async fn rename_updates_path_title_category_and_keeps_user_fields() {
    let media = tempfile::tempdir().unwrap();
    let old = media.path().join("a.mp4");
    tokio::fs::write(&old, b"video bytes").await.unwrap();

    let config = single_source_config(media.path(), None, false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();
    let manager = MediaFileManager::create(&config, store.clone(), transcoder)
        .await
        .unwrap();

    store
        .update_user_fields(&old, "favorite", "clip of the trip", 1, 5, 0, "{}")
        .await
        .unwrap();

    // Move the file on disk and feed the rename to the source handler.
    let new = media.path().join("sub/b.mp4");
    tokio::fs::create_dir_all(new.parent().unwrap()).await.unwrap();
    tokio::fs::rename(&old, &new).await.unwrap();
    manager.sources()[0]
        .handle_primary_event(FileChangeEvent::Renamed {
            path: fsutil::normalize(&new),
            old_path: fsutil::normalize(&old),
        })
        .await;

    let store_for_wait = store.clone();
    let new_for_wait = new.clone();
    assert!(
        wait_until(move || {
            let store = store_for_wait.clone();
            let new = new_for_wait.clone();
            async move { store.get_by_path(&new).await.unwrap().is_some() }
        })
        .await,
        "renamed record did not appear"
    );

    let records = store.get_all().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.path, fsutil::to_slash(&new));
    assert_eq!(record.title, "b");
    assert_eq!(record.category, "sub");
    assert_eq!(record.label, "favorite");
    assert_eq!(record.description, "clip of the trip");
    assert_eq!(record.rating, 5);
    assert_eq!(record.mark, 1);

    manager.stop_watching().await;
}

// Raw-data import: the video is transcoded into the source root, indexed
// and stored; a second cold start over the same directories changes
// nothing.
#[tokio::test]
async fn raw_import_transcodes_and_is_idempotent_across_restarts() {
    let media = tempfile::tempdir().unwrap();
    let raw = tempfile::tempdir().unwrap();
    tokio::fs::write(raw.path().join("v.mp4"), b"hevc source").await.unwrap();

    let config = single_source_config(media.path(), Some(raw.path()), false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();

    let manager = MediaFileManager::create(&config, store.clone(), transcoder.clone())
        .await
        .unwrap();

    let target = media.path().join("v.mp4");
    let contents = tokio::fs::read(&target).await.unwrap();
    assert!(contents.starts_with(b"hvc1+faststart:"));
    assert_eq!(transcoder.conversions.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_all().await.unwrap().len(), 1);
    manager.stop_watching().await;

    // Second cold start: the target already exists, nothing is re-imported.
    let manager = MediaFileManager::create(&config, store.clone(), transcoder.clone())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&target).await.unwrap(), contents);
    assert_eq!(transcoder.conversions.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_all().await.unwrap().len(), 1);
    manager.stop_watching().await;
}

// Cloud eventual consistency: the raw file is listed before its bytes
// are readable; the feedback channel re-announces it on a later tick and
// the import eventually succeeds.
#[tokio::test]
async fn cloud_raw_file_is_retried_until_readable() {
    let media = tempfile::tempdir().unwrap();
    let raw = tempfile::tempdir().unwrap();
    let raw_file = raw.path().join("x.mp4");
    tokio::fs::write(&raw_file, b"still downloading").await.unwrap();

    let config = single_source_config(media.path(), Some(raw.path()), true);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();
    transcoder.fail_probe(&raw_file);

    let manager = MediaFileManager::create(&config, store.clone(), transcoder.clone())
        .await
        .unwrap();

    // Startup ingestion could not read the file, so nothing is imported.
    assert!(!media.path().join("x.mp4").exists());
    assert!(store.get_all().await.unwrap().is_empty());

    // The download finishes; the polling watcher re-announces the file.
    tokio::time::sleep(Duration::from_millis(150)).await;
    transcoder.clear_failures();

    let media_root = media.path().to_path_buf();
    assert!(
        wait_until(move || {
            let target = media_root.join("x.mp4");
            async move { target.is_file() }
        })
        .await,
        "deferred raw file was never imported"
    );

    let store_for_wait = store.clone();
    assert!(
        wait_until(move || {
            let store = store_for_wait.clone();
            async move { store.get_all().await.unwrap().len() == 1 }
        })
        .await,
        "imported file never reached the store"
    );

    manager.stop_watching().await;
}

// Store rebuild: a record whose file vanished while the server was down
// is removed by startup reconciliation.
#[tokio::test]
async fn restart_after_external_deletion_purges_store() {
    let media = tempfile::tempdir().unwrap();
    let file = media.path().join("gone.mp4");
    tokio::fs::write(&file, b"video").await.unwrap();

    let config = single_source_config(media.path(), None, false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();

    let manager = MediaFileManager::create(&config, store.clone(), transcoder.clone())
        .await
        .unwrap();
    assert_eq!(store.get_all().await.unwrap().len(), 1);
    manager.stop_watching().await;
    let before_restart = manager.last_updated();
    drop(manager);

    tokio::fs::remove_file(&file).await.unwrap();

    let manager = MediaFileManager::create(&config, store.clone(), transcoder)
        .await
        .unwrap();
    assert!(store.get_all().await.unwrap().is_empty());
    assert!(manager.last_updated() >= before_restart);
    manager.stop_watching().await;
}

async fn app_state_with_one_video(
    media: &Path,
    size: usize,
) -> (AppState, Arc<MetaDataStore>, i64) {
    tokio::fs::write(media.join("clip.mp4"), vec![0xAB; size]).await.unwrap();

    let config = single_source_config(media, None, false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();
    let manager = MediaFileManager::create(&config, store.clone(), transcoder.clone())
        .await
        .unwrap();

    let id = store.get_all().await.unwrap()[0].id;
    let state = AppState {
        config: Arc::new(config),
        manager,
        transcoder,
        current: Arc::new(RwLock::new(CurrentItem::default())),
    };
    (state, store, id)
}

/// A small mixed library: one video in the root, one audio file and one
/// image under `sub/`.
async fn app_state_with_library(media: &Path) -> AppState {
    tokio::fs::write(media.join("a.mp4"), b"video").await.unwrap();
    tokio::fs::create_dir_all(media.join("sub")).await.unwrap();
    tokio::fs::write(media.join("sub/b.mp3"), b"audio").await.unwrap();
    tokio::fs::write(media.join("sub/c.png"), b"image").await.unwrap();

    let config = single_source_config(media, None, false);
    let store = Arc::new(MetaDataStore::open_in_memory().await.unwrap());
    let transcoder = MockTranscoder::new();
    let manager = MediaFileManager::create(&config, store, transcoder.clone())
        .await
        .unwrap();
    AppState {
        config: Arc::new(config),
        manager,
        transcoder,
        current: Arc::new(RwLock::new(CurrentItem::default())),
    }
}

async fn body_bytes(body: axum::body::Body) -> Vec<u8> {
    let mut stream = body.into_data_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    bytes
}

// Byte-range serving: 206 with the exact slice, 416 past the end, plain
// 200 without a Range header.
#[tokio::test]
async fn video_byte_ranges() {
    let media = tempfile::tempdir().unwrap();
    let (state, _store, id) = app_state_with_one_video(media.path(), 1_000_000).await;

    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, "bytes=100-199".parse().unwrap());
    let response = handlers::video(
        State(state.clone()),
        Query(handlers::IdQuery { id }),
        headers,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        "bytes 100-199/1000000"
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
    assert_eq!(body_bytes(response.into_body()).await.len(), 100);

    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, "bytes=2000000-".parse().unwrap());
    let error = handlers::video(
        State(state.clone()),
        Query(handlers::IdQuery { id }),
        headers,
    )
    .await
    .unwrap_err();
    let response = axum::response::IntoResponse::into_response(error);
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = handlers::video(
        State(state.clone()),
        Query(handlers::IdQuery { id }),
        HeaderMap::new(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000000");

    state.manager.stop_watching().await;
}

// /list filtering: by type code, by category, and exact flag match.
#[tokio::test]
async fn list_filters_by_type_category_and_flag() {
    let media = tempfile::tempdir().unwrap();
    let state = app_state_with_library(media.path()).await;

    let all = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: None,
            c: None,
            f: None,
        }),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(all["list"].as_array().unwrap().len(), 3);
    assert_eq!(all["date"].as_i64().unwrap(), state.manager.last_updated());

    let videos = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: Some("v".to_string()),
            c: None,
            f: None,
        }),
    )
    .await
    .unwrap()
    .0;
    let items = videos["list"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["title"], "a");
    assert_eq!(items[0]["type"], "v");
    assert_eq!(items[0]["category"], "ROOT");

    let audio = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: Some("a".to_string()),
            c: None,
            f: None,
        }),
    )
    .await
    .unwrap()
    .0;
    let items = audio["list"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["title"], "b");
    assert_eq!(items[0]["category"], "sub");

    let sub = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: None,
            c: Some("sub".to_string()),
            f: None,
        }),
    )
    .await
    .unwrap()
    .0;
    let items = sub["list"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item["category"] == "sub"));

    // Flag filtering is an exact match; nothing carries flag 1 yet.
    let flagged = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: None,
            c: None,
            f: Some(1),
        }),
    )
    .await
    .unwrap()
    .0;
    assert!(flagged["list"].as_array().unwrap().is_empty());

    let unflagged = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: None,
            c: None,
            f: Some(0),
        }),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(unflagged["list"].as_array().unwrap().len(), 3);

    state.manager.stop_watching().await;
}

// /check answers strictly-newer-than against the client's timestamp.
#[tokio::test]
async fn check_compares_client_date_with_last_updated() {
    let media = tempfile::tempdir().unwrap();
    let (state, _store, _id) = app_state_with_one_video(media.path(), 1024).await;

    let last = state.manager.last_updated();
    assert!(last > 0);

    let stale = handlers::check(
        State(state.clone()),
        Query(handlers::CheckQuery { date: Some(0) }),
    )
    .await
    .0;
    assert_eq!(stale["update"], true);
    assert_eq!(stale["date"].as_i64().unwrap(), last);

    let fresh = handlers::check(
        State(state.clone()),
        Query(handlers::CheckQuery { date: Some(last) }),
    )
    .await
    .0;
    assert_eq!(fresh["update"], false);

    // A client without a timestamp is treated as never synced.
    let missing = handlers::check(
        State(state.clone()),
        Query(handlers::CheckQuery { date: None }),
    )
    .await
    .0;
    assert_eq!(missing["update"], true);

    state.manager.stop_watching().await;
}

// /current PUT is visible to the next GET.
#[tokio::test]
async fn current_bookmark_round_trip() {
    let media = tempfile::tempdir().unwrap();
    let (state, _store, id) = app_state_with_one_video(media.path(), 1024).await;

    let initial = handlers::get_current(State(state.clone())).await.0;
    assert_eq!(initial.id, 0);
    assert_eq!(initial.position, 0.0);

    let ack = handlers::put_current(
        State(state.clone()),
        Json(CurrentItem { id, position: 12.5 }),
    )
    .await
    .0;
    assert_eq!(ack["result"], "ok");

    let current = handlers::get_current(State(state.clone())).await.0;
    assert_eq!(current.id, id);
    assert_eq!(current.position, 12.5);

    state.manager.stop_watching().await;
}

// The remaining protocol metadata verbs: /nop, /capability, /categories
// and /chapter.
#[tokio::test]
async fn capability_categories_and_chapters() {
    let media = tempfile::tempdir().unwrap();
    let state = app_state_with_library(media.path()).await;

    assert_eq!(handlers::nop().await.0["result"], "ok");

    let capability = handlers::capability(State(state.clone())).await.0;
    assert_eq!(
        capability["serverName"].as_str().unwrap(),
        state.config.server.name
    );
    assert_eq!(capability["types"], serde_json::json!(["v", "a", "p"]));
    assert_eq!(capability["chapter"], true);

    let categories = handlers::categories(State(state.clone())).await.unwrap().0;
    assert_eq!(
        categories["categories"],
        serde_json::json!(["ROOT", "sub"])
    );

    let videos = handlers::list(
        State(state.clone()),
        Query(handlers::ListQuery {
            media_type: Some("v".to_string()),
            c: None,
            f: None,
        }),
    )
    .await
    .unwrap()
    .0;
    let id = videos["list"][0]["id"].as_i64().unwrap();
    let chapters = handlers::chapter(State(state.clone()), Query(handlers::IdQuery { id }))
        .await
        .unwrap()
        .0;
    assert_eq!(chapters["id"].as_i64().unwrap(), id);
    assert!(chapters["chapters"].as_array().unwrap().is_empty());

    state.manager.stop_watching().await;
}

// /audio refuses a video id; /item serves anything.
#[tokio::test]
async fn typed_endpoints_check_media_kind() {
    let media = tempfile::tempdir().unwrap();
    let (state, _store, id) = app_state_with_one_video(media.path(), 1024).await;

    let error = handlers::audio(
        State(state.clone()),
        Query(handlers::IdQuery { id }),
        HeaderMap::new(),
    )
    .await
    .unwrap_err();
    let response = axum::response::IntoResponse::into_response(error);
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handlers::item(
        State(state.clone()),
        Query(handlers::IdQuery { id }),
        HeaderMap::new(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.manager.stop_watching().await;
}
