use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

use booserv::{
    config::AppConfig,
    convert::{FfmpegTranscoder, Transcoder},
    logging,
    manager::MediaFileManager,
    state::{AppState, CurrentItem},
    store::MetaDataStore,
    web,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, debug) = AppConfig::from_args()?;
    logging::init_logging(debug)?;
    logging::log_startup_info(&config);
    let config = Arc::new(config);

    let store = Arc::new(
        MetaDataStore::open(&config.store.store_path())
            .await
            .context("failed to open metadata store")?,
    );
    let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(
        config.ffmpeg.path.clone(),
        config.ffprobe.path.clone(),
    ));

    let manager = MediaFileManager::create(&config, Arc::clone(&store), Arc::clone(&transcoder))
        .await
        .context("failed to initialize media sources")?;
    let indexed = manager.all_files().await.map(|f| f.len()).unwrap_or(0);
    info!("serving {} indexed media files", indexed);

    let state = AppState {
        config: config.clone(),
        manager: Arc::clone(&manager),
        transcoder,
        current: Arc::new(RwLock::new(CurrentItem::default())),
    };
    let app = web::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.interface, config.server.port)
        .parse()
        .context("invalid listen address")?;
    info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(manager, store))
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn shutdown_signal(manager: Arc<MediaFileManager>, store: Arc<MetaDataStore>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    manager.stop_watching().await;
    store.close().await;
}
