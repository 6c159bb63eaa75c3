use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;

/// Initialize logging. `RUST_LOG` overrides the level picked by the
/// `--debug` flag.
pub fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

/// Log the effective configuration and host facts once at startup.
pub fn log_startup_info(config: &AppConfig) {
    info!("{} starting", config.server.name);
    info!("process id: {}, cpu cores: {}", std::process::id(), num_cpus::get());
    info!("metadata store: {}", config.store.store_path().display());
    for source in &config.sources {
        let backend = if source.cloud { "cloud" } else { "local" };
        info!(
            "source {} ({}): {}{}",
            source.name,
            backend,
            source.path.display(),
            if source.recursive { ", recursive" } else { "" }
        );
        if let Some(raw) = &source.raw_data {
            let backend = if raw.cloud { "cloud" } else { "local" };
            info!("  raw data ({}): {}", backend, raw.path.display());
        }
    }
}
