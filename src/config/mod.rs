use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_server_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("BooServer on {host}")
}

fn default_scan_interval_ms() -> u64 {
    180_000
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

/// Main application configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub ffprobe: FfprobeConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_server_name")]
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            interface: default_interface(),
            name: default_server_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Configured store location, or the platform data directory.
    pub fn store_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("booserv")
                .join("metadata.db"),
        }
    }
}

/// Polling cadence shared by every cloud-backed watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub path: PathBuf,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: default_ffmpeg_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfprobeConfig {
    #[serde(default = "default_ffprobe_path")]
    pub path: PathBuf,
}

impl Default for FfprobeConfig {
    fn default() -> Self {
        Self {
            path: default_ffprobe_path(),
        }
    }
}

/// One indexed source root, optionally paired with a raw-data staging
/// directory whose files are imported into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub name: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub cloud: bool,
    #[serde(default)]
    pub raw_data: Option<RawDataConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDataConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub cloud: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            cloud: CloudConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            ffprobe: FfprobeConfig::default(),
            sources: Vec::new(),
        }
    }
}

/// Command line interface. A bare media directory is a shortcut for a
/// one-source configuration without a config file.
#[derive(clap::Parser, Debug)]
#[command(author, version, about = "BooServer media indexing and streaming server")]
struct Args {
    /// Directory of media files to serve (shortcut for a single source)
    media_dir: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Friendly server name
    #[arg(short, long)]
    name: Option<String>,

    /// Verbose logging (RUST_LOG overrides)
    #[arg(long)]
    debug: bool,
}

impl AppConfig {
    /// Build configuration from command line arguments. Returns the
    /// config and whether debug logging was requested.
    pub fn from_args() -> Result<(Self, bool)> {
        use clap::Parser;
        let args = Args::parse();

        let mut config = match (&args.config, &args.media_dir) {
            (Some(config_path), _) => Self::load_or_create(config_path)?,
            (None, Some(media_dir)) => {
                if !media_dir.is_dir() {
                    bail!("media directory does not exist: {}", media_dir.display());
                }
                let mut config = Self::default();
                config.sources = vec![SourceConfig {
                    path: media_dir.clone(),
                    name: "media".to_string(),
                    recursive: true,
                    cloud: false,
                    raw_data: None,
                }];
                config
            }
            (None, None) => {
                let default_path = dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("booserv")
                    .join("config.toml");
                Self::load_or_create(default_path)?
            }
        };

        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(name) = args.name {
            config.server.name = name;
        }

        config.validate()?;
        Ok((config, args.debug))
    }

    /// Load configuration from file, or write the defaults there first.
    pub fn load_or_create<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        if config_path.exists() {
            Self::load_from_file(config_path)
        } else {
            let default_config = Self::default();
            default_config
                .save_to_file(config_path)
                .with_context(|| {
                    format!(
                        "failed to create default configuration at {}",
                        config_path.display()
                    )
                })?;
            tracing::info!("created default configuration at {}", config_path.display());
            Ok(default_config)
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let content = std::fs::read_to_string(config_path.as_ref()).with_context(|| {
            format!("failed to read config file {}", config_path.as_ref().display())
        })?;
        let config: AppConfig = toml::from_str(&content).with_context(|| {
            format!("failed to parse config file {}", config_path.as_ref().display())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as TOML with a short commented header.
    pub fn save_to_file<P: AsRef<Path>>(&self, config_path: P) -> Result<()> {
        let config_path = config_path.as_ref();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let body = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        let content = format!(
            "# BooServer configuration\n\
             # Sources are declared as [[sources]] tables; pair a source with\n\
             # [sources.raw_data] to import staged files into it.\n\n{body}"
        );
        std::fs::write(config_path, content)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        Ok(())
    }

    /// Structural validation of the source list.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no sources configured; add at least one [[sources]] entry");
        }
        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("source with path {} has an empty name", source.path.display());
            }
            if !names.insert(source.name.clone()) {
                bail!("duplicate source name: {}", source.name);
            }
            if !paths.insert(source.path.clone()) {
                bail!("duplicate source path: {}", source.path.display());
            }
            if let Some(raw) = &source.raw_data {
                if raw.path == source.path {
                    bail!(
                        "source {}: raw_data path must differ from the source path",
                        source.name
                    );
                }
            }
        }
        if self.cloud.scan_interval_ms == 0 {
            bail!("cloud.scan_interval_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml_text = r#"
            [server]
            port = 9090
            name = "Living Room"

            [cloud]
            scan_interval_ms = 60000

            [ffmpeg]
            path = "/opt/ffmpeg/bin/ffmpeg"

            [[sources]]
            path = "/srv/media"
            name = "main"

            [sources.raw_data]
            path = "/srv/incoming"
            cloud = true

            [[sources]]
            path = "/mnt/gdrive"
            name = "drive"
            cloud = true
            recursive = false
        "#;

        let config: AppConfig = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.name, "Living Room");
        assert_eq!(config.cloud.scan_interval_ms, 60_000);
        assert_eq!(config.ffmpeg.path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.ffprobe.path, PathBuf::from("ffprobe"));

        assert_eq!(config.sources.len(), 2);
        let main = &config.sources[0];
        assert!(main.recursive);
        assert!(!main.cloud);
        let raw = main.raw_data.as_ref().unwrap();
        assert!(raw.cloud);
        assert!(raw.recursive);

        let drive = &config.sources[1];
        assert!(drive.cloud);
        assert!(!drive.recursive);
        assert!(drive.raw_data.is_none());
    }

    #[test]
    fn defaults_apply() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.interface, "0.0.0.0");
        assert_eq!(config.cloud.scan_interval_ms, 180_000);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn rejects_raw_data_equal_to_source() {
        let toml_text = r#"
            [[sources]]
            path = "/srv/media"
            name = "main"

            [sources.raw_data]
            path = "/srv/media"
        "#;
        let config: AppConfig = toml::from_str(toml_text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let toml_text = r#"
            [[sources]]
            path = "/a"
            name = "x"

            [[sources]]
            path = "/b"
            name = "x"
        "#;
        let config: AppConfig = toml::from_str(toml_text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = AppConfig::default();
        config.sources.push(SourceConfig {
            path: PathBuf::from("/srv/media"),
            name: "main".to_string(),
            recursive: true,
            cloud: false,
            raw_data: None,
        });
        config.save_to_file(&path).unwrap();

        let reloaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.sources.len(), 1);
        assert_eq!(reloaded.sources[0].name, "main");
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/config.toml");
        let config = AppConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 8080);
    }
}
