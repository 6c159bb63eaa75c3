pub mod config;
pub mod convert;
pub mod error;
pub mod filelist;
pub mod fsutil;
pub mod logging;
pub mod manager;
pub mod media;
pub mod source;
pub mod store;
pub mod watch;
pub mod web;

pub mod state {
    use crate::{config::AppConfig, convert::Transcoder, manager::MediaFileManager};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Playback bookmark shared across clients via /current.
    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CurrentItem {
        pub id: i64,
        pub position: f64,
    }

    #[derive(Clone)]
    pub struct AppState {
        pub config: Arc<AppConfig>,
        pub manager: Arc<MediaFileManager>,
        pub transcoder: Arc<dyn Transcoder>,
        pub current: Arc<RwLock<CurrentItem>>,
    }
}
