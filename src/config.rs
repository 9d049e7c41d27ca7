//! Process settings (environment) and per-run pipeline configuration.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_API_HOST: &str = "127.0.0.1";
const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_CHUNKS_DIR: &str = "./video_chunks";

/// Process-wide settings loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub google_api_key: Option<String>,
    pub video_chunks_dir: PathBuf,
    pub api_host: String,
    pub api_port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            google_api_key: env::var("GOOGLE_API_KEY").ok().filter(|v| !v.is_empty()),
            video_chunks_dir: env::var("VIDEO_CHUNKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CHUNKS_DIR)),
            api_host: env::var("VIGIL_API_HOST").unwrap_or_else(|_| DEFAULT_API_HOST.to_string()),
            api_port: env::var("VIGIL_API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_API_PORT),
        }
    }
}

/// One entry of the operator-supplied event catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub event_code: String,
    pub event_description: String,
    pub detection_guidelines: String,
}

/// Configuration for one pipeline run, supplied on `POST /start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: String,
    pub rtsp_url: String,
    pub chunk_duration: u32,
    pub context: String,
    pub events: Vec<EventConfig>,
}
