use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RenderError};

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_stall_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub media: MediaConfig,
    pub segmenter: SegmenterConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Locations probed, in order, for the transcoder binary
    pub ffmpeg_candidates: Vec<String>,
    /// Command name used when no candidate exists (resolved via PATH)
    pub ffmpeg_command: String,
    /// Locations probed, in order, for the media inspection binary
    pub ffprobe_candidates: Vec<String>,
    /// Command name used when no inspection candidate exists
    pub ffprobe_command: String,
    /// Video encoder used for the burned output
    pub video_codec: String,
    /// Audio bitrate when audio has to be re-encoded (audio-only sources)
    pub audio_bitrate: String,
    /// Size of the synthesized background for audio-only sources
    pub background_size: String,
    /// Color of the synthesized background for audio-only sources
    pub background_color: String,
    /// Additional encoding options placed right before the output path
    /// Common options: ["-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p"]
    pub extra_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Silence longer than this starts a new caption
    pub max_gap_ms: u64,
    /// Maximum joined characters per caption
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Per-job working directories are created under here
    pub scratch_dir: PathBuf,
    /// Durable location of finished renders
    pub public_dir: PathBuf,
    /// Prefix of the reference handed back to clients
    pub public_url_prefix: String,
    /// Directory holding one JSON record per project
    pub projects_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the render server, e.g. http://localhost:8787
    pub server_url: String,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Unbounded when absent
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

impl ClientConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media: MediaConfig {
                ffmpeg_candidates: vec![
                    "/usr/bin/ffmpeg".to_string(),
                    "/usr/local/bin/ffmpeg".to_string(),
                    "/opt/homebrew/bin/ffmpeg".to_string(),
                ],
                ffmpeg_command: "ffmpeg".to_string(),
                ffprobe_candidates: vec![
                    "/usr/bin/ffprobe".to_string(),
                    "/usr/local/bin/ffprobe".to_string(),
                    "/opt/homebrew/bin/ffprobe".to_string(),
                ],
                ffprobe_command: "ffprobe".to_string(),
                video_codec: "libx264".to_string(),
                audio_bitrate: "192k".to_string(),
                background_size: "1280x720".to_string(),
                background_color: "black".to_string(),
                extra_options: vec![
                    // "-preset".to_string(), "medium".to_string(),
                    // "-pix_fmt".to_string(), "yuv420p".to_string(),
                ],
            },
            segmenter: SegmenterConfig {
                max_gap_ms: 600,
                max_chars: 42,
            },
            storage: StorageConfig {
                scratch_dir: std::env::temp_dir().join("lyric-render"),
                public_dir: PathBuf::from("public/videos"),
                public_url_prefix: "/videos".to_string(),
                projects_dir: PathBuf::from(".lyric-render/projects"),
            },
            server: ServerConfig {
                bind_addr: "127.0.0.1:8787".to_string(),
            },
            client: ClientConfig {
                server_url: "http://127.0.0.1:8787".to_string(),
                reconnect_backoff_ms: default_reconnect_backoff_ms(),
                max_reconnect_attempts: None,
                stall_timeout_secs: default_stall_timeout_secs(),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RenderError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RenderError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RenderError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| RenderError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}
