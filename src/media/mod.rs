// Media processing layer
//
// - Resolve: locating the transcoder and inspection binaries
// - Commands: command builders and subprocess execution
// - Processor: probing sources and burning caption tracks

pub mod commands;
pub mod processor;
pub mod resolve;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use commands::*;
pub use processor::*;
pub use resolve::*;

use crate::cancel::CancelToken;
use crate::config::MediaConfig;
use crate::error::Result;

/// Everything one caption burn invocation needs. Lives only for that invocation.
#[derive(Debug, Clone)]
pub struct TranscodeTask {
    pub input_path: PathBuf,
    pub caption_path: PathBuf,
    pub output_path: PathBuf,
    pub source_has_visual_track: bool,
}

/// What the inspection tool reported about a source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub has_video: bool,
    pub duration: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    disposition: Option<ProbeDisposition>,
}

#[derive(Debug, Deserialize)]
struct ProbeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl ProbeInfo {
    /// Parse the inspection tool's JSON. Embedded cover art does not count as video.
    pub fn from_probe_json(json: &str) -> Result<Self> {
        let output: ProbeOutput = serde_json::from_str(json)?;

        let has_video = output.streams.iter().any(|s| {
            s.codec_type.as_deref() == Some("video")
                && s.disposition.as_ref().map_or(true, |d| d.attached_pic == 0)
        });

        let duration = output
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        Ok(Self { has_video, duration })
    }
}

/// Main trait for media processing operations
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// Inspect a local source. Never fails: an unreadable source reports no video track.
    async fn probe(&self, media_path: &Path) -> ProbeInfo;

    /// Burn the task's caption track into its output, reporting encoded position
    async fn burn_captions(
        &self,
        task: &TranscodeTask,
        on_progress: &(dyn Fn(Duration) + Send + Sync),
        cancel: CancelToken,
    ) -> Result<()>;

    /// Check if the transcoder is available
    async fn check_availability(&self) -> Result<()>;

    /// Get transcoder version information
    async fn get_version_info(&self) -> Result<String>;

    /// Resolved transcoder binary
    fn transcoder_path(&self) -> &str;

    /// Resolved inspection binary
    fn inspector_path(&self) -> &str;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Arc<dyn MediaProcessorTrait> {
        Arc::new(processor::MediaProcessorImpl::new(config))
    }
}
