use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{MediaCommandBuilder, MediaProcessorTrait, ProbeInfo, TranscodeTask, resolve_on_disk};
use crate::cancel::CancelToken;
use crate::config::MediaConfig;
use crate::error::{Result, RenderError};

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: MediaConfig,
    ffmpeg: MediaCommandBuilder,
    ffprobe: MediaCommandBuilder,
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl MediaProcessorImpl {
    /// Create a new media processor, resolving both binaries once
    pub fn new(config: MediaConfig) -> Self {
        let ffmpeg_path = resolve_on_disk(&config.ffmpeg_candidates, &config.ffmpeg_command);
        let ffprobe_path = resolve_on_disk(&config.ffprobe_candidates, &config.ffprobe_command);
        info!("Using transcoder {} and inspector {}", ffmpeg_path, ffprobe_path);

        Self {
            ffmpeg: MediaCommandBuilder::new(&ffmpeg_path),
            ffprobe: MediaCommandBuilder::new(&ffprobe_path),
            ffmpeg_path,
            ffprobe_path,
            config,
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn probe(&self, media_path: &Path) -> ProbeInfo {
        let command = self.ffprobe.probe_streams(media_path);

        let json = match command.capture().await {
            Ok(json) => json,
            Err(e) => {
                warn!("Probe of {} failed, assuming no video track: {}", media_path.display(), e);
                return ProbeInfo::default();
            }
        };

        match ProbeInfo::from_probe_json(&json) {
            Ok(info) => {
                debug!("Probe of {}: {:?}", media_path.display(), info);
                info
            }
            Err(e) => {
                warn!("Unreadable probe output for {}, assuming no video track: {}", media_path.display(), e);
                ProbeInfo::default()
            }
        }
    }

    async fn burn_captions(
        &self,
        task: &TranscodeTask,
        on_progress: &(dyn Fn(Duration) + Send + Sync),
        cancel: CancelToken,
    ) -> Result<()> {
        info!(
            "Burning captions from {} into {} -> {} (video track: {})",
            task.caption_path.display(),
            task.input_path.display(),
            task.output_path.display(),
            task.source_has_visual_track
        );

        let command = self.ffmpeg.burn_captions(
            &task.input_path,
            &task.caption_path,
            &task.output_path,
            task.source_has_visual_track,
            &self.config,
        );

        command.execute_with_progress(on_progress, cancel).await?;

        info!("Caption burn completed successfully");
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        self.ffmpeg
            .version_check()
            .execute()
            .await
            .map_err(|e| RenderError::Media(format!("Transcoder not available: {}", e)))?;

        info!("Transcoder is available");
        Ok(())
    }

    async fn get_version_info(&self) -> Result<String> {
        debug!("Getting transcoder version information");

        let version_info = self.ffmpeg.version_check().capture().await?;
        // The first line carries the version
        let first_line = version_info.lines().next().unwrap_or("Unknown version");
        Ok(first_line.to_string())
    }

    fn transcoder_path(&self) -> &str {
        &self.ffmpeg_path
    }

    fn inspector_path(&self) -> &str {
        &self.ffprobe_path
    }
}
