use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{Config, StorageConfig};
use crate::error::{Result, RenderError};
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::media::{MediaProcessorFactory, MediaProcessorTrait, TranscodeTask};
use crate::subtitle::{Segmenter, Word, write_caption_track};

// Progress checkpoints reported per phase
const DOWNLOAD_START: u8 = 5;
const CAPTIONS_START: u8 = 15;
const PROBE_START: u8 = 20;
const ENCODE_START: u8 = 25;
const ENCODE_END: u8 = 95;
const PUBLISH_START: u8 = 98;

/// Receives `(progress, status)` while a render runs
pub type ProgressFn<'a> = dyn Fn(u8, &str) + Send + Sync + 'a;

/// Where a finished render ended up
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    /// Durable copy of the rendered file
    pub output_path: PathBuf,
    /// Reference handed to clients
    pub media_ref: String,
}

/// Runs one render end to end: fetch, caption, probe, burn, publish
pub struct TranscodeInvoker {
    media: Arc<dyn MediaProcessorTrait>,
    fetcher: Arc<dyn SourceFetcher>,
    segmenter: Segmenter,
    storage: StorageConfig,
}

impl TranscodeInvoker {
    pub fn new(
        media: Arc<dyn MediaProcessorTrait>,
        fetcher: Arc<dyn SourceFetcher>,
        segmenter: Segmenter,
        storage: StorageConfig,
    ) -> Self {
        Self {
            media,
            fetcher,
            segmenter,
            storage,
        }
    }

    /// Build the production invoker from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            MediaProcessorFactory::create_processor(config.media.clone()),
            Arc::new(HttpFetcher::new()?),
            Segmenter::from(&config.segmenter),
            config.storage.clone(),
        ))
    }

    pub fn media(&self) -> &Arc<dyn MediaProcessorTrait> {
        &self.media
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// A fresh working directory under the scratch root, removed when dropped
    pub async fn scratch_dir(&self) -> Result<TempDir> {
        fs::create_dir_all(&self.storage.scratch_dir).await?;
        Ok(tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.storage.scratch_dir)?)
    }

    /// Render `words` onto `source` inside `work_dir`.
    ///
    /// `work_dir` belongs to the caller and is left in place.
    pub async fn render(
        &self,
        job_id: &str,
        source: &str,
        words: &[Word],
        work_dir: &Path,
        on_progress: &ProgressFn<'_>,
        cancel: CancelToken,
    ) -> Result<RenderOutput> {
        info!("Starting render {} from {}", job_id, source);

        ensure_active(&cancel)?;
        on_progress(DOWNLOAD_START, "Downloading source");
        let input_path = self.fetcher.fetch(source, &work_dir.join("source")).await?;

        ensure_active(&cancel)?;
        on_progress(CAPTIONS_START, "Generating captions");
        let chunks = self.segmenter.segment(words);
        let caption_path = work_dir.join("captions.srt");
        write_caption_track(&chunks, &caption_path).await?;

        ensure_active(&cancel)?;
        on_progress(PROBE_START, "Inspecting source");
        let probe = self.media.probe(&input_path).await;

        let total = probe
            .duration
            .or_else(|| chunks.last().map(|c| Duration::from_millis(c.end)))
            .unwrap_or_default();

        let task = TranscodeTask {
            input_path,
            caption_path,
            output_path: work_dir.join("output.mp4"),
            source_has_visual_track: probe.has_video,
        };

        ensure_active(&cancel)?;
        on_progress(ENCODE_START, "Encoding video");
        let encode_progress = |position: Duration| {
            on_progress(encode_percent(position, total), "Encoding video");
        };
        self.media.burn_captions(&task, &encode_progress, cancel.clone()).await?;

        ensure_active(&cancel)?;
        on_progress(PUBLISH_START, "Publishing video");
        let output = self.publish(job_id, &task.output_path).await?;

        info!("Render {} published as {}", job_id, output.media_ref);
        Ok(output)
    }

    /// Copy the rendered file to its durable public location
    async fn publish(&self, job_id: &str, rendered: &Path) -> Result<RenderOutput> {
        fs::create_dir_all(&self.storage.public_dir).await?;

        let file_name = format!(
            "{}-{}.mp4",
            sanitize_file_stem(job_id),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let output_path = self.storage.public_dir.join(&file_name);
        fs::copy(rendered, &output_path).await?;

        let media_ref = format!(
            "{}/{}",
            self.storage.public_url_prefix.trim_end_matches('/'),
            file_name
        );

        Ok(RenderOutput {
            output_path,
            media_ref,
        })
    }
}

fn ensure_active(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RenderError::Cancelled);
    }
    Ok(())
}

/// Map an encoded position onto the encode window of the overall progress
fn encode_percent(position: Duration, total: Duration) -> u8 {
    if total.is_zero() {
        return ENCODE_START;
    }
    let fraction = (position.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0);
    ENCODE_START + (fraction * f64::from(ENCODE_END - ENCODE_START)).round() as u8
}

fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
