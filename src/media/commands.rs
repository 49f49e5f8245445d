use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::MediaConfig;
use crate::error::{Result, RenderError};

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add a lavfi generator input
    pub fn generator_input<S: Into<String>>(self, source: S) -> Self {
        self.arg("-f").arg("lavfi").arg("-i").arg(source)
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Copy audio stream
    pub fn copy_audio(self) -> Self {
        self.audio_codec("copy")
    }

    /// Set audio bitrate
    pub fn audio_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:a").arg(bitrate)
    }

    /// End output at the shortest input
    pub fn shortest(self) -> Self {
        self.arg("-shortest")
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Report machine-readable progress on stdout
    pub fn progress_to_stdout(self) -> Self {
        self.arg("-progress").arg("pipe:1").arg("-nostats")
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Run to completion and return captured stdout
    pub async fn capture(&self) -> Result<String> {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RenderError::Media(format!("Failed to execute media processor: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(RenderError::Transcode {
                message: format!("{} failed with {}", self.description, output.status),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Execute the command
    pub async fn execute(&self) -> Result<()> {
        self.capture().await.map(|_| ())
    }

    /// Run while streaming `-progress` output into `on_progress`.
    ///
    /// Stderr is captured in full for diagnostics. The child is killed when
    /// `cancel` fires, and the call returns `RenderError::Cancelled`.
    pub async fn execute_with_progress<F>(&self, mut on_progress: F, mut cancel: CancelToken) -> Result<()>
    where
        F: FnMut(Duration) + Send,
    {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let mut child = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Media(format!("Failed to execute media processor: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::Media("Media processor stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RenderError::Media("Media processor stderr unavailable".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = stderr.read_to_string(&mut buf).await {
                warn!("Failed to read media processor stderr: {}", e);
            }
            buf
        });

        let outcome = {
            let run = async {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some(position) = parse_progress_line(&line) {
                        on_progress(position);
                    }
                }
                child.wait().await
            };

            tokio::select! {
                status = run => Some(status),
                _ = cancel.cancelled() => None,
            }
        };

        let status = match outcome {
            Some(status) => status?,
            None => {
                warn!("{} cancelled, stopping subprocess", self.description);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill media processor: {}", e);
                }
                stderr_task.abort();
                return Err(RenderError::Cancelled);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(RenderError::Transcode {
                message: format!("{} failed with {}", self.description, status),
                stderr,
            });
        }

        Ok(())
    }
}

/// Parse one `-progress` line into the encoded position
pub fn parse_progress_line(line: &str) -> Option<Duration> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys carry microseconds
        "out_time_us" | "out_time_ms" => value.parse::<u64>().ok().map(Duration::from_micros),
        _ => None,
    }
}

/// Escape a caption file path for use inside a filter graph
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "\\\\").replace(':', "\\:")
}

/// The caption burn-in filter expression for `subtitle_path`
pub fn caption_filter(subtitle_path: &Path) -> String {
    format!("subtitles={}", escape_filter_path(subtitle_path))
}

/// Builder for common media processing operations
pub struct MediaCommandBuilder {
    binary_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Build the caption burn command.
    ///
    /// Sources with a video stream are re-encoded with the caption filter and keep
    /// their audio. Audio-only sources are paired with a generated background, cut
    /// to the shortest input and have their audio re-encoded.
    pub fn burn_captions<P: AsRef<Path>>(
        &self,
        input_path: P,
        subtitle_path: P,
        output_path: P,
        has_video: bool,
        options: &MediaConfig,
    ) -> MediaCommand {
        let filter = caption_filter(subtitle_path.as_ref());

        let mut cmd = if has_video {
            MediaCommand::new(&self.binary_path, "Caption burn")
                .overwrite()
                .input(&input_path)
                .video_filter(filter)
                .video_codec(&options.video_codec)
                .copy_audio()
        } else {
            MediaCommand::new(&self.binary_path, "Caption burn (audio only)")
                .overwrite()
                .generator_input(format!(
                    "color=c={}:s={}",
                    options.background_color, options.background_size
                ))
                .input(&input_path)
                .shortest()
                .video_filter(filter)
                .video_codec(&options.video_codec)
                .audio_codec("aac")
                .audio_bitrate(&options.audio_bitrate)
        };

        for option in &options.extra_options {
            cmd = cmd.arg(option);
        }

        cmd.progress_to_stdout().output(output_path)
    }

    /// Build the stream inspection command (JSON on stdout)
    pub fn probe_streams<P: AsRef<Path>>(&self, input_path: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Stream probe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("stream=codec_type:stream_disposition=attached_pic:format=duration")
            .arg("-of")
            .arg("json")
            .output(input_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}
