use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source download failed: {0}")]
    Download(String),

    #[error("Transcode failed: {message}")]
    Transcode { message: String, stderr: String },

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Event for project {actual} while observing {expected}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("Render cancelled")]
    Cancelled,

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Render already in progress for project {0}")]
    AlreadyRendering(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RenderError {
    /// Diagnostic output captured from the failing subprocess, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            RenderError::Transcode { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
