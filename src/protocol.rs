//! Events exchanged between a client and the render executor.
//!
//! Every message is a JSON object `{"event": <name>, "data": <payload>}` and every
//! payload carries the project `id` it belongs to. Two families share the channel:
//! the join family (`join`, `status`, `finished`, `error`) and the render family
//! (`render:*`).

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::subtitle::Word;

/// Commands sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Observe a project; answered with its current state
    #[serde(rename = "join")]
    Join { id: String },

    #[serde(rename = "render:start")]
    RenderStart { id: String },

    #[serde(rename = "render:cancel")]
    RenderCancel { id: String },
}

/// Events pushed by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "status")]
    Status { id: String, status: String, progress: u8 },

    /// The project's transcript is ready
    #[serde(rename = "finished")]
    Finished { id: String, transcript: Vec<Word> },

    #[serde(rename = "error")]
    Error { id: String, error: String },

    #[serde(rename = "render:progress")]
    RenderProgress { id: String, progress: u8, status: String },

    #[serde(rename = "render:finished")]
    RenderFinished { id: String, video: String },

    #[serde(rename = "render:error")]
    RenderError { id: String, error: String },

    /// Acknowledges a cancel request
    #[serde(rename = "render:cancel")]
    RenderCancelled { id: String },

    /// Current render state, replayed to a client that rejoined mid-render
    #[serde(rename = "render:resume")]
    RenderResume { id: String, progress: u8, status: String },
}

impl ClientEvent {
    pub fn project_id(&self) -> &str {
        match self {
            ClientEvent::Join { id }
            | ClientEvent::RenderStart { id }
            | ClientEvent::RenderCancel { id } => id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ServerEvent {
    pub fn project_id(&self) -> &str {
        match self {
            ServerEvent::Status { id, .. }
            | ServerEvent::Finished { id, .. }
            | ServerEvent::Error { id, .. }
            | ServerEvent::RenderProgress { id, .. }
            | ServerEvent::RenderFinished { id, .. }
            | ServerEvent::RenderError { id, .. }
            | ServerEvent::RenderCancelled { id }
            | ServerEvent::RenderResume { id, .. } => id,
        }
    }

    /// Any event of the render family
    pub fn is_render_event(&self) -> bool {
        !matches!(
            self,
            ServerEvent::Status { .. } | ServerEvent::Finished { .. } | ServerEvent::Error { .. }
        )
    }

    /// `render:finished` or `render:error`
    pub fn is_render_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::RenderFinished { .. } | ServerEvent::RenderError { .. }
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Render job state. Clients move through `Idle`, `Starting`, `Rendering` and
/// the terminal states; `Cancelling` is held by the executor while a cancelled
/// worker is still winding down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    #[default]
    Idle,
    Starting,
    Rendering,
    Cancelling,
    Completed,
    Error,
}

impl RenderState {
    /// A job has been started and has not reached a terminal state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RenderState::Starting | RenderState::Rendering | RenderState::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderState::Completed | RenderState::Error)
    }
}

/// One project's render job as seen by its owner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: String,
    pub state: RenderState,
    pub progress: u8,
    pub status_message: String,
    pub result_media_ref: Option<String>,
    pub error_message: Option<String>,
}

impl RenderJob {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Back to `Idle`, keeping the id
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.id));
    }
}

/// Keeps a job's reported progress non-decreasing and within 0..=100
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker {
    last: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value and return what may be reported
    pub fn advance(&mut self, progress: u8) -> u8 {
        self.last = self.last.max(progress.min(100));
        self.last
    }

    pub fn current(&self) -> u8 {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}
