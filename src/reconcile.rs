//! Ground truth for a project's render, read from the persisted record.
//!
//! A client that may have missed a terminal event (it joined late, or the channel
//! dropped at the wrong moment) asks here instead of waiting for an event that
//! will never be sent again.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RenderError};
use crate::store::ProjectStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub completed: bool,
    pub failed: bool,
}

/// Read-only and idempotent. `completed` holds iff the stored video reference is non-empty.
pub async fn check_completed(store: &dyn ProjectStore, project_id: &str) -> Result<CompletionStatus> {
    let record = store
        .get(project_id)
        .await?
        .ok_or_else(|| RenderError::ProjectNotFound(project_id.to_string()))?;

    let status = CompletionStatus {
        completed: record.final_video.as_deref().is_some_and(|v| !v.is_empty()),
        failed: record.render_failed,
    };
    debug!("Completion check for {}: {:?}", project_id, status);
    Ok(status)
}

/// Polls a server's `GET /complete/{id}` endpoint
pub struct CompletionClient {
    client: Client,
    base_url: String,
}

impl CompletionClient {
    pub fn new<S: Into<String>>(base_url: S) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lyric-render/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `None` when the server does not know the project
    pub async fn check(&self, project_id: &str) -> Result<Option<CompletionStatus>> {
        let url = format!("{}/complete/{}", self.base_url, project_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RenderError::Channel(format!(
                "Completion check failed: HTTP {}",
                response.status()
            )));
        }

        Ok(Some(response.json().await?))
    }
}
