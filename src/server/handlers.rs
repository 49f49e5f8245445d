//! HTTP request handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::RenderError;
use crate::executor::RenderExecutor;
use crate::reconcile::{CompletionStatus, check_completed};

/// HTTP error type, rendered as `{error, detail?}`
#[derive(Debug)]
pub enum HttpError {
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    RenderFailed { error: String, detail: Option<String> },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            HttpError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            HttpError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            HttpError::RenderFailed { error, detail } => {
                (StatusCode::INTERNAL_SERVER_ERROR, error, detail)
            }
        };

        (status, Json(ErrorBody { error, detail })).into_response()
    }
}

impl From<RenderError> for HttpError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::ProjectNotFound(_) => HttpError::NotFound(err.to_string()),
            RenderError::AlreadyRendering(_) => HttpError::Conflict(err.to_string()),
            RenderError::Download(_) => HttpError::BadGateway(err.to_string()),
            _ => HttpError::RenderFailed {
                detail: err.detail().map(str::to_string),
                error: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenderRequest {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenderResponse {
    pub video: String,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Version endpoint
pub async fn version_check() -> &'static str {
    concat!("lyric-render v", env!("CARGO_PKG_VERSION"))
}

/// `GET /complete/{id}`
pub async fn completion_check(
    State(executor): State<Arc<RenderExecutor>>,
    Path(id): Path<String>,
) -> Result<Json<CompletionStatus>, HttpError> {
    let status = check_completed(executor.store().as_ref(), &id).await?;
    Ok(Json(status))
}

/// `POST /render-video`: the whole pipeline within one request
pub async fn render_video(
    State(executor): State<Arc<RenderExecutor>>,
    Json(request): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, HttpError> {
    info!("Synchronous render requested for {}", request.id);

    match executor.render_now(&request.id).await {
        Ok(output) => Ok(Json(RenderResponse {
            video: output.media_ref,
        })),
        Err(e) => {
            warn!("Synchronous render for {} failed: {}", request.id, e);
            Err(e.into())
        }
    }
}
