//! Axum router configuration

use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::executor::RenderExecutor;

use super::handlers::{completion_check, health_check, render_video, version_check};
use super::ws::event_socket;

/// Create the Axum router with all routes
pub fn create_router(executor: Arc<RenderExecutor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::ORIGIN])
        .max_age(Duration::from_secs(3600));

    let storage = executor.invoker().storage();
    let prefix = format!("/{}", storage.public_url_prefix.trim_matches('/'));
    let public_dir = storage.public_dir.clone();

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version_check))
        .route("/complete/{id}", get(completion_check))
        .route("/render-video", post(render_video))
        .route("/ws", get(event_socket));

    // Published videos, unless they are served from elsewhere
    if prefix != "/" {
        debug!("Serving {} at {}", public_dir.display(), prefix);
        router = router.nest_service(&prefix, ServeDir::new(public_dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(executor)
}
