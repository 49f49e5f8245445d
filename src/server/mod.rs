//! HTTP server module
//!
//! - Axum router with the render endpoints and CORS
//! - Request handlers for health, completion checks and synchronous renders
//! - WebSocket endpoint carrying the render event protocol

pub mod handlers;
pub mod routes;
pub mod ws;

pub use routes::create_router;

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;
use crate::executor::RenderExecutor;

/// Bind `addr` and serve until the process is stopped
pub async fn serve(executor: Arc<RenderExecutor>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Render server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, create_router(executor)).await?;
    Ok(())
}
