//! WebSocket endpoint for the render event protocol

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::executor::RenderExecutor;
use crate::protocol::{ClientEvent, ServerEvent};

/// Upgrade to a protocol session. Closing the socket leaves running jobs alone.
pub async fn event_socket(
    State(executor): State<Arc<RenderExecutor>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(executor, socket))
}

async fn run_socket(executor: Arc<RenderExecutor>, socket: WebSocket) {
    info!("Client event channel opened");
    let (mut sink, mut stream) = socket.split();
    let mut events = executor.subscribe();
    let mut session = executor.session();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ClientEvent::from_json(text.as_str()) {
                    Ok(command) => {
                        debug!("Client command {:?}", command);
                        for reply in session.handle(command).await {
                            if send(&mut sink, &reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Ignoring unreadable client command: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Client WebSocket error: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if session.wants(&event) && send(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client event channel lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Client event channel closed");
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<(), ()> {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode {:?}: {}", event, e);
            return Ok(());
        }
    };

    sink.send(Message::Text(json.into())).await.map_err(|e| {
        warn!("Error sending to client: {}", e);
    })
}
