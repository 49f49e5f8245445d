use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{ChannelEvent, EventChannel, Listener, ListenerRegistry, ReconnectPolicy, Subscription};
use crate::protocol::{ClientEvent, ServerEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket channel to a render server's `/ws` endpoint.
///
/// `connect` must be called from within a tokio runtime. The connection is
/// retried according to the `ReconnectPolicy`; commands emitted while
/// disconnected are delivered once a connection is up.
pub struct WsChannel {
    url: String,
    policy: ReconnectPolicy,
    registry: Arc<ListenerRegistry>,
    connected: Arc<AtomicBool>,
    outgoing_tx: mpsc::UnboundedSender<ClientEvent>,
    outgoing_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<ClientEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Turn a server base URL into its WebSocket endpoint
pub fn ws_url(server_url: &str) -> String {
    let base = server_url
        .trim_end_matches('/')
        .replacen("http://", "ws://", 1)
        .replacen("https://", "wss://", 1);
    format!("{}/ws", base)
}

impl WsChannel {
    pub fn new<S: Into<String>>(url: S, policy: ReconnectPolicy) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url: url.into(),
            policy,
            registry: ListenerRegistry::new(),
            connected: Arc::new(AtomicBool::new(false)),
            outgoing_tx,
            outgoing_rx: Arc::new(AsyncMutex::new(outgoing_rx)),
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl EventChannel for WsChannel {
    fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        *task = Some(tokio::spawn(run_connection(
            self.url.clone(),
            self.policy.clone(),
            self.registry.clone(),
            self.connected.clone(),
            self.outgoing_rx.clone(),
        )));
    }

    fn disconnect(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.registry.dispatch(&ChannelEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) {
        if self.outgoing_tx.send(event).is_err() {
            warn!("WebSocket channel closed, dropping command");
        }
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.registry.subscribe(listener)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run_connection(
    url: String,
    policy: ReconnectPolicy,
    registry: Arc<ListenerRegistry>,
    connected: Arc<AtomicBool>,
    outgoing: Arc<AsyncMutex<mpsc::UnboundedReceiver<ClientEvent>>>,
) {
    let mut outgoing = outgoing.lock().await;
    let mut attempt = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("Event channel connected to {}", url);
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                registry.dispatch(&ChannelEvent::Connected);

                if let Err(message) = run_session(socket, &mut outgoing, &registry).await {
                    registry.dispatch(&ChannelEvent::ConnectError(message));
                }

                connected.store(false, Ordering::SeqCst);
                registry.dispatch(&ChannelEvent::Disconnected);
                info!("Event channel to {} closed", url);
            }
            Err(e) => {
                warn!("Event channel connect to {} failed: {}", url, e);
                registry.dispatch(&ChannelEvent::ConnectError(e.to_string()));
            }
        }

        attempt += 1;
        match policy.next_delay(attempt) {
            Some(delay) => {
                debug!("Reconnect attempt {} in {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!("Giving up on {} after {} reconnect attempts", url, attempt - 1);
                return;
            }
        }
    }
}

/// Pump one connection until it closes. `Err` carries a transport failure.
async fn run_session(
    socket: Socket,
    outgoing: &mut mpsc::UnboundedReceiver<ClientEvent>,
    registry: &ListenerRegistry,
) -> Result<(), String> {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            command = outgoing.recv() => {
                let Some(command) = command else {
                    return Ok(());
                };
                let json = command.to_json().map_err(|e| e.to_string())?;
                write.send(Message::Text(json.into())).await.map_err(|e| e.to_string())?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerEvent::from_json(text.as_str()) {
                        Ok(event) => registry.dispatch(&ChannelEvent::Server(event)),
                        Err(e) => warn!("Ignoring unreadable server event: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.to_string()),
                }
            }
        }
    }
}
