use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChannelEvent, EventChannel, Listener, ListenerRegistry, Subscription};
use crate::protocol::{ClientEvent, ServerEvent};

/// In-process channel.
///
/// Commands emitted while connected are recorded and, once `take_outgoing` has
/// been called, forwarded to the returned receiver. Commands emitted while
/// disconnected are queued and flushed on the next `connect`. Server events and
/// transport failures are injected with `deliver`, `fail` and `drop_connection`.
#[derive(Default)]
pub struct MemoryChannel {
    registry: Arc<ListenerRegistry>,
    connected: AtomicBool,
    queued: Mutex<Vec<ClientEvent>>,
    sent: Mutex<Vec<ClientEvent>>,
    forward: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive every command sent from now on
    pub fn take_outgoing(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.forward.lock() = Some(tx);
        rx
    }

    /// Commands sent so far, oldest first
    pub fn take_sent(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Push a server event to subscribers
    pub fn deliver(&self, event: ServerEvent) {
        self.registry.dispatch(&ChannelEvent::Server(event));
    }

    /// Simulate a transport error
    pub fn fail<S: Into<String>>(&self, message: S) {
        self.connected.store(false, Ordering::SeqCst);
        self.registry.dispatch(&ChannelEvent::ConnectError(message.into()));
    }

    /// Simulate the connection dropping
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.registry.dispatch(&ChannelEvent::Disconnected);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    fn send_now(&self, event: ClientEvent) {
        debug!("Memory channel sending {:?}", event);
        if let Some(tx) = self.forward.lock().as_ref() {
            let _ = tx.send(event.clone());
        }
        self.sent.lock().push(event);
    }
}

impl EventChannel for MemoryChannel {
    fn connect(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        // Listeners may emit from the Connected callback, so flush first
        let queued = std::mem::take(&mut *self.queued.lock());
        for event in queued {
            self.send_now(event);
        }
        self.registry.dispatch(&ChannelEvent::Connected);
    }

    fn disconnect(&self) {
        self.drop_connection();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) {
        if self.is_connected() {
            self.send_now(event);
        } else {
            self.queued.lock().push(event);
        }
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.registry.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_are_queued_until_connected() {
        let channel = MemoryChannel::new();
        channel.emit(ClientEvent::RenderStart { id: "p".into() });
        assert!(channel.take_sent().is_empty());

        channel.connect();
        channel.emit(ClientEvent::RenderCancel { id: "p".into() });

        assert_eq!(
            channel.take_sent(),
            vec![
                ClientEvent::RenderStart { id: "p".into() },
                ClientEvent::RenderCancel { id: "p".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_forwarding_and_events() {
        let channel = MemoryChannel::new();
        let mut outgoing = channel.take_outgoing();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = channel.subscribe(Arc::new(move |event: &ChannelEvent| sink.lock().push(event.clone())));

        channel.connect();
        channel.emit(ClientEvent::Join { id: "p".into() });
        assert_eq!(outgoing.recv().await, Some(ClientEvent::Join { id: "p".into() }));

        channel.deliver(ServerEvent::RenderCancelled { id: "p".into() });
        channel.drop_connection();
        channel.drop_connection();
        channel.fail("connection refused");

        assert_eq!(
            *seen.lock(),
            vec![
                ChannelEvent::Connected,
                ChannelEvent::Server(ServerEvent::RenderCancelled { id: "p".into() }),
                ChannelEvent::Disconnected,
                ChannelEvent::ConnectError("connection refused".into()),
            ]
        );
        assert!(!channel.is_connected());
    }
}
