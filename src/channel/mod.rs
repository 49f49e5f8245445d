// Client side of the event channel
//
// A component never talks to a transport directly. It receives an
// `Arc<dyn EventChannel>`, subscribes for `ChannelEvent`s and holds the returned
// `Subscription` for as long as it wants them; dropping the handle unsubscribes.
//
// - Memory: in-process channel used for embedding and tests
// - Ws: WebSocket client with automatic reconnect

pub mod memory;
pub mod ws;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use memory::MemoryChannel;
pub use ws::WsChannel;

use crate::config::ClientConfig;
use crate::protocol::{ClientEvent, ServerEvent};

/// What a subscriber observes on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// Transport failure; the channel keeps trying to reconnect
    ConnectError(String),
    Server(ServerEvent),
}

pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Transport-independent channel provider
pub trait EventChannel: Send + Sync {
    /// Start connecting; progress is reported to subscribers
    fn connect(&self);

    /// Close the connection and stop reconnecting
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Send a command; queued while disconnected
    fn emit(&self, event: ClientEvent);

    /// Register `listener` until the returned handle is dropped
    fn subscribe(&self, listener: Listener) -> Subscription;
}

/// Listener bookkeeping shared by channel implementations
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver to every listener. The lock is released before calling out so
    /// listeners may emit or unsubscribe.
    pub fn dispatch(&self, event: &ChannelEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }
}

/// Unsubscribes on drop
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// How long to wait before each reconnect attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl From<&ClientConfig> for ReconnectPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            backoff: config.reconnect_backoff(),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` to give up
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.backoff),
        }
    }
}
