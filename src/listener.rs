//! Listener callbacks for inbound traffic
//!
//! Robot-control code consumes the transport only through
//! [`MessageListener`]: one callback per received line and one per
//! disconnection, keyed by the connection that produced them.

use crate::connection::ConnectionId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Receives inbound lines and connection events.
///
/// Callbacks run on the connection's reader task, so a slow listener delays
/// only the connection it is called for.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// One complete inbound line, without its terminator
    async fn on_message(&self, line: &str, connection: ConnectionId);

    /// The connection has been closed and will not deliver more lines
    async fn on_disconnect(&self, connection: ConnectionId);

    /// A new connection was accepted or established
    async fn on_connect(&self, connection: ConnectionId, peer: SocketAddr) {
        let _ = (connection, peer);
    }
}

/// Copy-on-write set of listeners.
///
/// Delivery iterates a snapshot, so listeners can be added while a message
/// is being delivered without affecting that delivery.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Arc<Vec<Arc<dyn MessageListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MessageListener>) {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn MessageListener>>> {
        match self.listeners.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub async fn notify_message(&self, line: &str, connection: ConnectionId) {
        for listener in self.snapshot().iter() {
            listener.on_message(line, connection).await;
        }
    }

    pub async fn notify_disconnect(&self, connection: ConnectionId) {
        for listener in self.snapshot().iter() {
            listener.on_disconnect(connection).await;
        }
    }

    pub async fn notify_connect(&self, connection: ConnectionId, peer: SocketAddr) {
        for listener in self.snapshot().iter() {
            listener.on_connect(connection, peer).await;
        }
    }
}

/// Event forwarded by [`ChannelListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected(ConnectionId, SocketAddr),
    Message(ConnectionId, String),
    Disconnected(ConnectionId),
}

/// Listener that forwards every callback into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageListener for ChannelListener {
    async fn on_message(&self, line: &str, connection: ConnectionId) {
        let _ = self.tx.send(ListenerEvent::Message(connection, line.to_string()));
    }

    async fn on_disconnect(&self, connection: ConnectionId) {
        let _ = self.tx.send(ListenerEvent::Disconnected(connection));
    }

    async fn on_connect(&self, connection: ConnectionId, peer: SocketAddr) {
        let _ = self.tx.send(ListenerEvent::Connected(connection, peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        messages: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl MessageListener for Counting {
        async fn on_message(&self, _line: &str, _connection: ConnectionId) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_disconnect(&self, _connection: ConnectionId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Registers another listener from inside a callback
    struct SelfExtending {
        registry: Arc<ListenerRegistry>,
        added: Arc<Counting>,
    }

    #[async_trait]
    impl MessageListener for SelfExtending {
        async fn on_message(&self, _line: &str, _connection: ConnectionId) {
            self.registry.add(self.added.clone());
        }

        async fn on_disconnect(&self, _connection: ConnectionId) {}
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            messages: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_every_listener_is_notified() {
        let registry = ListenerRegistry::new();
        let a = counting();
        let b = counting();
        registry.add(a.clone());
        registry.add(b.clone());

        let id = ConnectionId::next();
        registry.notify_message("hello", id).await;
        registry.notify_disconnect(id).await;

        for listener in [&a, &b] {
            assert_eq!(listener.messages.load(Ordering::SeqCst), 1);
            assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_adding_during_delivery_does_not_affect_current_iteration() {
        let registry = Arc::new(ListenerRegistry::new());
        let added = counting();
        registry.add(Arc::new(SelfExtending {
            registry: Arc::clone(&registry),
            added: Arc::clone(&added),
        }));

        registry.notify_message("first", ConnectionId::next()).await;
        assert_eq!(added.messages.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 2);

        registry.notify_message("second", ConnectionId::next()).await;
        assert_eq!(added.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::new();
        let id = ConnectionId::next();
        listener.on_message("ping", id).await;
        listener.on_disconnect(id).await;

        assert_eq!(rx.recv().await, Some(ListenerEvent::Message(id, "ping".to_string())));
        assert_eq!(rx.recv().await, Some(ListenerEvent::Disconnected(id)));
    }
}
