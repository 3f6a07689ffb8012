//! Server-side connection handlers
//!
//! A [`ClientHandler`] owns one accepted connection: its read loop delivers
//! every inbound line to the listeners (and optionally an ingest queue), and
//! `send` writes replies on the same socket. The read loop ending is the only
//! way a handler's lifetime ends; it closes the connection, removes the
//! handler from the [`ConnectionSet`] and fires the disconnect callback.

use crate::connection::{Connection, ConnectionId, ConnectionReader, ConnectionStatus, ConnectionWriter};
use crate::listener::ListenerRegistry;
use crate::message::{InboundMessage, Message};
use crate::queue::MessageQueue;
use crate::{LinkError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Shared pieces every handler of one server delivers into
pub struct HandlerContext {
    pub listeners: Arc<ListenerRegistry>,
    pub connections: Arc<ConnectionSet>,
    pub ingest: Option<Arc<MessageQueue<InboundMessage>>>,
    pub write_timeout: Duration,
}

pub struct ClientHandler {
    status: Arc<ConnectionStatus>,
    writer: Mutex<Option<ConnectionWriter>>,
    write_timeout: Duration,
}

impl ClientHandler {
    /// Split the connection into a handler (kept in the connection set) and
    /// the reader its read loop consumes.
    pub fn new(connection: Connection, write_timeout: Duration) -> (Arc<Self>, ConnectionReader) {
        let (status, reader, writer) = connection.into_parts();
        let handler = Arc::new(Self {
            status,
            writer: Mutex::new(Some(writer)),
            write_timeout,
        });
        (handler, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.status.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.status.peer()
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    /// Write one frame to this connection.
    ///
    /// Fails with `NotConnected` once the connection is dead and with
    /// `InvalidPayload` for a message the framing cannot carry. A failed or
    /// timed-out write closes the connection.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.status.is_alive() {
            return Err(LinkError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.status.is_alive() => writer,
            _ => return Err(LinkError::NotConnected),
        };

        let written = tokio::time::timeout(self.write_timeout, writer.write_frame(message)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            // Rejected before any byte was written; the connection is intact
            Ok(Err(e @ LinkError::InvalidPayload(_))) => Err(e),
            Ok(Err(e)) => {
                self.status.close();
                guard.take();
                Err(e)
            }
            Err(_) => {
                self.status.close();
                guard.take();
                Err(LinkError::Connection(format!(
                    "write to {} timed out after {:?}",
                    self.peer(),
                    self.write_timeout
                )))
            }
        }
    }

    /// Signal the read loop to end. Idempotent.
    pub fn close(&self) -> bool {
        self.status.close()
    }

    /// Read loop; returns when the peer disconnects, a read fails, or the
    /// handler is closed.
    pub async fn run(self: Arc<Self>, mut reader: ConnectionReader, ctx: Arc<HandlerContext>) {
        let id = self.id();
        loop {
            let frame = tokio::select! {
                _ = self.status.closed() => {
                    debug!("{}: closed locally", id);
                    break;
                }
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(line)) => {
                    ctx.listeners.notify_message(&line, id).await;
                    if let Some(ingest) = &ctx.ingest {
                        if let Err(e) = ingest.push(InboundMessage::new(id, line)) {
                            warn!("{}: inbound line not queued: {}", id, e);
                        }
                    }
                }
                Ok(None) => {
                    debug!("{}: peer closed the connection", id);
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!("{}: read error from {}: {}", id, self.peer(), e);
                    break;
                }
                Err(e) => {
                    error!("{}: dropping {} after unexpected error: {}", id, self.peer(), e);
                    break;
                }
            }
        }

        self.teardown().await;
        drop(reader);
        ctx.connections.remove(id);
        ctx.listeners.notify_disconnect(id).await;
        info!("Client {} ({}) disconnected", id, self.peer());
    }

    async fn teardown(&self) {
        self.status.close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("{}: shutdown after close: {}", self.id(), e);
            }
        }
    }
}

/// Live handlers of one server, keyed by connection id
#[derive(Default)]
pub struct ConnectionSet {
    handlers: RwLock<HashMap<ConnectionId, Arc<ClientHandler>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handler: Arc<ClientHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(handler.id(), handler);
    }

    /// Remove a handler. Only the first caller for a given id gets it back.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ClientHandler>> {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ClientHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut snapshot: Vec<_> = handlers.values().cloned().collect();
        snapshot.sort_by_key(|handler| handler.id());
        snapshot
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot().iter().map(|handler| handler.id()).collect()
    }

    pub fn len(&self) -> usize {
        match self.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to one connection, failing with `ConnectionNotFound` if it is gone.
    pub async fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        let handler = self.get(id).ok_or(LinkError::ConnectionNotFound(id))?;
        match handler.send(message).await {
            Ok(()) => Ok(()),
            Err(e @ LinkError::InvalidPayload(_)) => Err(e),
            Err(LinkError::NotConnected) => {
                self.remove(id);
                Err(LinkError::ConnectionNotFound(id))
            }
            Err(e) => {
                self.remove(id);
                Err(e)
            }
        }
    }

    /// Deliver a message to every live handler, in connection order.
    ///
    /// A handler that is dead or whose write fails is removed and closed;
    /// the remaining handlers still receive the message. Returns the number
    /// of successful deliveries.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for handler in self.snapshot() {
            match handler.send(message).await {
                Ok(()) => delivered += 1,
                Err(LinkError::InvalidPayload(reason)) => {
                    warn!("Broadcast skipped: {}", reason);
                    continue;
                }
                Err(e) => {
                    if self.remove(handler.id()).is_some() {
                        info!("Removed disconnected client {} ({}): {}", handler.id(), handler.peer(), e);
                    }
                    handler.close();
                }
            }
        }
        delivered
    }

    /// Close every handler and empty the set.
    pub fn close_all(&self) -> Vec<Arc<ClientHandler>> {
        let drained: Vec<_> = {
            let mut handlers = match self.handlers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.drain().map(|(_, handler)| handler).collect()
        };
        for handler in &drained {
            handler.close();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framing;
    use crate::listener::{ChannelListener, ListenerEvent};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, connect.await.unwrap())
    }

    fn context(ingest: Option<Arc<MessageQueue<InboundMessage>>>) -> (Arc<HandlerContext>, tokio::sync::mpsc::UnboundedReceiver<ListenerEvent>) {
        let listeners = Arc::new(ListenerRegistry::new());
        let (listener, rx) = ChannelListener::new();
        listeners.add(listener);
        let ctx = Arc::new(HandlerContext {
            listeners,
            connections: Arc::new(ConnectionSet::new()),
            ingest,
            write_timeout: Duration::from_secs(1),
        });
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_lines_reach_listeners_and_ingest_queue() {
        let (accepted, mut peer) = accepted_pair().await;
        let ingest = Arc::new(MessageQueue::new());
        let (ctx, mut events) = context(Some(Arc::clone(&ingest)));

        let connection = Connection::open(accepted, Framing::Newline, 1024).unwrap();
        let (handler, reader) = ClientHandler::new(connection, ctx.write_timeout);
        let id = handler.id();
        ctx.connections.insert(Arc::clone(&handler));
        let task = tokio::spawn(Arc::clone(&handler).run(reader, Arc::clone(&ctx)));

        peer.write_all(b"MOVE;1;2;3\n").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ListenerEvent::Message(id, "MOVE;1;2;3".to_string()))
        );
        let inbound = ingest.pop().await;
        assert_eq!(inbound, InboundMessage::new(id, "MOVE;1;2;3"));

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(events.recv().await, Some(ListenerEvent::Disconnected(id)));
        assert!(ctx.connections.is_empty());
        assert!(!handler.is_alive());
    }

    #[tokio::test]
    async fn test_send_writes_to_own_socket_and_fails_after_close() {
        let (accepted, peer) = accepted_pair().await;
        let (ctx, _events) = context(None);

        let connection = Connection::open(accepted, Framing::Newline, 1024).unwrap();
        let (handler, reader) = ClientHandler::new(connection, ctx.write_timeout);
        ctx.connections.insert(Arc::clone(&handler));
        let task = tokio::spawn(Arc::clone(&handler).run(reader, Arc::clone(&ctx)));

        // An unframeable reply is refused without dropping the client
        match ctx.connections.send_to(handler.id(), &Message::from("two\nlines")).await {
            Err(LinkError::InvalidPayload(_)) => {}
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
        assert!(handler.is_alive());
        assert_eq!(ctx.connections.broadcast(&Message::from("x\r")).await, 0);
        assert_eq!(ctx.connections.len(), 1);

        handler.send(&Message::from("Received: hello")).await.unwrap();
        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("Received: hello"));

        assert!(handler.close());
        assert!(!handler.close());
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        match handler.send(&Message::from("late")).await {
            Err(LinkError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
        // The peer observes end-of-stream once the handler tore down
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let set = ConnectionSet::new();
        let id = ConnectionId::next();
        match set.send_to(id, &Message::from("x")).await {
            Err(LinkError::ConnectionNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected ConnectionNotFound, got {:?}", other),
        }
    }
}
