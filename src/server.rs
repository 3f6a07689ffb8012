//! Accepting TCP server
//!
//! Binds one port, accepts connections in a background task and gives each
//! accepted socket its own [`ClientHandler`] task. Inbound lines go to the
//! registered listeners and, when configured, an ingest queue; outbound
//! traffic is either broadcast to every live connection or sent as a
//! response on one named connection.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::handler::{ClientHandler, ConnectionSet, HandlerContext};
use crate::lifecycle::{join_set_with_timeout, join_with_timeout, Service, ShutdownSignal};
use crate::listener::{ListenerRegistry, MessageListener};
use crate::message::{InboundMessage, Message};
use crate::queue::MessageQueue;
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

type HandlerTasks = Arc<StdMutex<JoinSet<()>>>;

struct RunningServer {
    shutdown: ShutdownSignal,
    accept_task: JoinHandle<()>,
    handler_tasks: HandlerTasks,
}

pub struct AcceptorServer {
    config: ServerConfig,
    listeners: Arc<ListenerRegistry>,
    connections: Arc<ConnectionSet>,
    ingest: Option<Arc<MessageQueue<InboundMessage>>>,
    running: Mutex<Option<RunningServer>>,
    accepting: Arc<AtomicBool>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl AcceptorServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(ListenerRegistry::new()),
            connections: Arc::new(ConnectionSet::new()),
            ingest: None,
            running: Mutex::new(None),
            accepting: Arc::new(AtomicBool::new(false)),
            local_addr: StdMutex::new(None),
        }
    }

    /// Also push every inbound line onto `queue`, tagged with its connection.
    pub fn with_ingest_queue(mut self, queue: Arc<MessageQueue<InboundMessage>>) -> Self {
        self.ingest = Some(queue);
        self
    }

    pub fn ingest_queue(&self) -> Option<Arc<MessageQueue<InboundMessage>>> {
        self.ingest.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        Arc::clone(&self.connections)
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Address actually bound by the last successful `start`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    /// Bind the configured port and start accepting in the background.
    ///
    /// Returns the bound address; starting a running server returns the
    /// address it is already bound to.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.config.validate()?;
        let mut running = self.running.lock().await;
        if running.is_some() {
            if self.is_running() {
                if let Some(addr) = self.local_addr() {
                    info!("{} is already running on {}", self.name(), addr);
                    return Ok(addr);
                }
            }
            if let Some(stale) = running.take() {
                debug!("{}: cleaning up after stopped accept loop", self.name());
                self.shutdown_running(stale).await;
            }
        }

        let listener = TcpListener::bind(self.config.bind_addr()).await.map_err(|e| {
            LinkError::Connection(format!("{} failed to bind {}: {}", self.name(), self.config.bind_addr(), e))
        })?;
        let addr = listener.local_addr()?;

        let ctx = Arc::new(HandlerContext {
            listeners: Arc::clone(&self.listeners),
            connections: Arc::clone(&self.connections),
            ingest: self.ingest.clone(),
            write_timeout: self.config.write_timeout(),
        });
        let shutdown = ShutdownSignal::new();
        let handler_tasks: HandlerTasks = Arc::new(StdMutex::new(JoinSet::new()));

        self.accepting.store(true, Ordering::SeqCst);
        let accept_task = tokio::spawn(accept_loop(
            self.config.clone(),
            listener,
            ctx,
            Arc::clone(&handler_tasks),
            shutdown.clone(),
            Arc::clone(&self.accepting),
        ));

        *running = Some(RunningServer {
            shutdown,
            accept_task,
            handler_tasks,
        });
        match self.local_addr.lock() {
            Ok(mut guard) => *guard = Some(addr),
            Err(poisoned) => *poisoned.into_inner() = Some(addr),
        }

        info!("{} started on {} ({} framing)", self.name(), addr, self.config.framing);
        Ok(addr)
    }

    /// Start, then wait until the server is stopped.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        let shutdown = {
            let running = self.running.lock().await;
            running.as_ref().map(|r| r.shutdown.clone())
        };
        if let Some(shutdown) = shutdown {
            shutdown.wait().await;
        }
        Ok(())
    }

    /// Stop accepting, close every connection and join the handler tasks
    /// within the configured shutdown timeout. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        match running {
            Some(running) => {
                self.shutdown_running(running).await;
                info!("{} stopped", self.name());
            }
            None => debug!("{} is not running", self.name()),
        }
    }

    async fn shutdown_running(&self, running: RunningServer) {
        let timeout = self.config.shutdown_timeout();
        running.shutdown.trigger();
        join_with_timeout(running.accept_task, timeout, self.name()).await;
        self.accepting.store(false, Ordering::SeqCst);

        let closed = self.connections.close_all();
        if !closed.is_empty() {
            info!("{}: closing {} connection(s)", self.name(), closed.len());
        }

        let mut tasks = match running.handler_tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        join_set_with_timeout(&mut tasks, timeout, "client handler").await;
    }

    /// Send a message to every live connection. Returns the delivery count.
    pub async fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        self.connections.broadcast(&message).await
    }

    /// Send a message on one connection.
    pub async fn respond(&self, connection: ConnectionId, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        self.connections.send_to(connection, &message).await
    }
}

async fn accept_loop(
    config: ServerConfig,
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    handler_tasks: HandlerTasks,
    shutdown: ShutdownSignal,
    accepting: Arc<AtomicBool>,
) {
    let name = config.name.as_str();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let connection = match Connection::open(stream, config.framing, config.max_frame_bytes()) {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("{}: dropping connection from {}: {}", name, peer, e);
                        continue;
                    }
                };
                let (handler, reader) = ClientHandler::new(connection, ctx.write_timeout);
                let id = handler.id();
                info!("Client {} connected to {} from {}", id, name, peer);

                ctx.connections.insert(Arc::clone(&handler));
                ctx.listeners.notify_connect(id, peer).await;

                let mut tasks = match handler_tasks.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                while tasks.try_join_next().is_some() {}
                tasks.spawn(handler.run(reader, Arc::clone(&ctx)));
            }
            Err(e) => {
                if shutdown.is_triggered() {
                    break;
                }
                let backoff = config.accept_error_backoff();
                warn!("{} accept error: {}; retrying in {:?}", name, e, backoff);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    accepting.store(false, Ordering::SeqCst);
    debug!("{} accept loop finished", name);
}

#[async_trait]
impl Service for AcceptorServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> Result<()> {
        AcceptorServer::start(self).await.map(|_| ())
    }

    async fn stop(&self) {
        AcceptorServer::stop(self).await
    }

    fn is_running(&self) -> bool {
        AcceptorServer::is_running(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, ListenerEvent};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::new("test", "127.0.0.1", 0);
        config.shutdown_timeout = Some(1.0);
        config
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout waiting for listener event")
            .expect("listener channel closed")
    }

    #[tokio::test]
    async fn test_respond_reaches_only_named_connection() {
        let server = AcceptorServer::new(test_config());
        let (listener, mut events) = ChannelListener::new();
        server.add_listener(listener);
        let addr = server.start().await.unwrap();

        let first = TcpStream::connect(addr).await.unwrap();
        let first_id = match next_event(&mut events).await {
            ListenerEvent::Connected(id, _) => id,
            other => panic!("unexpected event {:?}", other),
        };
        let second = TcpStream::connect(addr).await.unwrap();
        let second_id = match next_event(&mut events).await {
            ListenerEvent::Connected(id, _) => id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_ne!(first_id, second_id);

        server.respond(second_id, "only for you").await.unwrap();
        let mut second_lines = BufReader::new(second).lines();
        assert_eq!(second_lines.next_line().await.unwrap().as_deref(), Some("only for you"));

        let mut first_lines = BufReader::new(first).lines();
        let nothing = tokio::time::timeout(Duration::from_millis(100), first_lines.next_line()).await;
        assert!(nothing.is_err(), "first connection must not receive the response");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_respond_after_disconnect_is_not_found() {
        let server = AcceptorServer::new(test_config());
        let (listener, mut events) = ChannelListener::new();
        server.add_listener(listener);
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let id = match next_event(&mut events).await {
            ListenerEvent::Connected(id, _) => id,
            other => panic!("unexpected event {:?}", other),
        };
        client.write_all(b"bye\n").await.unwrap();
        assert_eq!(next_event(&mut events).await, ListenerEvent::Message(id, "bye".to_string()));
        drop(client);
        assert_eq!(next_event(&mut events).await, ListenerEvent::Disconnected(id));

        match server.respond(id, "too late").await {
            Err(LinkError::ConnectionNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected ConnectionNotFound, got {:?}", other),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let server = AcceptorServer::new(test_config());
        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.start().await.unwrap(), addr);

        let client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);

        let mut lines = BufReader::new(client).lines();
        let eof = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await.unwrap();
        assert!(matches!(eof, Ok(None) | Err(_)));

        // The listening socket is closed, so the port can be bound again
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_ingest_queue_receives_tagged_lines() {
        let ingest = Arc::new(MessageQueue::new());
        let server = AcceptorServer::new(test_config()).with_ingest_queue(Arc::clone(&ingest));
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PTP;0;0;0\nLIN;1;1;1\n").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), ingest.pop()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), ingest.pop()).await.unwrap();
        assert_eq!(first.line.as_str(), "PTP;0;0;0");
        assert_eq!(second.line.as_str(), "LIN;1;1;1");
        assert_eq!(first.connection, second.connection);

        server.respond(first.connection, "DONE").await.unwrap();
        let mut lines = BufReader::new(client).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("DONE"));

        server.stop().await;
    }
}
