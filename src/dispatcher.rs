//! Broadcast fan-out for centralized logging
//!
//! A [`BroadcastDispatcher`] is a single consumer task that drains a shared
//! queue and hands each message to every connection currently in a
//! [`ConnectionSet`]. Subscribers that join later never see earlier
//! messages. [`LogServer`] bundles an acceptor, the queue and the dispatcher
//! behind a `publish` call.

use crate::config::ServerConfig;
use crate::handler::ConnectionSet;
use crate::lifecycle::{join_with_timeout, Service, ShutdownSignal};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::server::AcceptorServer;
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub struct BroadcastDispatcher {
    shutdown: ShutdownSignal,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl BroadcastDispatcher {
    pub fn spawn(
        queue: Arc<MessageQueue<Message>>,
        connections: Arc<ConnectionSet>,
        join_timeout: Duration,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(dispatch_loop(queue, connections, shutdown.clone()));
        Self {
            shutdown,
            handle: std::sync::Mutex::new(Some(handle)),
            join_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        let handle = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the consumer task. Messages still queued stay queued. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            join_with_timeout(handle, self.join_timeout, "broadcast dispatcher").await;
        }
    }
}

async fn dispatch_loop(queue: Arc<MessageQueue<Message>>, connections: Arc<ConnectionSet>, shutdown: ShutdownSignal) {
    debug!("Broadcast dispatcher started");
    loop {
        let message = tokio::select! {
            _ = shutdown.wait() => break,
            message = queue.pop() => message,
        };
        let delivered = connections.broadcast(&message).await;
        trace!("Dispatched {} byte(s) to {} subscriber(s)", message.len(), delivered);
    }
    debug!("Broadcast dispatcher stopped");
}

/// Acceptor whose subscribers receive every published message
pub struct LogServer {
    server: AcceptorServer,
    queue: Arc<MessageQueue<Message>>,
    dispatcher: Mutex<Option<BroadcastDispatcher>>,
}

impl LogServer {
    pub fn new(config: ServerConfig) -> Self {
        let queue = Arc::new(MessageQueue::with_capacity_limit(config.max_queued));
        Self {
            server: AcceptorServer::new(config),
            queue,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn server(&self) -> &AcceptorServer {
        &self.server
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Messages published but not yet dispatched
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.server.start().await?;
        let mut dispatcher = self.dispatcher.lock().await;
        let alive = dispatcher.as_ref().map(|d| d.is_running()).unwrap_or(false);
        if !alive {
            if let Some(stale) = dispatcher.take() {
                stale.stop().await;
            }
            *dispatcher = Some(BroadcastDispatcher::spawn(
                Arc::clone(&self.queue),
                self.server.connections(),
                self.server.config().shutdown_timeout(),
            ));
        }
        Ok(addr)
    }

    pub async fn stop(&self) {
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop().await;
        }
        self.server.stop().await;
    }

    /// Queue a message for every current subscriber.
    pub fn publish(&self, message: impl Into<Message>) -> Result<()> {
        if !self.is_running() {
            return Err(LinkError::NotRunning(self.name().to_string()));
        }
        let message = message.into();
        self.server.config().framing.check(message.as_str())?;
        self.queue.push(message)
    }
}

#[async_trait]
impl Service for LogServer {
    fn name(&self) -> &str {
        LogServer::name(self)
    }

    async fn start(&self) -> Result<()> {
        let addr = LogServer::start(self).await?;
        info!("{} broadcasting on {}", self.name(), addr);
        Ok(())
    }

    async fn stop(&self) {
        LogServer::stop(self).await
    }

    fn is_running(&self) -> bool {
        LogServer::is_running(self)
    }
}
