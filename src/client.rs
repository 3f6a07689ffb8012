//! Reconnecting TCP client
//!
//! The client keeps one outbound session alive: a connection loop connects,
//! runs a sender task and a receiver task for as long as the socket lives,
//! and reconnects after a fixed retry delay. Outbound messages go through a
//! [`MessageQueue`] so `enqueue` never blocks and survives disconnects.
//!
//! [`ReconnectingClient::request`] pairs an outbound line with the next
//! inbound line, for peers that answer every command.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionReader, ConnectionStatus, ConnectionWriter};
use crate::lifecycle::{join_with_timeout, Service, ShutdownSignal};
use crate::listener::{ListenerRegistry, MessageListener};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
        };
        f.write_str(name)
    }
}

struct ClientShared {
    config: ClientConfig,
    queue: Arc<MessageQueue<Message>>,
    listeners: ListenerRegistry,
    state: watch::Sender<ClientState>,
    current: Mutex<Option<Arc<ConnectionStatus>>>,
    /// Callers of `request` waiting for the next inbound line, oldest first
    replies: Mutex<VecDeque<oneshot::Sender<Message>>>,
}

impl ClientShared {
    fn set_state(&self, next: ClientState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("{}: {}", self.config.name, next);
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<ConnectionStatus>>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn replies(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<Message>>> {
        match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand a received line to the oldest waiting request. A waiter that
    /// already gave up still consumes the line so later replies stay aligned.
    fn answer_request(&self, line: &str) {
        if let Some(waiter) = self.replies().pop_front() {
            if waiter.send(Message::from(line)).is_err() {
                debug!("{}: discarding late reply {:?}", self.config.name, line);
            }
        }
    }
}

struct RunningClient {
    shutdown: ShutdownSignal,
    handle: JoinHandle<()>,
}

pub struct ReconnectingClient {
    shared: Arc<ClientShared>,
    running: Mutex<Option<RunningClient>>,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Self {
        let queue = Arc::new(MessageQueue::with_capacity_limit(config.max_queued));
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            shared: Arc::new(ClientShared {
                config,
                queue,
                listeners: ListenerRegistry::new(),
                state,
                current: Mutex::new(None),
                replies: Mutex::new(VecDeque::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.shared.listeners.add(listener);
    }

    /// Outbound queue shared with the sender task
    pub fn queue(&self) -> Arc<MessageQueue<Message>> {
        Arc::clone(&self.shared.queue)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Wait until the client reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: ClientState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the connection loop. A running client is left alone.
    pub fn start(&self) -> Result<()> {
        self.shared.config.validate()?;

        let mut running = self.lock_running();
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("{} already started", self.name());
                return Ok(());
            }
        }

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(connection_loop(Arc::clone(&self.shared), shutdown.clone()));
        *running = Some(RunningClient { shutdown, handle });
        info!("{}: connecting to {}", self.name(), self.shared.config.server_addr());
        Ok(())
    }

    /// Queue a message for sending. Succeeds while disconnected; fails with
    /// `InvalidPayload` for a message the framing cannot carry.
    pub fn enqueue(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        self.shared.config.framing.check(message.as_str())?;
        self.shared.queue.push(message)
    }

    /// Send a message and wait for the next line the server sends back.
    ///
    /// Only valid while connected. Requests are answered in the order they
    /// were made, one inbound line each, so the peer must reply to every
    /// line it receives. Messages already queued by `enqueue` are sent
    /// first. The reply is also delivered to listeners as usual.
    ///
    /// Fails with `RequestTimeout` when no line arrives in time, and with
    /// `NotConnected` when the connection drops before the reply. The
    /// message itself stays queued across a reconnect.
    pub async fn request(&self, message: impl Into<Message>, timeout: Duration) -> Result<Message> {
        let message = message.into();
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.shared.config.framing.check(message.as_str())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut replies = self.shared.replies();
            self.shared.queue.push(message)?;
            replies.push_back(tx);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => Err(LinkError::RequestTimeout(timeout)),
        }
    }

    /// Drop the current connection; the loop reconnects after the retry
    /// delay. Returns `false` when there was nothing to drop.
    pub fn disconnect(&self) -> bool {
        let current = self.shared.current().clone();
        match current {
            Some(status) => status.close(),
            None => false,
        }
    }

    /// Stop the client. Queued messages are flushed first when a connection
    /// is up, bounded by the join timeout. Idempotent.
    pub async fn dispose(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            debug!("{} already disposed", self.name());
            return;
        };

        let join_timeout = self.shared.config.join_timeout();
        if self.is_connected() && !self.shared.queue.is_empty() {
            let flushed = tokio::time::timeout(join_timeout, async {
                while self.is_connected() && !self.shared.queue.is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            if flushed.is_err() {
                warn!("{}: {} message(s) left unsent", self.name(), self.queued());
            }
        }

        running.shutdown.trigger();
        self.disconnect();
        // The loop itself joins the sender and receiver with the same timeout
        join_with_timeout(running.handle, join_timeout * 3, &self.shared.config.name).await;
        self.shared.set_state(ClientState::Disconnected);
        info!("{} disposed", self.name());
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningClient>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.trigger();
        }
    }
}

async fn connection_loop(shared: Arc<ClientShared>, shutdown: ShutdownSignal) {
    let name = shared.config.name.clone();
    let addr = shared.config.server_addr();
    let connect_timeout = shared.config.connect_timeout();
    let retry_delay = shared.config.retry_delay();

    loop {
        shared.set_state(ClientState::Connecting);
        let attempt = tokio::select! {
            _ = shutdown.wait() => break,
            attempt = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)) => attempt,
        };

        match attempt {
            Ok(Ok(stream)) => {
                match Connection::open(stream, shared.config.framing, shared.config.max_frame_bytes()) {
                    Ok(connection) => run_session(&shared, connection, &shutdown).await,
                    Err(e) => warn!("{}: could not set up connection to {}: {}", name, addr, e),
                }
            }
            Ok(Err(e)) => warn!("{}: connect to {} failed: {}", name, addr, e),
            Err(_) => warn!("{}: connect to {} timed out after {:?}", name, addr, connect_timeout),
        }

        shared.set_state(ClientState::Disconnected);
        if shutdown.is_triggered() {
            break;
        }
        debug!("{}: reconnecting in {:?}", name, retry_delay);
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }

    shared.set_state(ClientState::Disconnected);
    debug!("{}: connection loop stopped", name);
}

async fn run_session(shared: &Arc<ClientShared>, connection: Connection, shutdown: &ShutdownSignal) {
    let (status, reader, writer) = connection.into_parts();
    let id = status.id();
    let peer = status.peer();
    let join_timeout = shared.config.join_timeout();

    *shared.current() = Some(Arc::clone(&status));
    shared.replies().clear();
    shared.set_state(ClientState::Connected);
    info!("{}: connected to {} as {}", shared.config.name, peer, id);
    shared.listeners.notify_connect(id, peer).await;

    let sender = tokio::spawn(send_loop(
        Arc::clone(&shared.queue),
        writer,
        Arc::clone(&status),
        shared.config.write_timeout(),
    ));
    let receiver = tokio::spawn(receive_loop(reader, Arc::clone(&status), Arc::clone(shared)));

    // Either task closes the status when it ends
    tokio::select! {
        _ = status.closed() => {}
        _ = shutdown.wait() => {}
    }
    status.close();
    shared.set_state(ClientState::Disconnected);
    // Pending requests can no longer be answered on this connection
    shared.replies().clear();

    join_with_timeout(sender, join_timeout, "client sender").await;
    join_with_timeout(receiver, join_timeout, "client receiver").await;

    shared.current().take();
    shared.listeners.notify_disconnect(id).await;
    info!("{}: disconnected from {} ({})", shared.config.name, peer, id);
}

async fn send_loop(
    queue: Arc<MessageQueue<Message>>,
    mut writer: ConnectionWriter,
    status: Arc<ConnectionStatus>,
    write_timeout: Duration,
) {
    let id = status.id();
    loop {
        let message = tokio::select! {
            biased;
            _ = status.closed() => break,
            message = queue.pop() => message,
        };
        if !status.is_alive() {
            queue.push_front(message);
            break;
        }

        match tokio::time::timeout(write_timeout, writer.write_frame(&message)).await {
            Ok(Ok(())) => trace!("{}: sent {} byte(s)", id, message.len()),
            Ok(Err(LinkError::InvalidPayload(reason))) => {
                // Resending would fail the same way
                warn!("{}: dropping message: {}", id, reason);
            }
            Ok(Err(e)) => {
                warn!("{}: write failed, message requeued: {}", id, e);
                queue.push_front(message);
                break;
            }
            Err(_) => {
                warn!("{}: write timed out after {:?}, message requeued", id, write_timeout);
                queue.push_front(message);
                break;
            }
        }
    }

    status.close();
    if let Err(e) = writer.shutdown().await {
        debug!("{}: shutdown after close: {}", id, e);
    }
}

async fn receive_loop(mut reader: ConnectionReader, status: Arc<ConnectionStatus>, shared: Arc<ClientShared>) {
    let id = status.id();
    loop {
        let frame = tokio::select! {
            _ = status.closed() => break,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(Some(line)) => {
                shared.answer_request(&line);
                shared.listeners.notify_message(&line, id).await;
            }
            Ok(None) => {
                debug!("{}: server closed the connection", id);
                break;
            }
            Err(e) => {
                warn!("{}: read error: {}", id, e);
                break;
            }
        }
    }
    status.close();
}

#[async_trait]
impl Service for ReconnectingClient {
    fn name(&self) -> &str {
        ReconnectingClient::name(self)
    }

    async fn start(&self) -> Result<()> {
        ReconnectingClient::start(self)
    }

    async fn stop(&self) {
        self.dispose().await
    }

    fn is_running(&self) -> bool {
        ReconnectingClient::is_running(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, ListenerEvent};
    use crate::LinkError;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn local_server() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig::new("test-client", "127.0.0.1", port)
            .with_retry_delay(Duration::from_millis(100));
        (listener, config)
    }

    #[tokio::test]
    async fn test_enqueue_while_disconnected() {
        let client = ReconnectingClient::new(ClientConfig::new("idle", "127.0.0.1", 9).with_max_queued(2));
        assert_eq!(client.state(), ClientState::Disconnected);
        client.enqueue("one").unwrap();
        client.enqueue("two").unwrap();
        match client.enqueue("three") {
            Err(LinkError::QueueFull(2)) => {}
            other => panic!("expected QueueFull, got {:?}", other),
        }
        assert_eq!(client.queued(), 2);
        assert!(!client.disconnect());
    }

    #[tokio::test]
    async fn test_messages_queued_before_connect_arrive_in_order() {
        let (listener, config) = local_server().await;
        let client = ReconnectingClient::new(config);
        for i in 0..10 {
            client.enqueue(format!("JOINT;{}", i)).unwrap();
        }

        client.start().unwrap();
        client.start().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        for i in 0..10 {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(line, Some(format!("JOINT;{}", i)));
        }

        client.dispose().await;
        client.dispose().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_received_lines_reach_listeners() {
        let (listener, config) = local_server().await;
        let client = ReconnectingClient::new(config);
        let (events, mut rx) = ChannelListener::new();
        client.add_listener(events);
        client.start().unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let id = match rx.recv().await {
            Some(ListenerEvent::Connected(id, _)) => id,
            other => panic!("expected connect event, got {:?}", other),
        };
        assert!(client.wait_for_state(ClientState::Connected, Duration::from_secs(1)).await);

        stream.write_all(b"STOP\nRESUME\n").await.unwrap();
        assert_eq!(rx.recv().await, Some(ListenerEvent::Message(id, "STOP".to_string())));
        assert_eq!(rx.recv().await, Some(ListenerEvent::Message(id, "RESUME".to_string())));

        client.dispose().await;
        assert_eq!(rx.recv().await, Some(ListenerEvent::Disconnected(id)));
    }

    #[tokio::test]
    async fn test_disconnect_triggers_reconnect_with_new_id() {
        let (listener, config) = local_server().await;
        let client = ReconnectingClient::new(config);
        let (events, mut rx) = ChannelListener::new();
        client.add_listener(events);
        client.start().unwrap();

        let (_first, _) = listener.accept().await.unwrap();
        let first_id = match rx.recv().await {
            Some(ListenerEvent::Connected(id, _)) => id,
            other => panic!("expected connect event, got {:?}", other),
        };

        assert!(client.disconnect());
        assert_eq!(rx.recv().await, Some(ListenerEvent::Disconnected(first_id)));

        let (_second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("client should reconnect")
            .unwrap();
        match rx.recv().await {
            Some(ListenerEvent::Connected(id, _)) => assert_ne!(id, first_id),
            other => panic!("expected connect event, got {:?}", other),
        }

        client.dispose().await;
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_retrying_until_disposed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new("refused", "127.0.0.1", port).with_retry_delay(Duration::from_millis(20));
        let client = ReconnectingClient::new(config);
        client.enqueue("held").unwrap();
        client.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.is_running());
        assert!(!client.is_connected());

        tokio::time::timeout(Duration::from_secs(5), client.dispose()).await.unwrap();
        assert_eq!(client.queued(), 1);
    }

    #[tokio::test]
    async fn test_unframeable_message_is_rejected_at_enqueue() {
        let config = ClientConfig::new("cmd", "127.0.0.1", 9).with_framing(crate::Framing::Sentinel(b'#'));
        let client = ReconnectingClient::new(config);
        match client.enqueue("FREE|#") {
            Err(LinkError::InvalidPayload(_)) => {}
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
        assert_eq!(client.queued(), 0);
        client.enqueue("FREE|12").unwrap();
        assert_eq!(client.queued(), 1);
    }

    #[tokio::test]
    async fn test_request_requires_connection() {
        let client = ReconnectingClient::new(ClientConfig::new("idle", "127.0.0.1", 9));
        match client.request("GET_POSE", Duration::from_millis(50)).await {
            Err(LinkError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_answer_next_request() {
        let (listener, config) = local_server().await;
        let client = ReconnectingClient::new(config);
        let (events, mut rx) = ChannelListener::new();
        client.add_listener(events);
        client.start().unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        assert!(client.wait_for_state(ClientState::Connected, Duration::from_secs(1)).await);

        match client.request("GET_POSE", Duration::from_millis(100)).await {
            Err(LinkError::RequestTimeout(_)) => {}
            other => panic!("expected RequestTimeout, got {:?}", other),
        }
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("GET_POSE"));
        write_half.write_all(b"late\n").await.unwrap();
        loop {
            match rx.recv().await {
                Some(ListenerEvent::Message(_, line)) => {
                    assert_eq!(line, "late");
                    break;
                }
                Some(_) => continue,
                None => panic!("listener channel closed"),
            }
        }

        let server = async {
            let line = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(format!("Received: {}\n", line).as_bytes()).await.unwrap();
        };
        let (reply, ()) = tokio::join!(client.request("GET_JOINTS", Duration::from_secs(2)), server);
        assert_eq!(reply.unwrap().as_str(), "Received: GET_JOINTS");

        client.dispose().await;
    }

    #[tokio::test]
    async fn test_request_fails_when_connection_drops() {
        let (listener, config) = local_server().await;
        let client = ReconnectingClient::new(config);
        client.start().unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        assert!(client.wait_for_state(ClientState::Connected, Duration::from_secs(1)).await);

        let server = async {
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
            // Dropping the stream closes the connection without a reply
        };
        let (reply, ()) = tokio::join!(client.request("MOVE;1", Duration::from_secs(2)), server);
        match reply {
            Err(LinkError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }

        client.dispose().await;
    }

    #[tokio::test]
    async fn test_timed_out_write_is_requeued_first_on_new_connection() {
        let (listener, mut config) = local_server().await;
        config.write_timeout = Some(0.2);
        config.join_timeout = Some(0.5);
        let client = ReconnectingClient::new(config);

        // More than the socket buffers hold, so writes stall while the peer is not reading
        let padding = "x".repeat(64 * 1024);
        for i in 0..300 {
            client.enqueue(format!("{:05}{}", i, padding)).unwrap();
        }
        client.start().unwrap();

        let (first, _) = listener.accept().await.unwrap();
        let (second, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("client should reconnect after the write timeout")
            .unwrap();

        // Complete frames delivered before the stall
        let mut first = BufReader::new(first);
        let mut delivered = 0;
        loop {
            let mut frame = Vec::new();
            let read = tokio::time::timeout(Duration::from_secs(5), first.read_until(b'\n', &mut frame))
                .await
                .expect("first connection should reach EOF")
                .unwrap_or(0);
            if read == 0 || frame.last() != Some(&b'\n') {
                break;
            }
            delivered += 1;
        }
        assert!(delivered < 300);

        let mut lines = BufReader::new(second).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(
            line.starts_with(&format!("{:05}", delivered)),
            "expected message {} first, got {:?}",
            delivered,
            &line[..5]
        );

        client.dispose().await;
    }

    #[tokio::test]
    async fn test_disconnect_reports_state_while_writer_is_stuck() {
        let (listener, mut config) = local_server().await;
        config.write_timeout = Some(30.0);
        config.join_timeout = Some(2.0);
        let client = ReconnectingClient::new(config);

        let padding = "x".repeat(64 * 1024);
        for i in 0..300 {
            client.enqueue(format!("{:05}{}", i, padding)).unwrap();
        }
        client.start().unwrap();

        let (_stalled, _) = listener.accept().await.unwrap();
        assert!(client.wait_for_state(ClientState::Connected, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(client.disconnect());
        assert!(client.wait_for_state(ClientState::Disconnected, Duration::from_millis(300)).await);
        assert!(!client.is_connected());

        client.dispose().await;
    }
}
