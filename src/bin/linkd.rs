//! robolink daemon
//!
//! Runs every server and client named in the configuration under one
//! supervisor:
//! - command servers acknowledge each line with `Received: <line>` and mirror
//!   the traffic into the log server
//! - log servers broadcast mirrored traffic to every subscriber
//! - echo servers reply on the connection a line arrived on
//! - configured clients keep an outbound session open and log what they receive

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use robolink::{
    join_with_timeout, AcceptorServer, ConnectionId, ConnectionSet, InboundMessage, LinkConfig, LogServer, Message,
    MessageListener, MessageQueue, ReconnectingClient, RemoteLogLayer, ServerConfig, ServerRole, ShutdownSignal,
    Supervisor,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/robolink.yaml";

#[derive(Parser)]
#[command(name = "linkd")]
#[command(about = "Robot cell messaging daemon - command ingest, log broadcast and reconnecting clients")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<String>,
}

impl Args {
    fn get_config_path(&self) -> Option<String> {
        self.config
            .clone()
            .or_else(|| std::env::var("LINK_CONFIG_PATH").ok())
    }
}

/// Replies on the connection each line arrived on
struct EchoListener {
    connections: Arc<ConnectionSet>,
}

#[async_trait]
impl MessageListener for EchoListener {
    async fn on_message(&self, line: &str, connection: ConnectionId) {
        let reply = Message::from(format!("Received: {}", line));
        if let Err(e) = self.connections.send_to(connection, &reply).await {
            debug!("Echo to {} failed: {}", connection, e);
        }
    }

    async fn on_disconnect(&self, connection: ConnectionId) {
        debug!("Echo peer {} left", connection);
    }
}

/// Logs lines received by an outbound client
struct ClientLogListener {
    name: String,
}

#[async_trait]
impl MessageListener for ClientLogListener {
    async fn on_message(&self, line: &str, connection: ConnectionId) {
        info!("{} <- {}: {}", self.name, connection, line);
    }

    async fn on_disconnect(&self, connection: ConnectionId) {
        warn!("{} lost connection {}", self.name, connection);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.get_config_path().as_deref())?;

    // The remote log client has to exist before the subscriber is installed
    let remote_log = match &config.remote_log {
        Some(remote) => {
            let client = Arc::new(ReconnectingClient::new(remote.client_config()));
            let layer = RemoteLogLayer::from_config(remote, &client).context("Invalid remote_log section")?;
            Some((client, layer))
        }
        None => None,
    };
    let (remote_client, remote_layer) = match remote_log {
        Some((client, layer)) => (Some(client), Some(layer)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(remote_layer)
        .init();

    info!("robolink daemon");
    info!("{}", "=".repeat(50));

    let supervisor_config = config.supervisor();
    let mut supervisor = Supervisor::new(supervisor_config.check_interval(), supervisor_config.join_timeout());
    let shutdown = ShutdownSignal::new();
    let mut consumers = Vec::new();

    let log_server = config
        .servers
        .iter()
        .find(|server| server.role == ServerRole::Log)
        .map(|server| Arc::new(LogServer::new(server.clone())));
    if let Some(log_server) = &log_server {
        supervisor.add(log_server.clone());
    }

    for server_config in &config.servers {
        match server_config.role {
            ServerRole::Log => {
                if log_server.as_ref().map(|s| s.name()) != Some(server_config.name.as_str()) {
                    warn!("{}: only one log server is supported; skipping", server_config.name);
                }
            }
            ServerRole::Command => {
                let (server, consumer) = command_server(server_config.clone(), log_server.clone(), shutdown.clone());
                supervisor.add(server);
                consumers.push(consumer);
            }
            ServerRole::Echo => {
                let server = Arc::new(AcceptorServer::new(server_config.clone()));
                server.add_listener(Arc::new(EchoListener {
                    connections: server.connections(),
                }));
                supervisor.add(server);
            }
        }
    }

    for client_config in &config.clients {
        let client = Arc::new(ReconnectingClient::new(client_config.clone()));
        client.add_listener(Arc::new(ClientLogListener {
            name: client_config.name.clone(),
        }));
        supervisor.add(client);
    }

    if let Some(client) = &remote_client {
        client.start().context("Failed to start remote log client")?;
        info!("Forwarding logs to {}", client.config().server_addr());
    }

    // Services that fail here are retried by the watchdog
    if let Err(e) = supervisor.start_all().await {
        error!("Not every service started: {}", e);
        error!("Make sure:");
        error!("   - Configured ports are free");
        error!("   - Network connectivity is available");
    }
    info!("Ready with {} service(s); press Ctrl+C to stop", supervisor.services().len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Performing graceful shutdown");
    shutdown.trigger();
    for consumer in consumers {
        join_with_timeout(consumer, supervisor_config.join_timeout(), "command consumer").await;
    }
    supervisor.stop_all().await;
    if let Some(client) = remote_client {
        client.dispose().await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<LinkConfig> {
    match path {
        Some(path) => LinkConfig::load_from_path(path).with_context(|| format!("Failed to load config from {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => LinkConfig::load_from_path(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG_PATH)),
        None => Ok(LinkConfig::default()),
    }
}

/// A command server plus the task answering its ingest queue
fn command_server(
    config: ServerConfig,
    log_server: Option<Arc<LogServer>>,
    shutdown: ShutdownSignal,
) -> (Arc<AcceptorServer>, tokio::task::JoinHandle<()>) {
    let ingest = Arc::new(MessageQueue::with_capacity_limit(config.max_queued));
    let server = Arc::new(AcceptorServer::new(config).with_ingest_queue(Arc::clone(&ingest)));
    let consumer = tokio::spawn(answer_commands(Arc::clone(&server), ingest, log_server, shutdown));
    (server, consumer)
}

async fn answer_commands(
    server: Arc<AcceptorServer>,
    ingest: Arc<MessageQueue<InboundMessage>>,
    log_server: Option<Arc<LogServer>>,
    shutdown: ShutdownSignal,
) {
    loop {
        let inbound = tokio::select! {
            _ = shutdown.wait() => break,
            inbound = ingest.pop() => inbound,
        };

        info!("{} <- {}: {}", server.name(), inbound.connection, inbound.line);
        if let Some(log_server) = &log_server {
            if let Err(e) = log_server.publish(format!("{} {}: {}", server.name(), inbound.connection, inbound.line)) {
                debug!("Log mirror unavailable: {}", e);
            }
        }

        let reply = format!("Received: {}", inbound.line);
        if let Err(e) = server.respond(inbound.connection, reply).await {
            warn!("{}: could not acknowledge {}: {}", server.name(), inbound.connection, e);
        }
    }
    debug!("{} command consumer stopped", server.name());
}
