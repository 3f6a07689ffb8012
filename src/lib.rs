//! robolink - resilient line-oriented TCP messaging for robot cells
//!
//! This library moves text lines between robot-control code and its peers
//! without blocking the caller: acceptor servers with one handler task per
//! connection, a broadcast dispatcher for centralized logging, a reconnecting
//! client with decoupled sender and receiver, and a supervisor that restarts
//! services that stop unexpectedly.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use robolink::{AcceptorServer, ReconnectingClient, ServerConfig, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = AcceptorServer::new(ServerConfig::new("command", "127.0.0.1", 30001));
//!     server.start().await?;
//!
//!     let client = ReconnectingClient::new(ClientConfig::new("ros", "127.0.0.1", 30001));
//!     client.start()?;
//!     client.enqueue("MOVE;0.1;0.2;0.3")?;
//!
//!     client.dispose().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **AcceptorServer**: bind/accept loop, one ClientHandler per connection
//! - **BroadcastDispatcher** / **LogServer**: fan one queue out to every subscriber
//! - **ReconnectingClient**: persistent outbound session with a fixed retry delay
//! - **MessageQueue**: non-blocking FIFO between producers and I/O tasks
//! - **Supervisor**: ordered start/stop and restart of failed services
//! - **RemoteLogLayer**: forwards `tracing` events through a ReconnectingClient

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handler;
pub mod lifecycle;
pub mod listener;
pub mod message;
pub mod queue;
pub mod remote_log;
pub mod server;

// High-level exports for easy usage
pub use client::{ClientState, ReconnectingClient};
pub use config::{ClientConfig, LinkConfig, RemoteLogConfig, RemoteLogFormat, ServerConfig, ServerRole, SupervisorConfig};
pub use dispatcher::{BroadcastDispatcher, LogServer};
pub use error::{LinkError, Result};
pub use listener::{MessageListener, ListenerRegistry};
pub use message::{InboundMessage, Message};
pub use server::AcceptorServer;

// Core component exports for advanced usage
pub use connection::{Connection, ConnectionId, ConnectionStatus};
pub use framing::{FrameReader, FrameWriter, Framing};
pub use handler::{ClientHandler, ConnectionSet};
pub use lifecycle::{join_with_timeout, Service, ShutdownSignal, Supervisor};
pub use listener::{ChannelListener, ListenerEvent};
pub use queue::MessageQueue;
pub use remote_log::RemoteLogLayer;
