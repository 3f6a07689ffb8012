//! Interactive line client
//!
//! Keeps a reconnecting session to a robolink server, sends every stdin line
//! and prints every line received. Lines typed while the server is away are
//! queued and sent after the next reconnect.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use robolink::{ClientConfig, ConnectionId, Framing, MessageListener, ReconnectingClient};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "link_client")]
#[command(about = "Send stdin lines to a robolink server and print replies")]
#[command(version)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = robolink::config::DEFAULT_COMMAND_PORT)]
    port: u16,

    /// Seconds between reconnect attempts
    #[arg(short, long, default_value_t = 5.0)]
    retry_delay: f64,

    /// Message delimiter: "newline" or a single punctuation character
    #[arg(short, long, default_value = "newline", value_parser = parse_framing)]
    framing: Framing,
}

fn parse_framing(value: &str) -> std::result::Result<Framing, String> {
    Framing::try_from(value.to_string()).map_err(|e| e.to_string())
}

struct PrintListener;

#[async_trait]
impl MessageListener for PrintListener {
    async fn on_message(&self, line: &str, _connection: ConnectionId) {
        println!("{}", line);
    }

    async fn on_disconnect(&self, connection: ConnectionId) {
        warn!("Connection {} lost; reconnecting", connection);
    }

    async fn on_connect(&self, connection: ConnectionId, peer: std::net::SocketAddr) {
        info!("Connected to {} as {}", peer, connection);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::new("link_client", args.host, args.port).with_framing(args.framing);
    config.retry_delay = args.retry_delay;
    config.validate().context("Invalid client settings")?;
    let client = Arc::new(ReconnectingClient::new(config));
    client.add_listener(Arc::new(PrintListener));
    client.start().context("Failed to start client")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => client.enqueue(line).context("Failed to queue line")?,
                    None => {
                        info!("End of input");
                        break;
                    }
                }
            }
        }
    }

    client.dispose().await;
    Ok(())
}
