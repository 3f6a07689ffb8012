//! Configuration loading for servers and clients

use crate::framing::{Framing, DEFAULT_MAX_FRAME_BYTES};
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Primary command ingest port on the robot controller
pub const DEFAULT_COMMAND_PORT: u16 = 30001;
/// Joint-state stream sent to the ROS PC
pub const DEFAULT_JOINT_LOG_PORT: u16 = 30002;
/// Log broadcast port
pub const DEFAULT_LOG_PORT: u16 = 30003;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    pub remote_log: Option<RemoteLogConfig>,
    pub supervisor: Option<SupervisorConfig>,
}

/// What a server does with the lines it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Queue inbound lines for a consumer and acknowledge each one
    #[default]
    Command,
    /// Broadcast published log lines to every subscriber
    Log,
    /// Reply to each line on the same connection
    Echo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_bind_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: ServerRole,
    #[serde(default)]
    pub framing: Framing,
    pub max_frame_bytes: Option<usize>,
    pub max_queued: Option<usize>,
    pub write_timeout: Option<f64>,
    pub shutdown_timeout: Option<f64>,
    pub accept_error_backoff: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
    /// Fixed delay between reconnect attempts, in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    pub connect_timeout: Option<f64>,
    pub write_timeout: Option<f64>,
    pub join_timeout: Option<f64>,
    pub max_frame_bytes: Option<usize>,
    pub max_queued: Option<usize>,
}

/// Format of forwarded log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteLogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteLogConfig {
    pub host: String,
    #[serde(default = "default_log_port")]
    pub port: u16,
    #[serde(default)]
    pub format: RemoteLogFormat,
    pub min_level: Option<String>,
    pub retry_delay: Option<f64>,
    pub max_queued: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    pub check_interval: Option<f64>,
    pub join_timeout: Option<f64>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_retry_delay() -> f64 {
    5.0
}

fn default_log_port() -> u16 {
    DEFAULT_LOG_PORT
}

/// Seconds as a `Duration`. Values `Duration` cannot hold fall back to the
/// default, so getters on an unvalidated config never panic.
fn seconds(value: Option<f64>, default: f64) -> Duration {
    value
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

fn check_duration(owner: &str, field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(v > 0.0 && Duration::try_from_secs_f64(v).is_ok()) => Err(LinkError::Config(format!(
            "{}: {} must be a positive number of seconds, got {}",
            owner, field, v
        ))),
        _ => Ok(()),
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                ServerConfig::new("command", default_bind_host(), DEFAULT_COMMAND_PORT),
                ServerConfig::new("log", default_bind_host(), DEFAULT_LOG_PORT).with_role(ServerRole::Log),
            ],
            clients: Vec::new(),
            remote_log: None,
            supervisor: None,
        }
    }
}

impl LinkConfig {
    pub fn load_from_path(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let contents = fs::read_to_string(config_path).map_err(|e| {
            LinkError::Config(format!("Failed to read {}: {}", config_path.display(), e))
        })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: LinkConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !names.insert(server.name.as_str()) {
                return Err(LinkError::Config(format!("Duplicate server name '{}'", server.name)));
            }
        }
        for client in &self.clients {
            client.validate()?;
        }
        if let Some(remote_log) = &self.remote_log {
            remote_log.client_config().validate()?;
        }
        if let Some(supervisor) = &self.supervisor {
            check_duration("supervisor", "check_interval", supervisor.check_interval)?;
            check_duration("supervisor", "join_timeout", supervisor.join_timeout)?;
        }
        Ok(())
    }

    /// Supervisor settings with default fallback
    pub fn supervisor(&self) -> SupervisorConfig {
        self.supervisor.clone().unwrap_or_default()
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            role: ServerRole::default(),
            framing: Framing::default(),
            max_frame_bytes: None,
            max_queued: None,
            write_timeout: None,
            shutdown_timeout: None,
            accept_error_backoff: None,
        }
    }

    pub fn with_role(mut self, role: ServerRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get max frame size with default fallback
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Get per-write timeout with default fallback
    pub fn write_timeout(&self) -> Duration {
        seconds(self.write_timeout, 5.0)
    }

    /// Get bounded join timeout used by `stop` with default fallback
    pub fn shutdown_timeout(&self) -> Duration {
        seconds(self.shutdown_timeout, 5.0)
    }

    /// Get pause after a failed accept with default fallback
    pub fn accept_error_backoff(&self) -> Duration {
        seconds(self.accept_error_backoff, 0.1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LinkError::Config("Server name must not be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(LinkError::Config(format!("{}: host must not be empty", self.name)));
        }
        if self.max_frame_bytes == Some(0) {
            return Err(LinkError::Config(format!("{}: max_frame_bytes must be positive", self.name)));
        }
        if self.max_queued == Some(0) {
            return Err(LinkError::Config(format!("{}: max_queued must be positive", self.name)));
        }
        check_duration(&self.name, "write_timeout", self.write_timeout)?;
        check_duration(&self.name, "shutdown_timeout", self.shutdown_timeout)?;
        check_duration(&self.name, "accept_error_backoff", self.accept_error_backoff)?;
        Ok(())
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            framing: Framing::default(),
            retry_delay: default_retry_delay(),
            connect_timeout: None,
            write_timeout: None,
            join_timeout: None,
            max_frame_bytes: None,
            max_queued: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay.as_secs_f64();
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = Some(max_queued);
        self
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(Some(self.retry_delay), default_retry_delay())
    }

    /// Get connect timeout with default fallback
    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout, 3.0)
    }

    /// Get per-write timeout with default fallback
    pub fn write_timeout(&self) -> Duration {
        seconds(self.write_timeout, 5.0)
    }

    /// Get sender/receiver join timeout with default fallback
    pub fn join_timeout(&self) -> Duration {
        seconds(self.join_timeout, 1.0)
    }

    /// Get max frame size with default fallback
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LinkError::Config(format!("{}: host must not be empty", self.name)));
        }
        if self.port == 0 {
            return Err(LinkError::Config(format!("{}: port must not be 0", self.name)));
        }
        if self.max_queued == Some(0) {
            return Err(LinkError::Config(format!("{}: max_queued must be positive", self.name)));
        }
        check_duration(&self.name, "retry_delay", Some(self.retry_delay))?;
        check_duration(&self.name, "connect_timeout", self.connect_timeout)?;
        check_duration(&self.name, "write_timeout", self.write_timeout)?;
        check_duration(&self.name, "join_timeout", self.join_timeout)?;
        Ok(())
    }
}

impl RemoteLogConfig {
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new("remote-log", self.host.clone(), self.port);
        if let Some(retry_delay) = self.retry_delay {
            client.retry_delay = retry_delay;
        }
        client.max_queued = Some(self.max_queued.unwrap_or(10_000));
        client
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Some(0.5),
            join_timeout: Some(5.0),
        }
    }
}

impl SupervisorConfig {
    /// Get watchdog period with default fallback
    pub fn check_interval(&self) -> Duration {
        seconds(self.check_interval, 0.5)
    }

    /// Get watchdog join timeout with default fallback
    pub fn join_timeout(&self) -> Duration {
        seconds(self.join_timeout, 5.0)
    }
}
