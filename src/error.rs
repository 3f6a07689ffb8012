//! Error types for robolink transport operations

use crate::connection::ConnectionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Queue full: capacity {0} reached")]
    QueueFull(usize),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("Frame exceeds {0} bytes without a delimiter")]
    FrameTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payload cannot be framed: {0}")]
    InvalidPayload(String),

    #[error("No reply within {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LinkError {
    /// True for failures the reconnect loop or handler teardown recovers from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Connection(_)
                | LinkError::NotConnected
                | LinkError::FrameTooLarge(_)
                | LinkError::Io(_)
                | LinkError::RequestTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_errors() {
        assert!(LinkError::NotConnected.is_transient());
        assert!(LinkError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_transient());
        assert!(LinkError::RequestTimeout(Duration::from_secs(1)).is_transient());
        assert!(!LinkError::QueueFull(8).is_transient());
        assert!(!LinkError::InvalidPayload("a#b".to_string()).is_transient());
        assert!(!LinkError::Config("bad".to_string()).is_transient());
    }
}
