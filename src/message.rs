//! Message payload types

use crate::connection::ConnectionId;
use std::fmt;
use std::sync::Arc;

/// Immutable text payload of one frame.
///
/// The terminator is not part of the payload; framing adds and strips it.
/// Cloning is cheap so one message can be fanned out to many connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(Arc<str>);

impl Message {
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl AsRef<str> for Message {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A line received by a server, tagged with the connection it came from
/// so a consumer can `respond` to the originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub connection: ConnectionId,
    pub line: Message,
}

impl InboundMessage {
    pub fn new(connection: ConnectionId, line: impl Into<Message>) -> Self {
        Self {
            connection,
            line: line.into(),
        }
    }
}
