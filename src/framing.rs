//! Wire framing for line-oriented messages
//!
//! Most peers speak newline-terminated text. Some legacy controller peers
//! terminate each message with a single sentinel byte instead (`#` for the
//! command protocol, `@` for camera calibration poses), so the delimiter is a
//! per-port configuration value.

use crate::{LinkError, Message, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for a single inbound frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Delimiter convention for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Framing {
    /// `\n` terminated; a trailing `\r` is stripped on read
    #[default]
    Newline,
    /// Terminated by a single ASCII sentinel byte
    Sentinel(u8),
}

impl Framing {
    pub fn delimiter(self) -> u8 {
        match self {
            Framing::Newline => b'\n',
            Framing::Sentinel(byte) => byte,
        }
    }

    /// Reject payloads that would not survive a round trip: any payload
    /// containing the delimiter, and for newline framing one ending in `\r`.
    pub fn check(self, payload: &str) -> Result<()> {
        let delimiter = self.delimiter();
        if payload.as_bytes().contains(&delimiter) {
            return Err(LinkError::InvalidPayload(format!(
                "{:?} contains the {} delimiter",
                payload, self
            )));
        }
        if self == Framing::Newline && payload.ends_with('\r') {
            return Err(LinkError::InvalidPayload(format!(
                "{:?} ends with a carriage return",
                payload
            )));
        }
        Ok(())
    }

    /// Payload followed by the delimiter.
    pub fn encode(self, payload: &str) -> Result<Vec<u8>> {
        self.check(payload)?;
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.extend_from_slice(payload.as_bytes());
        bytes.push(self.delimiter());
        Ok(bytes)
    }

    /// Strip the delimiter (and `\r` for newline framing) from a raw frame.
    pub fn decode(self, mut raw: Vec<u8>) -> String {
        if raw.last() == Some(&self.delimiter()) {
            raw.pop();
        }
        if self == Framing::Newline && raw.last() == Some(&b'\r') {
            raw.pop();
        }
        match String::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Newline => write!(f, "newline"),
            Framing::Sentinel(byte) => write!(f, "{}", *byte as char),
        }
    }
}

impl TryFrom<String> for Framing {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "newline" | "\n" => Ok(Framing::Newline),
            other => {
                let bytes = other.as_bytes();
                if bytes.len() == 1 && bytes[0].is_ascii() && !bytes[0].is_ascii_alphanumeric() {
                    Ok(Framing::Sentinel(bytes[0]))
                } else {
                    Err(LinkError::Config(format!(
                        "Invalid framing '{}': expected \"newline\" or a single punctuation character",
                        other
                    )))
                }
            }
        }
    }
}

impl From<Framing> for String {
    fn from(framing: Framing) -> Self {
        framing.to_string()
    }
}

/// Reads delimiter-terminated frames from a buffered stream
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            framing,
            max_frame_bytes,
            buf: Vec::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. A final unterminated frame
    /// before EOF is still delivered. Cancel-safe only between frames: a
    /// partially read frame is kept in the internal buffer and completed by
    /// the next call.
    pub async fn read_frame(&mut self) -> Result<Option<String>> {
        let delimiter = self.framing.delimiter();
        loop {
            let remaining = self.max_frame_bytes.saturating_add(1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(remaining)
                .read_until(delimiter, &mut self.buf)
                .await?;

            if self.buf.last() == Some(&delimiter) {
                let raw = std::mem::take(&mut self.buf);
                return Ok(Some(self.framing.decode(raw)));
            }
            if self.buf.len() > self.max_frame_bytes {
                self.buf.clear();
                return Err(LinkError::FrameTooLarge(self.max_frame_bytes));
            }
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let raw = std::mem::take(&mut self.buf);
                return Ok(Some(self.framing.decode(raw)));
            }
        }
    }
}

/// Writes frames to a stream, flushing after each one
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    /// Write one frame. A payload the framing cannot carry is rejected with
    /// `InvalidPayload` before anything is written.
    pub async fn write_frame(&mut self, message: &Message) -> Result<()> {
        let bytes = self.framing.encode(message.as_str())?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
