//! One live TCP connection
//!
//! A `Connection` is created on a successful accept or connect and split into
//! a framed reader and a framed writer owned by the tasks that drive them.
//! The shared [`ConnectionStatus`] carries the alive flag and the close
//! signal; closing is idempotent and wakes every task waiting on the
//! connection. The socket itself is released when both halves are dropped,
//! which happens when their owning tasks end.

use crate::framing::{FrameReader, FrameWriter, Framing};
use crate::Result;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type ConnectionReader = FrameReader<BufReader<OwnedReadHalf>>;
pub type ConnectionWriter = FrameWriter<OwnedWriteHalf>;

/// Alive flag and close signal shared by everything touching one connection
#[derive(Debug)]
pub struct ConnectionStatus {
    id: ConnectionId,
    peer: SocketAddr,
    closed: watch::Sender<bool>,
}

impl ConnectionStatus {
    fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self { id, peer, closed }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Mark the connection dead. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            debug!("{} ({}) closed", self.id, self.peer);
        }
        first
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A freshly opened socket with its framed halves
pub struct Connection {
    status: Arc<ConnectionStatus>,
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    pub fn open(stream: TcpStream, framing: Framing, max_frame_bytes: usize) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            status: Arc::new(ConnectionStatus::new(ConnectionId::next(), peer)),
            reader: FrameReader::new(BufReader::new(read_half), framing, max_frame_bytes),
            writer: FrameWriter::new(write_half, framing),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.status.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.status.peer()
    }

    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    pub fn into_parts(self) -> (Arc<ConnectionStatus>, ConnectionReader, ConnectionWriter) {
        (self.status, self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let _client = connect.await.unwrap();

        let connection = Connection::open(accepted, Framing::Newline, 1024).unwrap();
        let status = connection.status();
        assert!(status.is_alive());

        let waiter = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.closed().await })
        };

        assert!(status.close());
        assert!(!status.close());
        assert!(!status.is_alive());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close should wake waiters")
            .unwrap();

        // Waiting on an already-closed connection returns immediately
        tokio::time::timeout(Duration::from_millis(100), status.closed())
            .await
            .unwrap();
    }
}
