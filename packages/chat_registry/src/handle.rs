use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::error::SendError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a single connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next identity
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Send-only capability for one connection.
///
/// Cloning a handle does not extend the connection's life in any meaningful
/// way: the owner holds the receiving half of the queue, and once it drops
/// that half every `send` fails with [`SendError::Closed`]. Sends never wait
/// for queue capacity, so a recipient that stops reading only loses its own
/// messages.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound queue, allocating a fresh identity
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            tx,
        }
    }

    /// Create a handle together with the bounded queue it feeds
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue text for the connection without waiting.
    ///
    /// Fails with [`SendError::Full`] when the queue has no free slot.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.tx.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }
}
