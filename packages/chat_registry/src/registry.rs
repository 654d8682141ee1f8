use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::handle::{ConnectionHandle, ConnectionId};

/// Registry of connected usernames.
///
/// Holds at most one handle per username; a later registration replaces the
/// earlier one without touching the replaced connection. The map lock is only
/// held while reading or mutating the map. Sends never wait on a recipient:
/// text for a connection whose queue is full is dropped and counted.
pub struct Registry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    dropped: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Map `username` to `handle`, replacing any previous mapping.
    ///
    /// Returns the identity of the replaced connection, if there was one.
    pub async fn register(
        &self,
        username: impl Into<String>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionId> {
        let username = username.into();
        let conn_id = handle.id();
        let (replaced, total) = {
            let mut conns = self.connections.write().await;
            let replaced = conns.insert(username.clone(), handle).map(|h| h.id());
            (replaced, conns.len())
        };

        match replaced {
            Some(old) => debug!(%username, %conn_id, replaced = %old, total, "registration replaced"),
            None => debug!(%username, %conn_id, total, "registered"),
        }
        replaced
    }

    /// Remove `username` if it is still mapped to connection `id`.
    ///
    /// Absent usernames and usernames that have since been taken over by a
    /// newer connection are left untouched. Returns whether an entry was removed.
    pub async fn deregister(&self, username: &str, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut conns = self.connections.write().await;
            let owned = conns.get(username).is_some_and(|h| h.id() == id);
            if owned {
                conns.remove(username);
            }
            (owned, conns.len())
        };

        if removed {
            debug!(%username, conn_id = %id, total, "deregistered");
        } else {
            debug!(%username, conn_id = %id, "deregister skipped, entry absent or superseded");
        }
        removed
    }

    /// Handle currently registered for `username`
    pub async fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(username).cloned()
    }

    /// Send `text` to `username` if connected.
    ///
    /// Returns `false` when the username is unknown, its connection has gone
    /// away, or its queue is full. None of these is an error for the caller.
    pub async fn route_to(&self, username: &str, text: impl Into<String>) -> bool {
        let Some(handle) = self.lookup(username).await else {
            debug!(recipient = %username, "route miss, recipient not registered");
            return false;
        };

        match handle.send(text) {
            Ok(()) => true,
            Err(e) => {
                self.send_failed(username, &e, "directed message");
                false
            }
        }
    }

    /// Send `text` to every connection registered at the time of the call.
    ///
    /// A failing or full recipient does not affect the others. Returns the
    /// number of connections that accepted the text.
    pub async fn broadcast(&self, text: &str) -> usize {
        let snapshot: Vec<(String, ConnectionHandle)> = {
            let conns = self.connections.read().await;
            conns
                .iter()
                .map(|(name, handle)| (name.clone(), handle.clone()))
                .collect()
        };

        let recipients = snapshot.len();
        let mut delivered = 0;
        for (username, handle) in &snapshot {
            match handle.send(text) {
                Ok(()) => delivered += 1,
                Err(e) => self.send_failed(username, &e, "broadcast"),
            }
        }

        debug!(recipients, delivered, "broadcast");
        delivered
    }

    fn send_failed(&self, username: &str, error: &SendError, what: &str) {
        match error {
            SendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(recipient = %username, error = %error, "dropped {}", what);
            }
            SendError::Closed(_) => {
                debug!(recipient = %username, error = %error, "failed to deliver {}", what);
            }
        }
    }

    /// Number of registered connections
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sorted list of registered usernames
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Texts dropped so far because a recipient's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
