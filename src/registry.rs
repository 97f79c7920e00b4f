//! Session registry: the authoritative map from username to live connection.
//!
//! Every operation takes the lock internally and returns owned data, so
//! callers never see the map half-updated and never hold a guard across a
//! socket write.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};

/// Identifies one accepted connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection, shared with other sessions for delivery.
///
/// Bytes pushed here are written to the socket by the owning connection's
/// task. Once that task is gone, sends fail instead of touching a closed
/// socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues bytes for the connection. Returns false if it already closed.
    pub fn send(&self, msg: impl Into<Bytes>) -> bool {
        self.tx.send(msg.into()).is_ok()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Result of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The username is now (or already was) bound to the caller's connection.
    Accepted,
    /// The username is bound to a different live connection.
    RejectedDuplicateElsewhere,
}

/// Concurrent map of username to connection handle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `username` to `handle` unless another connection holds it.
    ///
    /// Logging in again from the connection that already owns the name is
    /// accepted without touching the entry.
    pub async fn login(&self, username: &str, handle: ConnectionHandle) -> LoginOutcome {
        let mut sessions = self.sessions.write().await;

        match sessions.get(username) {
            Some(existing) if *existing == handle => LoginOutcome::Accepted,
            Some(_) => LoginOutcome::RejectedDuplicateElsewhere,
            None => {
                sessions.insert(username.to_string(), handle);
                LoginOutcome::Accepted
            }
        }
    }

    pub async fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.sessions.read().await.get(username).cloned()
    }

    /// Removes the entry for `username`. Removing an absent name is a no-op.
    pub async fn remove(&self, username: &str) -> Option<ConnectionHandle> {
        self.sessions.write().await.remove(username)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
