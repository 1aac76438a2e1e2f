//! Client connections as seen by a session.
//!
//! A session only needs to push updates to a client; inbound actions arrive
//! through the session handle. Sends must never block the broadcast loop, so
//! a client whose buffer is full is treated the same as a disconnected one:
//! the session drops it, and the client reconnects for a fresh snapshot.

use thiserror::Error;
use tokio::sync::mpsc;

use quire_types::{ConnectionId, Update};

/// Per-connection send failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("client {0} is not keeping up")]
    Full(ConnectionId),

    #[error("client {0} has disconnected")]
    Closed(ConnectionId),
}

/// Outbound half of a connected client.
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// The notebook path this client asked for when it connected.
    fn notebook_path(&self) -> &str;

    /// Queue one update. Must not block.
    fn send_update(&self, update: Update) -> Result<(), ConnectionError>;
}

/// Connection backed by a bounded channel; the transport drains the receiver.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: ConnectionId,
    notebook_path: String,
    tx: mpsc::Sender<Update>,
}

impl ChannelConnection {
    /// Create a connection and the receiver its transport reads from.
    pub fn new(notebook_path: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<Update>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: ConnectionId::new(),
                notebook_path: notebook_path.into(),
                tx,
            },
            rx,
        )
    }
}

impl ClientConnection for ChannelConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn notebook_path(&self) -> &str {
        &self.notebook_path
    }

    fn send_update(&self, update: Update) -> Result<(), ConnectionError> {
        self.tx.try_send(update).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Full(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed(self.id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_closed() {
        let (conn, mut rx) = ChannelConnection::new("a.json", 1);
        assert_eq!(conn.notebook_path(), "a.json");

        conn.send_update(Update::session_status("idle")).unwrap();
        assert_eq!(
            conn.send_update(Update::session_status("busy")),
            Err(ConnectionError::Full(conn.id().clone()))
        );

        assert_eq!(rx.try_recv().ok(), Some(Update::session_status("idle")));
        drop(rx);
        assert_eq!(
            conn.send_update(Update::session_status("busy")),
            Err(ConnectionError::Closed(conn.id().clone()))
        );
    }
}
