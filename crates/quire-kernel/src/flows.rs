//! FlowBus pub/sub for session observability events.
//!
//! Sessions publish soft failures here instead of propagating them: failed
//! actions, filtered actions, correlation misses, expired executions,
//! persistence failures and dropped clients. The server subscribes a logger;
//! tests subscribe to assert on them.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `session.*` matches `session.persist_failed`
//! - `>` matches one or more tokens (only at end): `session.>`
//! - Exact match: `session.renamed` only matches `session.renamed`

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use quire_types::{CellRef, ConnectionId, RequestId};

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a NATS-style pattern.
///
/// ```ignore
/// assert!(matches_pattern("session.*", "session.renamed"));
/// assert!(matches_pattern("session.>", "session.kernel.dead"));
/// assert!(!matches_pattern("session.*", "session.kernel.dead"));
/// ```
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload).
    pub subject: String,
    pub payload: T,
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        let subject = payload.subject().to_string();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
        }
    }
}

// ============================================================================
// Session Flow Events
// ============================================================================

/// Soft-failure and lifecycle events emitted by sessions.
///
/// Every variant carries the notebook path of the session that emitted it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionFlow {
    /// The document rejected an action; no update was broadcast.
    ActionFailed {
        notebook_path: String,
        action: String,
        error: String,
    },

    /// A pipeline processor filtered an action before it reached the document.
    ActionFiltered {
        notebook_path: String,
        action: String,
        processor: String,
        reason: String,
    },

    /// A kernel event named a request id the correlation table does not hold.
    CorrelationMiss {
        notebook_path: String,
        request_id: RequestId,
        event: String,
    },

    /// An execution passed its deadline without a reply.
    ExecutionExpired {
        notebook_path: String,
        request_id: RequestId,
        cell: CellRef,
    },

    /// Writing the notebook to storage failed. The in-memory copy is intact.
    PersistFailed { notebook_path: String, error: String },

    /// A client was removed after a failed send.
    ClientDropped {
        notebook_path: String,
        connection_id: ConnectionId,
        reason: String,
    },

    /// The notebook moved to a new path.
    Renamed { from: String, to: String },
}

impl SessionFlow {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::ActionFailed { .. } => "session.action_failed",
            Self::ActionFiltered { .. } => "session.action_filtered",
            Self::CorrelationMiss { .. } => "session.correlation_miss",
            Self::ExecutionExpired { .. } => "session.execution_expired",
            Self::PersistFailed { .. } => "session.persist_failed",
            Self::ClientDropped { .. } => "session.client_dropped",
            Self::Renamed { .. } => "session.renamed",
        }
    }

    /// The notebook path this event concerns (the new path for renames).
    pub fn notebook_path(&self) -> &str {
        match self {
            Self::ActionFailed { notebook_path, .. }
            | Self::ActionFiltered { notebook_path, .. }
            | Self::CorrelationMiss { notebook_path, .. }
            | Self::ExecutionExpired { notebook_path, .. }
            | Self::PersistFailed { notebook_path, .. }
            | Self::ClientDropped { notebook_path, .. } => notebook_path,
            Self::Renamed { to, .. } => to,
        }
    }
}

impl HasSubject for SessionFlow {
    fn subject(&self) -> &str {
        SessionFlow::subject(self)
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Type-parameterized pub/sub bus for a specific flow domain.
///
/// Uses a broadcast channel internally for multi-subscriber delivery.
/// Publishing never blocks; with no subscribers the message is discarded.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload to the bus.
    ///
    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, payload: T) -> usize {
        let msg = FlowMessage::new(payload);
        self.tx.send(msg).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

/// Shared session flow bus.
pub type SharedSessionFlowBus = Arc<FlowBus<SessionFlow>>;

pub fn shared_session_flow_bus(capacity: usize) -> SharedSessionFlowBus {
    Arc::new(FlowBus::new(capacity))
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// Returns None if the channel is closed.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Try to receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Log every session flow event until the bus closes.
///
/// Spawned once by the server so soft failures surface in the log.
pub async fn log_session_flows(mut sub: Subscription<SessionFlow>) {
    while let Some(msg) = sub.recv().await {
        match &msg.payload {
            SessionFlow::PersistFailed { notebook_path, error } => {
                tracing::error!(path = %notebook_path, %error, "notebook write failed");
            }
            SessionFlow::ExecutionExpired {
                notebook_path,
                request_id,
                cell,
            } => {
                tracing::warn!(path = %notebook_path, request = %request_id.short(), %cell, "execution expired");
            }
            other => {
                tracing::info!(subject = %msg.subject, path = %other.notebook_path(), "{other:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("session.renamed", "session.renamed"));
        assert!(!matches_pattern("session.renamed", "session.persist_failed"));
        assert!(!matches_pattern("session.renamed", "session.renamed.extra"));
    }

    #[test]
    fn test_pattern_matching_wildcards() {
        assert!(matches_pattern("session.*", "session.persist_failed"));
        assert!(!matches_pattern("session.*", "session.kernel.dead"));
        assert!(matches_pattern("session.>", "session.kernel.dead"));
        assert!(!matches_pattern("session.>", "session"));
        assert!(matches_pattern("*.renamed", "session.renamed"));
        assert!(!matches_pattern("session.*", "block.inserted"));
    }

    #[test]
    fn test_session_flow_subjects() {
        let flow = SessionFlow::PersistFailed {
            notebook_path: "a.json".into(),
            error: "disk full".into(),
        };
        assert_eq!(flow.subject(), "session.persist_failed");
        assert_eq!(flow.notebook_path(), "a.json");

        let flow = SessionFlow::Renamed {
            from: "a.json".into(),
            to: "b.json".into(),
        };
        assert_eq!(flow.subject(), "session.renamed");
        assert_eq!(flow.notebook_path(), "b.json");
    }

    #[tokio::test]
    async fn test_flow_bus_publish_subscribe() {
        let bus: FlowBus<SessionFlow> = FlowBus::new(16);
        let mut sub = bus.subscribe("session.*");

        let bus_clone = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus_clone.publish(SessionFlow::CorrelationMiss {
                notebook_path: "a.json".into(),
                request_id: "r1".into(),
                event: "executeReply".into(),
            });
        });

        let msg = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout")
            .expect("no message");
        assert_eq!(msg.subject, "session.correlation_miss");
    }

    #[test]
    fn test_subscription_pattern_filtering() {
        let bus = shared_session_flow_bus(16);
        let mut persist = bus.subscribe("session.persist_failed");
        let mut renamed = bus.subscribe("session.renamed");
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SessionFlow::PersistFailed {
            notebook_path: "a.json".into(),
            error: "x".into(),
        });
        bus.publish(SessionFlow::Renamed {
            from: "a.json".into(),
            to: "b.json".into(),
        });

        assert_eq!(persist.try_recv().unwrap().subject, "session.persist_failed");
        assert!(persist.try_recv().is_none());
        assert_eq!(renamed.try_recv().unwrap().subject, "session.renamed");
        assert!(renamed.try_recv().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: FlowBus<SessionFlow> = FlowBus::new(4);
        let delivered = bus.publish(SessionFlow::Renamed {
            from: "a".into(),
            to: "b".into(),
        });
        assert_eq!(delivered, 0);
    }
}
