//! Request correlation: routes asynchronous kernel events back to cells.
//!
//! Every dispatched execution gets a fresh [`RequestId`] mapped to the
//! [`CellRef`] that issued it. Entries live in one of two phases:
//!
//! ```text
//! insert ──▶ in-flight (deadline = now + execution_timeout)
//!              │ complete()                     │ deadline passes
//!              ▼                                ▼
//!            completed (deadline = now + grace) expire() reports it
//!              │ deadline passes
//!              ▼
//!            dropped silently
//! ```
//!
//! The grace period keeps output that trails the reply routable. The table
//! is bounded; inserting into a full table evicts the oldest entry.

use std::time::Duration;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;

use quire_types::{CellRef, RequestId};

use crate::constants::{
    DEFAULT_CORRELATION_CAPACITY, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_REPLY_GRACE,
};

/// Errors from correlation table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// The request id is already mapped. Ids must be fresh per dispatch.
    #[error("request id already in use: {0}")]
    Duplicate(RequestId),
}

/// Sizing and deadlines for a correlation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Maximum entries held at once.
    pub capacity: usize,
    /// How long an execution may run before it is abandoned.
    pub execution_timeout: Duration,
    /// How long a completed mapping is kept for trailing output.
    pub reply_grace: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CORRELATION_CAPACITY,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            reply_grace: DEFAULT_REPLY_GRACE,
        }
    }
}

/// An entry removed by deadline expiry or capacity eviction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expired {
    pub request: RequestId,
    pub cell: CellRef,
    /// True if no reply had been seen for this request.
    pub in_flight: bool,
}

#[derive(Clone, Debug)]
struct Entry {
    cell: CellRef,
    deadline: Instant,
    completed: bool,
}

/// Bounded map from request id to the cell that issued it.
#[derive(Debug)]
pub struct CorrelationTable {
    // Insertion order doubles as age order for eviction.
    entries: IndexMap<RequestId, Entry>,
    config: CorrelationConfig,
}

impl CorrelationTable {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Record a freshly dispatched request.
    ///
    /// If the table is full the oldest entry is evicted and returned.
    pub fn insert(
        &mut self,
        request: RequestId,
        cell: CellRef,
        now: Instant,
    ) -> Result<Option<Expired>, CorrelationError> {
        if self.entries.contains_key(&request) {
            return Err(CorrelationError::Duplicate(request));
        }

        let evicted = if self.config.capacity > 0 && self.entries.len() >= self.config.capacity {
            self.entries.shift_remove_index(0).map(|(request, entry)| {
                tracing::warn!(
                    request = %request.short(),
                    cell = %entry.cell,
                    in_flight = !entry.completed,
                    "correlation table full, evicting oldest entry"
                );
                Expired {
                    request,
                    cell: entry.cell,
                    in_flight: !entry.completed,
                }
            })
        } else {
            None
        };

        self.entries.insert(
            request,
            Entry {
                cell,
                deadline: now + self.config.execution_timeout,
                completed: false,
            },
        );
        Ok(evicted)
    }

    /// Resolve a request id. Misses are normal (stray or late events).
    pub fn get(&self, request: &RequestId) -> Option<&CellRef> {
        self.entries.get(request).map(|e| &e.cell)
    }

    /// Mark a request as replied; the mapping survives for the grace period.
    ///
    /// Returns false if the id is unknown or was already replied to. A repeat
    /// reply leaves the grace deadline where the first one set it.
    pub fn complete(&mut self, request: &RequestId, now: Instant) -> bool {
        match self.entries.get_mut(request) {
            Some(entry) if entry.completed => false,
            Some(entry) => {
                entry.completed = true;
                entry.deadline = now + self.config.reply_grace;
                true
            }
            None => false,
        }
    }

    /// Remove a mapping outright, for requests whose cell no longer exists.
    pub fn remove(&mut self, request: &RequestId) -> Option<CellRef> {
        self.entries.shift_remove(request).map(|e| e.cell)
    }

    /// Drop every entry whose deadline has passed.
    ///
    /// Returns the in-flight ones so the caller can report them as abandoned;
    /// completed entries past their grace period vanish silently.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        self.entries.retain(|request, entry| {
            if entry.deadline > now {
                return true;
            }
            if !entry.completed {
                expired.push(Expired {
                    request: request.clone(),
                    cell: entry.cell.clone(),
                    in_flight: true,
                });
            }
            false
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.entries.values().filter(|e| !e.completed).count()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(id: &str) -> CellRef {
        CellRef::new(id.into(), "ws".into())
    }

    fn table(capacity: usize) -> CorrelationTable {
        CorrelationTable::new(CorrelationConfig {
            capacity,
            execution_timeout: Duration::from_secs(10),
            reply_grace: Duration::from_secs(2),
        })
    }

    #[test]
    fn test_insert_and_get() {
        let mut t = table(8);
        let now = Instant::now();
        t.insert("r1".into(), cell("a"), now).unwrap();
        assert_eq!(t.get(&"r1".into()), Some(&cell("a")));
        assert_eq!(t.get(&"nope".into()), None);
        assert_eq!(t.in_flight(), 1);
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut t = table(8);
        let now = Instant::now();
        t.insert("r1".into(), cell("a"), now).unwrap();
        let err = t.insert("r1".into(), cell("b"), now).unwrap_err();
        assert_eq!(err, CorrelationError::Duplicate("r1".into()));
        assert_eq!(t.get(&"r1".into()), Some(&cell("a")));
    }

    #[test]
    fn test_completed_entry_routes_during_grace() {
        let mut t = table(8);
        let now = Instant::now();
        t.insert("r1".into(), cell("a"), now).unwrap();
        assert!(t.complete(&"r1".into(), now));
        assert_eq!(t.in_flight(), 0);

        assert!(t.expire(now + Duration::from_secs(1)).is_empty());
        assert!(t.get(&"r1".into()).is_some());

        // Past grace: dropped without being reported.
        assert!(t.expire(now + Duration::from_secs(3)).is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn test_in_flight_entry_expires_at_deadline() {
        let mut t = table(8);
        let now = Instant::now();
        t.insert("r1".into(), cell("a"), now).unwrap();
        t.insert("r2".into(), cell("b"), now + Duration::from_secs(5)).unwrap();

        assert!(t.expire(now + Duration::from_secs(9)).is_empty());
        let expired = t.expire(now + Duration::from_secs(10));
        assert_eq!(
            expired,
            vec![Expired {
                request: "r1".into(),
                cell: cell("a"),
                in_flight: true,
            }]
        );
        assert_eq!(t.len(), 1);
        assert!(t.get(&"r2".into()).is_some());
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut t = table(2);
        let now = Instant::now();
        assert!(t.insert("r1".into(), cell("a"), now).unwrap().is_none());
        assert!(t.insert("r2".into(), cell("b"), now).unwrap().is_none());

        let evicted = t.insert("r3".into(), cell("c"), now).unwrap().unwrap();
        assert_eq!(evicted.request, "r1");
        assert!(evicted.in_flight);
        assert_eq!(t.len(), 2);
        assert!(t.get(&"r1".into()).is_none());
        assert!(t.get(&"r3".into()).is_some());
    }

    #[test]
    fn test_complete_unknown_and_remove() {
        let mut t = table(8);
        let now = Instant::now();
        assert!(!t.complete(&"ghost".into(), now));
        t.insert("r1".into(), cell("a"), now).unwrap();
        assert_eq!(t.remove(&"r1".into()), Some(cell("a")));
        assert!(t.is_empty());
    }

    #[test]
    fn test_second_complete_is_rejected() {
        let mut t = table(8);
        let start = Instant::now();
        t.insert("r1".into(), cell("a"), start).unwrap();
        assert!(t.complete(&"r1".into(), start));
        assert!(!t.complete(&"r1".into(), start + Duration::from_secs(1)));
        assert_eq!(t.in_flight(), 0);

        // The grace deadline still counts from the first reply.
        assert!(t.expire(start + Duration::from_millis(2500)).is_empty());
        assert!(t.is_empty());
    }
}
