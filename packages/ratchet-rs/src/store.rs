//! Storage contract for event logs and snapshots.
//!
//! # The Contract
//!
//! 1. **One actor, one log.** Every [`ActorId`] owns an append-only,
//!    strictly monotonic sequence of transition events.
//!
//! 2. **Append before acknowledge.** The coordinator persists the event
//!    before the caller's fire completes (or, in auto-confirm mode,
//!    observes the result asynchronously). Either way the log is the
//!    authority; in-memory state is a cache of it.
//!
//! 3. **Expected-index appends.** Each append names the index the writer
//!    believes is the tail. A mismatch means something else wrote the log
//!    - a violation of the single-writer discipline - and is reported as
//!    [`StoreError::Conflict`], never retried.
//!
//! # What This Does NOT Guarantee
//!
//! - No pruning policy. Whether events before a snapshot are kept is the
//!   provider's business; `load` may return only the tail.
//! - No cross-actor ordering. Use correlation ids.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::ActorId;
use crate::event::{SnapshotRecord, TransitionEvent};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the storage provider.
///
/// The distinction matters for correct behavior:
/// - [`StoreError::Conflict`] means the expected tail index didn't match:
///   another writer touched the log. Retrying would compound the damage.
/// - [`StoreError::Backend`] means storage itself failed (timeout,
///   connection, serialization). Transient; the coordinator retries with
///   backoff.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The log tail moved underneath us.
    #[error("log conflict: expected tail index did not match (single-writer violated)")]
    Conflict,

    /// Storage backend failure.
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// True for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

// =============================================================================
// Log Index
// =============================================================================

/// Position in an actor's event log.
///
/// Indexes are strictly monotonic starting at 1; [`LogIndex::NONE`] is the
/// tail of an empty log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// Tail of an empty log.
    pub const NONE: LogIndex = LogIndex(0);

    /// Wrap a raw index.
    pub fn new(value: u64) -> Self {
        LogIndex(value)
    }

    /// The index an append at this tail will produce.
    pub fn next(self) -> Self {
        LogIndex(self.0.saturating_add(1))
    }

    /// True for the empty-log sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "i{}", self.0)
        }
    }
}

// =============================================================================
// Stored Event
// =============================================================================

/// One event as the store returns it: raw JSON plus its index.
///
/// Events stay raw through the upcast registry and are decoded into
/// [`TransitionEvent`] only once they are at the current schema.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Position in the log.
    pub index: LogIndex,
    /// The event object as persisted.
    pub payload: serde_json::Value,
}

impl StoredEvent {
    /// Encode a transition event for appending.
    pub fn encode(index: LogIndex, event: &TransitionEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            index,
            payload: serde_json::to_value(event)?,
        })
    }

    /// Decode the payload at the current schema.
    pub fn decode(&self) -> Result<TransitionEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Everything `load` returns for one actor.
#[derive(Debug, Default)]
pub struct ActorLog {
    /// Latest snapshot and the log index it covers, if any.
    pub snapshot: Option<(SnapshotRecord, LogIndex)>,
    /// Events with index greater than the snapshot's, oldest first.
    pub events: Vec<StoredEvent>,
}

impl ActorLog {
    /// The tail index implied by this load.
    pub fn tail(&self) -> LogIndex {
        self.events
            .last()
            .map(|e| e.index)
            .or(self.snapshot.as_ref().map(|(_, at)| *at))
            .unwrap_or(LogIndex::NONE)
    }
}

// =============================================================================
// Event Store
// =============================================================================

/// Persists event logs and snapshots for actors.
///
/// Implementations must provide atomic expected-index appends. Everything
/// else (retention, sharding, encryption) is the provider's concern.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Load the latest snapshot and the events past it.
    async fn load(&self, actor: &ActorId) -> Result<ActorLog, StoreError>;

    /// Append one event at the expected tail.
    ///
    /// Returns the new tail index on success and
    /// [`StoreError::Conflict`] when `expected` is stale.
    async fn append(
        &self,
        actor: &ActorId,
        event: &TransitionEvent,
        expected: LogIndex,
    ) -> Result<LogIndex, StoreError>;

    /// Read events with `from.value() <= index.value() <= to.value()`,
    /// oldest first. Providers may omit pruned ranges.
    async fn read(
        &self,
        actor: &ActorId,
        from: LogIndex,
        to: LogIndex,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Record a snapshot covering the log up to `at`.
    async fn write_snapshot(
        &self,
        actor: &ActorId,
        snapshot: &SnapshotRecord,
        at: LogIndex,
    ) -> Result<(), StoreError>;
}

// =============================================================================
// In-Memory Store (for testing)
// =============================================================================

/// In-memory event store for tests and examples.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct LogState {
        events: Vec<StoredEvent>,
        snapshot: Option<(SnapshotRecord, LogIndex)>,
    }

    /// Store backed by a `HashMap`, shared via `Arc`.
    ///
    /// Keeps every event ever appended (no pruning), which lets tests
    /// assert on full histories across deactivate/reactivate cycles.
    #[derive(Debug, Default)]
    pub struct InMemoryEventStore {
        data: Mutex<HashMap<ActorId, LogState>>,
    }

    impl InMemoryEventStore {
        /// Fresh, empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Total number of events appended for `actor`.
        pub fn event_count(&self, actor: &ActorId) -> usize {
            self.data
                .lock()
                .unwrap()
                .get(actor)
                .map_or(0, |log| log.events.len())
        }

        /// Decode every event for `actor`, oldest first.
        pub fn decoded_events(&self, actor: &ActorId) -> Vec<TransitionEvent> {
            self.data
                .lock()
                .unwrap()
                .get(actor)
                .map_or_else(Vec::new, |log| {
                    log.events.iter().filter_map(|e| e.decode().ok()).collect()
                })
        }

        /// The latest snapshot written for `actor`.
        pub fn snapshot(&self, actor: &ActorId) -> Option<(SnapshotRecord, LogIndex)> {
            self.data
                .lock()
                .unwrap()
                .get(actor)
                .and_then(|log| log.snapshot.clone())
        }
    }

    #[async_trait]
    impl EventStore for InMemoryEventStore {
        async fn load(&self, actor: &ActorId) -> Result<ActorLog, StoreError> {
            let data = self.data.lock().unwrap();
            let Some(log) = data.get(actor) else {
                return Ok(ActorLog::default());
            };
            let floor = log.snapshot.as_ref().map_or(LogIndex::NONE, |(_, at)| *at);
            Ok(ActorLog {
                snapshot: log.snapshot.clone(),
                events: log
                    .events
                    .iter()
                    .filter(|e| e.index > floor)
                    .cloned()
                    .collect(),
            })
        }

        async fn append(
            &self,
            actor: &ActorId,
            event: &TransitionEvent,
            expected: LogIndex,
        ) -> Result<LogIndex, StoreError> {
            let mut data = self.data.lock().unwrap();
            let log = data.entry(actor.clone()).or_default();
            let tail = log.events.last().map_or(LogIndex::NONE, |e| e.index);
            if tail != expected {
                return Err(StoreError::Conflict);
            }
            let index = tail.next();
            let stored = StoredEvent::encode(index, event).map_err(anyhow::Error::from)?;
            log.events.push(stored);
            Ok(index)
        }

        async fn read(
            &self,
            actor: &ActorId,
            from: LogIndex,
            to: LogIndex,
        ) -> Result<Vec<StoredEvent>, StoreError> {
            let data = self.data.lock().unwrap();
            Ok(data.get(actor).map_or_else(Vec::new, |log| {
                log.events
                    .iter()
                    .filter(|e| e.index >= from && e.index <= to)
                    .cloned()
                    .collect()
            }))
        }

        async fn write_snapshot(
            &self,
            actor: &ActorId,
            snapshot: &SnapshotRecord,
            at: LogIndex,
        ) -> Result<(), StoreError> {
            let mut data = self.data.lock().unwrap();
            let log = data.entry(actor.clone()).or_default();
            log.snapshot = Some((snapshot.clone(), at));
            Ok(())
        }
    }
}
