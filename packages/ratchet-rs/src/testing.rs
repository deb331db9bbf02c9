//! Test doubles for storage, streams, and time.
//!
//! Available in this crate's tests and to downstream crates through the
//! `testing` feature. The in-memory event store lives in
//! [`crate::store::testing`] next to the trait it implements.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::core::ActorId;
use crate::event::{SnapshotRecord, TransitionEvent};
use crate::store::{ActorLog, EventStore, LogIndex, StoreError, StoredEvent};
use crate::stream::StreamPublisher;

/// A store that fails its first `failures` appends with a transient
/// backend error, then delegates to an inner store.
///
/// Exercises the coordinator's retry and rollback paths.
pub struct FlakyStore<Inner> {
    inner: Inner,
    remaining_failures: AtomicU32,
}

impl<Inner> FlakyStore<Inner> {
    /// Fail the next `failures` appends, then behave normally.
    pub fn failing(inner: Inner, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
        }
    }

    /// Appends still destined to fail.
    pub fn failures_left(&self) -> u32 {
        self.remaining_failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<Inner: EventStore> EventStore for FlakyStore<Inner> {
    async fn load(&self, actor: &ActorId) -> Result<ActorLog, StoreError> {
        self.inner.load(actor).await
    }

    async fn append(
        &self,
        actor: &ActorId,
        event: &TransitionEvent,
        expected: LogIndex,
    ) -> Result<LogIndex, StoreError> {
        if self.should_fail() {
            return Err(StoreError::Backend(anyhow::anyhow!("injected append failure")));
        }
        self.inner.append(actor, event, expected).await
    }

    async fn read(
        &self,
        actor: &ActorId,
        from: LogIndex,
        to: LogIndex,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.read(actor, from, to).await
    }

    async fn write_snapshot(
        &self,
        actor: &ActorId,
        snapshot: &SnapshotRecord,
        at: LogIndex,
    ) -> Result<(), StoreError> {
        self.inner.write_snapshot(actor, snapshot, at).await
    }
}

/// Publisher that records every envelope for assertions.
#[derive(Default)]
pub struct CapturePublisher {
    published: Mutex<Vec<(String, String, TransitionEvent)>>,
}

impl CapturePublisher {
    /// Fresh, empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, as `(namespace, key, event)`.
    pub fn published(&self) -> Vec<(String, String, TransitionEvent)> {
        self.published.lock().unwrap().clone()
    }

    /// Number of publications.
    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl StreamPublisher for CapturePublisher {
    async fn publish(
        &self,
        namespace: &str,
        key: &str,
        event: &TransitionEvent,
    ) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((namespace.to_string(), key.to_string(), event.clone()));
        Ok(())
    }
}

/// A clock the test advances (or rewinds) by hand.
///
/// Rewinding exercises the monotonic clamp on event timestamps.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock starting at `start`.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Move backward, like a step from NTP.
    pub fn rewind(&self, by: Duration) {
        *self.now.lock().unwrap() -= by;
    }

    /// Set an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
