//! Downstream publication of committed transition events.
//!
//! # Guarantees
//!
//! - **Best-effort**: publication failures are logged by the coordinator,
//!   never propagated to the firing caller. The log is the authority;
//!   streams are a convenience.
//! - **At-most-once** for the in-process implementation: slow subscribers
//!   lag and lose events. Consumers needing every event should read the
//!   log instead.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::event::TransitionEvent;

/// Default broadcast capacity before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Publishes committed transition events to a named stream.
///
/// The `namespace` groups related streams (configured per coordinator,
/// default `"StateMachine"`); the `key` is the actor id.
#[async_trait]
pub trait StreamPublisher: Send + Sync + 'static {
    /// Publish one committed event.
    async fn publish(
        &self,
        namespace: &str,
        key: &str,
        event: &TransitionEvent,
    ) -> anyhow::Result<()>;
}

/// A published event with its addressing.
#[derive(Debug, Clone)]
pub struct StreamEnvelope {
    /// Stream namespace.
    pub namespace: String,
    /// Stream key (the actor id).
    pub key: String,
    /// The committed event.
    pub event: TransitionEvent,
}

/// In-process publisher backed by a tokio broadcast channel.
///
/// # Example
///
/// ```ignore
/// let publisher = BroadcastPublisher::new();
/// let mut feed = publisher.subscribe();
/// // ... wire the publisher into a coordinator, fire transitions ...
/// let envelope = feed.recv().await?;
/// println!("{} moved to {}", envelope.key, envelope.event.to_state);
/// ```
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<StreamEnvelope>,
}

impl BroadcastPublisher {
    /// Publisher with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Publisher with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to every subsequently published event.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEnvelope> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamPublisher for BroadcastPublisher {
    async fn publish(
        &self,
        namespace: &str,
        key: &str,
        event: &TransitionEvent,
    ) -> anyhow::Result<()> {
        let envelope = StreamEnvelope {
            namespace: namespace.to_string(),
            key: key.to_string(),
            event: event.clone(),
        };
        // No subscribers is not a failure; the stream is best-effort.
        let _ = self.sender.send(envelope);
        Ok(())
    }
}
