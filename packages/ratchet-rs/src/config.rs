//! Coordinator configuration surface.
//!
//! Options deserialize from whatever structured source the host supplies
//! (TOML, JSON, environment layering); every field has the documented
//! default so partial configs are valid.

use std::time::Duration;

use serde::Deserialize;

use crate::dedupe::DEFAULT_DEDUPE_CAPACITY;

/// Default stream namespace for published transition events.
pub const DEFAULT_STREAM_NAMESPACE: &str = "StateMachine";

/// Default snapshot interval, in transitions.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// Default bound on region reaction cascades.
pub const DEFAULT_CASCADE_LIMIT: usize = 16;

/// Base delay for append retry backoff.
pub const APPEND_RETRY_BASE: Duration = Duration::from_millis(50);

/// Maximum append attempts before surfacing `PersistenceFailed`.
pub const APPEND_RETRY_ATTEMPTS: u32 = 5;

/// Per-coordinator options.
///
/// # Example (TOML)
///
/// ```toml
/// auto_confirm_events = false
/// publish_to_stream = true
/// stream_namespace = "Doors"
/// snapshot_interval = 50
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorOptions {
    /// Skip awaiting storage confirmation after append. When set, append
    /// failures surface asynchronously and the actor continues; when
    /// clear, a failed append rolls the engine back via replay.
    pub auto_confirm_events: bool,

    /// Publish committed events to the configured stream.
    pub publish_to_stream: bool,

    /// Name of the stream provider collaborator, informational.
    pub stream_provider: Option<String>,

    /// Namespace published events are grouped under.
    pub stream_namespace: String,

    /// Suppress fires whose dedupe key was recently observed.
    pub enable_idempotency: bool,

    /// Bound of the in-memory dedupe cache.
    pub max_dedupe_keys_in_memory: usize,

    /// Write periodic snapshots.
    pub enable_snapshots: bool,

    /// Transitions between snapshots.
    pub snapshot_interval: u64,

    /// Schema version stamped on appended events.
    pub schema_version: Option<String>,

    /// Fail replay when an event's version has no upcast path to the
    /// current schema. When clear, mismatched events are applied as-is.
    pub strict_replay: bool,

    /// Bound on region reaction cascades.
    pub cascade_limit: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            auto_confirm_events: true,
            publish_to_stream: false,
            stream_provider: None,
            stream_namespace: DEFAULT_STREAM_NAMESPACE.to_string(),
            enable_idempotency: true,
            max_dedupe_keys_in_memory: DEFAULT_DEDUPE_CAPACITY,
            enable_snapshots: true,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            schema_version: None,
            strict_replay: false,
            cascade_limit: DEFAULT_CASCADE_LIMIT,
        }
    }
}
