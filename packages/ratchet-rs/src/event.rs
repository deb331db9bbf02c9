//! Persisted event and snapshot layouts.
//!
//! # Wire compatibility
//!
//! These layouts are the durable contract of the runtime. A
//! [`TransitionEvent`] on the wire is an object with the exact field names
//! `FromState, ToState, Trigger, Timestamp, CorrelationId, DedupeKey,
//! StateMachineVersion, Metadata`; snapshots use camelCase. States and
//! triggers serialize as their declared symbolic names, case-sensitive.
//! Timestamps are UTC RFC 3339 with nanosecond resolution.
//!
//! Schema evolution happens through the upcast registry
//! ([`crate::upcast`]), never by editing rows in place: old events stay
//! as written and are transformed during replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CorrelationId, State, Trigger};

/// Metadata key listing the source state's ancestor chain (leaf to root).
pub const META_ANCESTORS_OF_SOURCE: &str = "ancestorsOfSource";
/// Metadata key listing the destination state's ancestor chain.
pub const META_ANCESTORS_OF_DESTINATION: &str = "ancestorsOfDestination";
/// Metadata key counting ancestors shared by source and destination.
pub const META_SHARED_ANCESTOR_COUNT: &str = "sharedAncestorCount";
/// Metadata key naming the orthogonal region a transition occurred in.
pub const META_REGION: &str = "region";
/// Metadata key naming the timer that synthesized a fire.
pub const META_TIMER: &str = "timer";

/// Record of one completed transition, immutable once appended.
///
/// The invariant behind the whole runtime: `to_state` is exactly what the
/// engine produced deterministically from `from_state` under `trigger`
/// with guard evaluation at event time. Replay therefore applies
/// `current := to_state` without re-running any logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Symbolic name of the source state.
    #[serde(rename = "FromState")]
    pub from_state: String,

    /// Symbolic name of the destination state.
    #[serde(rename = "ToState")]
    pub to_state: String,

    /// Symbolic name of the trigger that caused the transition.
    #[serde(rename = "Trigger")]
    pub trigger: String,

    /// UTC instant the transition completed, monotonic within one log.
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Caller-supplied correlation identifier, if one was set.
    #[serde(rename = "CorrelationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// The dedupe key this fire was admitted under.
    #[serde(rename = "DedupeKey", default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,

    /// Schema version of the machine that wrote the event.
    #[serde(rename = "StateMachineVersion", default, skip_serializing_if = "Option::is_none")]
    pub state_machine_version: Option<String>,

    /// Opaque key-value annotations (ancestor chains, region, timer name).
    #[serde(rename = "Metadata", default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl TransitionEvent {
    /// Start an event record for a completed engine transition.
    pub fn record<S: State, T: Trigger>(
        from: S,
        to: S,
        trigger: T,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            from_state: from.name().to_string(),
            to_state: to.name().to_string(),
            trigger: trigger.name().to_string(),
            timestamp,
            correlation_id: None,
            dedupe_key: None,
            state_machine_version: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, cid: Option<CorrelationId>) -> Self {
        self.correlation_id = cid;
        self
    }

    /// Attach the admitting dedupe key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Attach the writer's schema version.
    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.state_machine_version = version;
        self
    }

    /// Insert one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parse the destination state back into the domain.
    pub fn to_state_parsed<S: State>(&self) -> Option<S> {
        S::from_name(&self.to_state)
    }

    /// Parse the source state back into the domain.
    pub fn from_state_parsed<S: State>(&self) -> Option<S> {
        S::from_name(&self.from_state)
    }

    /// Parse the trigger back into the domain.
    pub fn trigger_parsed<T: Trigger>(&self) -> Option<T> {
        T::from_name(&self.trigger)
    }

    /// The region this transition occurred in, for container actors.
    pub fn region(&self) -> Option<&str> {
        self.metadata.get(META_REGION).and_then(Value::as_str)
    }
}

/// Periodic compact summary used to accelerate replay.
///
/// Applying a snapshot and then the events past its index must be
/// indistinguishable from replaying the full log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Layout version of the snapshot record itself.
    pub version: u32,

    /// Symbolic name of the state at snapshot time.
    pub current_state: String,

    /// Number of transitions applied up to and including the snapshot.
    pub transition_count: u64,

    /// Recently observed dedupe keys, oldest first, bounded by the
    /// configured cache capacity.
    pub dedupe_keys: Vec<String>,

    /// Correlation id in effect at snapshot time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// Schema version of the machine that wrote the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,

    /// Domain-specific payload supplied by the machine definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_payload: Option<Value>,
}

/// Current snapshot record layout version.
pub const SNAPSHOT_LAYOUT_VERSION: u32 = 1;

impl SnapshotRecord {
    /// Build a snapshot for the given state.
    pub fn new<S: State>(current: S, transition_count: u64) -> Self {
        Self {
            version: SNAPSHOT_LAYOUT_VERSION,
            current_state: current.name().to_string(),
            transition_count,
            dedupe_keys: Vec::new(),
            correlation_id: None,
            schema_version: None,
            domain_payload: None,
        }
    }

    /// Parse the snapshot state back into the domain.
    pub fn current_state_parsed<S: State>(&self) -> Option<S> {
        S::from_name(&self.current_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Open,
        Closed,
    }

    impl State for Door {
        fn name(&self) -> &'static str {
            match self {
                Door::Open => "Open",
                Door::Closed => "Closed",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "Open" => Some(Door::Open),
                "Closed" => Some(Door::Closed),
                _ => None,
            }
        }

        fn all() -> &'static [Self] {
            &[Door::Open, Door::Closed]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum DoorTrigger {
        Open,
    }

    impl Trigger for DoorTrigger {
        fn name(&self) -> &'static str {
            "Open"
        }

        fn from_name(name: &str) -> Option<Self> {
            (name == "Open").then_some(DoorTrigger::Open)
        }
    }

    fn sample_event() -> TransitionEvent {
        TransitionEvent::record(
            Door::Closed,
            Door::Open,
            DoorTrigger::Open,
            DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap(),
        )
    }

    #[test]
    fn test_event_wire_field_names_are_exact() {
        let event = sample_event()
            .with_correlation(Some(CorrelationId::from("req-1")))
            .with_dedupe_key("door-1:Open:0")
            .with_version(Some("v2".into()));

        let json = serde_json::to_value(&event).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "FromState",
            "ToState",
            "Trigger",
            "Timestamp",
            "CorrelationId",
            "DedupeKey",
            "StateMachineVersion",
        ] {
            assert!(obj.contains_key(key), "missing wire field {key}");
        }
        assert_eq!(obj["FromState"], "Closed");
        assert_eq!(obj["ToState"], "Open");
    }

    #[test]
    fn test_event_timestamp_keeps_nanoseconds() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("123456789"), "nanoseconds lost: {json}");
    }

    #[test]
    fn test_event_optional_fields_are_omitted() {
        let json = serde_json::to_value(&sample_event()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("CorrelationId"));
        assert!(!obj.contains_key("DedupeKey"));
        assert!(!obj.contains_key("StateMachineVersion"));
        assert!(!obj.contains_key("Metadata"));
    }

    #[test]
    fn test_event_round_trips() {
        let event = sample_event()
            .with_dedupe_key("k")
            .with_metadata(META_SHARED_ANCESTOR_COUNT, Value::from(2));
        let json = serde_json::to_string(&event).unwrap();
        let back: TransitionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_symbolic_parsing() {
        let event = sample_event();
        assert_eq!(event.to_state_parsed::<Door>(), Some(Door::Open));
        assert_eq!(event.from_state_parsed::<Door>(), Some(Door::Closed));
        assert_eq!(event.trigger_parsed::<DoorTrigger>(), Some(DoorTrigger::Open));
    }

    #[test]
    fn test_event_region_metadata() {
        let event = sample_event().with_metadata(META_REGION, Value::from("Climate"));
        assert_eq!(event.region(), Some("Climate"));
        assert_eq!(sample_event().region(), None);
    }

    #[test]
    fn test_snapshot_wire_layout_is_camel_case() {
        let mut snapshot = SnapshotRecord::new(Door::Open, 42);
        snapshot.dedupe_keys = vec!["a".into(), "b".into()];
        snapshot.schema_version = Some("v3".into());

        let json = serde_json::to_value(&snapshot).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["version", "currentState", "transitionCount", "dedupeKeys", "schemaVersion"] {
            assert!(obj.contains_key(key), "missing snapshot field {key}");
        }
        assert_eq!(obj["currentState"], "Open");
        assert_eq!(obj["transitionCount"], 42);
        assert!(!obj.contains_key("correlationId"));
        assert!(!obj.contains_key("domainPayload"));
    }

    #[test]
    fn test_snapshot_round_trips() {
        let mut snapshot = SnapshotRecord::new(Door::Closed, 7);
        snapshot.domain_payload = Some(serde_json::json!({"unlockAttempts": 3}));
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SnapshotRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.current_state_parsed::<Door>(), Some(Door::Closed));
    }
}
