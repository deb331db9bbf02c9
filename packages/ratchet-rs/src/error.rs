//! Structured error types for the ratchet runtime.
//!
//! `RatchetError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. The split mirrors the runtime's layering:
//!
//! - [`ConfigurationError`] is raised while wiring a machine, before any
//!   fire is accepted. Activation fails fast.
//! - [`RatchetError`] covers everything a running actor can report.
//!
//! # The Error Boundary Rule
//!
//! > `anyhow::Error` stays inside storage backends.
//!
//! Backends wrap their failures in [`StoreError::Backend`]; everything the
//! caller of `fire` sees is one of the variants below. State and trigger
//! values appear in errors by their symbolic names so the error type stays
//! non-generic and loggable.
//!
//! [`StoreError::Backend`]: crate::store::StoreError::Backend

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while configuring a state machine.
///
/// All of these are programming errors in the machine definition; they are
/// detected at activation and fail the activation rather than surfacing on
/// a later fire.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A hierarchy edge would create a cycle.
    #[error("hierarchy cycle: making {child} a substate of {parent} closes a loop")]
    HierarchyCycle {
        /// The state being re-parented.
        child: String,
        /// The offending parent.
        parent: String,
    },

    /// A state already has a parent and a second one was declared.
    #[error("state {child} already has parent {existing}, cannot also be a substate of {parent}")]
    DuplicateParent {
        /// The state being re-parented.
        child: String,
        /// Its existing parent.
        existing: String,
        /// The rejected second parent.
        parent: String,
    },

    /// A trigger was mapped twice in the same state.
    #[error("state {state} already handles trigger {trigger}")]
    DuplicateTransition {
        /// The state carrying the duplicate.
        state: String,
        /// The trigger mapped twice.
        trigger: String,
    },

    /// A transition references a state the domain does not contain.
    #[error("unknown state {state} referenced by {referenced_by}")]
    UnknownState {
        /// The unknown symbolic name.
        state: String,
        /// Where the reference occurred.
        referenced_by: String,
    },

    /// A region name was registered twice in one container.
    #[error("region {region} is already registered")]
    DuplicateRegion {
        /// The duplicated region name.
        region: String,
    },

    /// A timeout config names a state the machine does not configure.
    #[error("timeout {name} is scoped to unconfigured state {state}")]
    TimeoutForUnknownState {
        /// The timeout's name.
        name: String,
        /// The unconfigured state.
        state: String,
    },
}

/// Errors reported by a running actor.
///
/// Each variant carries enough context to act on without string parsing.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// The trigger is not permitted in the current state.
    ///
    /// `unmet_guards` lists the descriptions of guards that evaluated
    /// false; empty when no transition is configured at all. No side
    /// effects occurred.
    #[error("trigger {trigger} not permitted in state {state} ({})",
            if .unmet_guards.is_empty() { "no transition configured".to_string() }
            else { format!("unmet guards: {}", .unmet_guards.join(", ")) })]
    InvalidTransition {
        /// Current state at the time of the fire.
        state: String,
        /// The rejected trigger.
        trigger: String,
        /// Descriptions of guards that evaluated false.
        unmet_guards: Vec<String>,
    },

    /// `fire` was invoked from inside an entry/exit callback.
    ///
    /// Callbacks execute synchronously within a turn; firing from one
    /// would interleave transitions. No state was mutated.
    #[error("fire({trigger}) called from inside a callback of state {state}")]
    CallbackReentrancy {
        /// State whose callback was executing.
        state: String,
        /// The trigger of the rejected nested fire.
        trigger: String,
    },

    /// The machine definition is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Replay could not reconstruct state from the log.
    ///
    /// The actor's activation fails; the host may retry or quarantine.
    #[error("replay failed at index {index} ({from_state} --{trigger}--> {to_state}): {reason}")]
    ReplayFailure {
        /// Log index of the offending event.
        index: u64,
        /// Symbolic source state recorded in the event.
        from_state: String,
        /// Symbolic destination state recorded in the event.
        to_state: String,
        /// Symbolic trigger recorded in the event.
        trigger: String,
        /// Event timestamp, RFC 3339, when one was readable.
        timestamp: Option<String>,
        /// Why the event could not be applied.
        reason: String,
    },

    /// Strict-mode upcast was required but no path exists.
    #[error("no upcast path from {from} to {to}")]
    NoUpcastPath {
        /// Source type name.
        from: String,
        /// Target type name.
        to: String,
    },

    /// Append or snapshot retries were exhausted.
    ///
    /// In strict mode the engine has been rolled back to the pre-fire
    /// state by replaying the persisted log.
    #[error("persistence failed after {attempts} attempts: {source}")]
    PersistenceFailed {
        /// How many attempts were made.
        attempts: u32,
        /// The final storage error.
        #[source]
        source: StoreError,
    },

    /// A region reaction cascade exceeded the depth bound.
    #[error("region cascade depth {depth} exceeds limit {limit}")]
    CascadeLimitExceeded {
        /// Depth reached when the cascade was cut off.
        depth: usize,
        /// The configured bound.
        limit: usize,
    },

    /// The whole fire exceeded its per-operation timeout.
    ///
    /// Only reported before the engine mutated; past that point the fire
    /// always completes.
    #[error("fire timed out after {timeout:?}")]
    Timeout {
        /// The configured per-operation timeout.
        timeout: Duration,
    },

    /// The caller cancelled before the engine mutated.
    #[error("fire cancelled before the transition was applied")]
    Cancelled,

    /// A region operation named a region the container does not have.
    #[error("unknown region {region}")]
    UnknownRegion {
        /// The unmatched region name.
        region: String,
    },

    /// The actor's mailbox is closed (deactivated or crashed).
    #[error("actor {actor_id} is unavailable")]
    ActorUnavailable {
        /// The unreachable actor.
        actor_id: String,
    },
}

impl RatchetError {
    /// True for errors that left no side effects behind.
    ///
    /// Retrying these fires is always safe.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            RatchetError::InvalidTransition { .. }
                | RatchetError::CallbackReentrancy { .. }
                | RatchetError::Timeout { .. }
                | RatchetError::Cancelled
        )
    }
}
