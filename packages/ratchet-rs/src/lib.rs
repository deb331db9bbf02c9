//! # Ratchet
//!
//! An actor-hosted hierarchical state-machine runtime where transitions
//! are facts, the log is the authority, and replay rebuilds the world.
//!
//! ## Core Concepts
//!
//! Ratchet separates **deciding** from **remembering**:
//! - The [`StateMachine`] decides: triggers, guards, hierarchy, entry and
//!   exit callbacks. Pure, synchronous, no I/O.
//! - The [`Coordinator`] remembers: every accepted fire becomes an
//!   immutable [`TransitionEvent`] appended to the actor's log before the
//!   caller's fire completes.
//!
//! The key principle: **in-memory state is a cache of the log**. An actor
//! can be deactivated at any moment; reactivation replays the log (via
//! the latest [`SnapshotRecord`]) and lands in exactly the state the
//! events describe.
//!
//! ## Architecture
//!
//! ```text
//! caller ──fire()──► ActorHandle ──mailbox──► actor task (single writer)
//!                                                  │
//!                        ┌─────────────────────────┤
//!                        ▼                         ▼
//!                  Coordinator               TimerRuntime
//!                   1 callback guard          (expiries re-enter
//!                   2 dedupe                   the mailbox)
//!                   3 StateMachine.fire()
//!                   4 build TransitionEvent
//!                   5 EventStore.append()
//!                   6 snapshot every N
//!                   7 StreamPublisher (best-effort)
//!                   8 cancel/arm timers
//!                   9 dedupe insert
//!
//! activation: EventStore.load() ─► snapshot ─► events ─► UpcastRegistry
//!             ─► StateMachine (no callbacks) ─► timer rehydrate
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Events are deterministic facts**: `to_state` is what the engine
//!    produced; replay applies it without re-deciding.
//! 2. **One actor, one writer**: all operations of an actor run on its
//!    mailbox task; no locks, no interleaving.
//! 3. **Append before acknowledge**: a fire completes only after its
//!    event is in the log (auto-confirm mode trades this for latency).
//! 4. **Callbacks are synchronous**: firing from inside one is rejected,
//!    not deadlocked.
//! 5. **Streams are best-effort**: subscribers may lag; the log never
//!    lies.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ratchet::{ActorRuntime, FireArgs, MachineDef, StateMachine};
//!
//! struct DoorDef;
//!
//! impl MachineDef for DoorDef {
//!     type State = DoorState;
//!     type Trigger = DoorTrigger;
//!
//!     fn initial_state(&self) -> DoorState {
//!         DoorState::Closed
//!     }
//!
//!     fn build(&self, machine: &mut StateMachine<DoorState, DoorTrigger>) {
//!         machine.configure(DoorState::Closed)
//!             .permit(DoorTrigger::Open, DoorState::Open)
//!             .permit_if1::<String>(DoorTrigger::Lock, DoorState::Locked,
//!                 "code is non-empty", |code| !code.is_empty());
//!         machine.configure(DoorState::Open)
//!             .permit(DoorTrigger::Close, DoorState::Closed);
//!     }
//! }
//!
//! let runtime = ActorRuntime::builder(store).build();
//! let door = runtime.actor("door-1", Arc::new(DoorDef)).await?;
//! door.fire(DoorTrigger::Open).await?;
//! door.fire_with(DoorTrigger::Lock, FireArgs::one("s3cret".to_string())).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Ratchet is **not**:
//! - A distributed consensus system (each actor owns only its log)
//! - A cross-actor transaction engine (correlate, don't coordinate)
//! - A visual workflow designer
//!
//! Ratchet **is**:
//! > A state-machine runtime where every transition is an appended fact,
//! > idempotent under retries, rebuilt by replay, evolved by upcasts.

// Core modules
mod actor;
mod clock;
mod config;
mod coordinator;
mod core;
mod dedupe;
mod error;
mod event;
mod hierarchy;
mod machine;
mod region;
mod store;
mod stream;
mod timer;
mod upcast;

// Test doubles (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the symbol vocabulary
pub use crate::core::{ActorId, CorrelationId, FireArgs, State, Trigger, MAX_TRIGGER_ARGS};

// Re-export error types
pub use crate::error::{ConfigurationError, RatchetError};

// Re-export the engine
pub use crate::machine::{
    EngineFire, HierarchyEdge, MachineInfo, ReentrancyFlag, StateConfigurer, StateMachine,
    Transition, TransitionInfo, TriggerDetail,
};
pub use crate::hierarchy::Hierarchy;

// Re-export persistence types
pub use crate::event::{SnapshotRecord, TransitionEvent, SNAPSHOT_LAYOUT_VERSION};
pub use crate::store::{ActorLog, EventStore, LogIndex, StoreError, StoredEvent};
#[cfg(any(test, feature = "testing"))]
pub use crate::store::testing::InMemoryEventStore;

// Re-export the coordinator
pub use crate::config::CoordinatorOptions;
pub use crate::coordinator::{
    Activation, CancelToken, Coordinator, CoordinatorBuilder, FireOptions, FireOutcome,
};

// Re-export timers
pub use crate::timer::{
    ReminderRequest, ReminderStore, TimeoutConfig, TimeoutMode, TimeoutRepeat, TimerFire,
};

// Re-export schema evolution
pub use crate::upcast::{
    split_versioned, EventUpcast, MigrationContext, Upcast, UpcastFailure, UpcastRegistry,
};

// Re-export streams
pub use crate::stream::{BroadcastPublisher, StreamEnvelope, StreamPublisher};

// Re-export regions
pub use crate::region::{
    RegionChange, RegionFireReport, RegionReaction, RegionSet, StateSummary,
};

// Re-export the host
pub use crate::actor::{
    ActorHandle, ActorRuntime, ActorRuntimeBuilder, ContainerFireReport, ContainerHandle,
    MachineDef, RegionDef,
};

// Re-export the clock seam
pub use crate::clock::{Clock, MonotonicStamper, SystemClock};

// Re-export commonly used external types
pub use async_trait::async_trait;
