//! Core vocabulary for the ratchet runtime.
//!
//! # Overview
//!
//! Ratchet separates **symbols** from **payloads**:
//! - [`State`] and [`Trigger`] are values from finite, enumerated domains.
//!   The event log stores their symbolic names, never discriminants.
//! - [`FireArgs`] carries the 0..3 typed parameters a trigger may bring
//!   along. Parameters are transport-level payload; they never appear in
//!   the persisted event beyond their dedupe fingerprint.
//!
//! # Correlation
//!
//! Fires can be tagged with a [`CorrelationId`] supplied by the caller.
//! Correlation is the only cross-actor ordering tool ratchet offers: the
//! log of one actor is totally ordered, logs of different actors are not.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

/// A state drawn from a finite, enumerated domain.
///
/// Implementors are almost always fieldless enums. The symbolic name is the
/// persistence format: `name` is written to the event log and `from_name`
/// is its replay-side inverse, so the pair must round-trip exactly
/// (case-sensitive).
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum DoorState { Open, Closed, Locked }
///
/// impl State for DoorState {
///     fn name(&self) -> &'static str {
///         match self {
///             DoorState::Open => "Open",
///             DoorState::Closed => "Closed",
///             DoorState::Locked => "Locked",
///         }
///     }
///
///     fn from_name(name: &str) -> Option<Self> {
///         match name {
///             "Open" => Some(DoorState::Open),
///             "Closed" => Some(DoorState::Closed),
///             "Locked" => Some(DoorState::Locked),
///             _ => None,
///         }
///     }
///
///     fn all() -> &'static [Self] {
///         &[DoorState::Open, DoorState::Closed, DoorState::Locked]
///     }
/// }
/// ```
pub trait State: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The declared symbolic name of this state.
    fn name(&self) -> &'static str;

    /// Parse a symbolic name back into a state value.
    ///
    /// Returns `None` for unknown names. Replay treats that as corruption,
    /// not as a default.
    fn from_name(name: &str) -> Option<Self>;

    /// Every value of the domain, for introspection and validation.
    fn all() -> &'static [Self];
}

/// A trigger drawn from a finite, enumerated domain.
///
/// Triggers attempt transitions. Like [`State`], the symbolic name is the
/// persistence format and `from_name` must be its exact inverse.
pub trait Trigger: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The declared symbolic name of this trigger.
    fn name(&self) -> &'static str;

    /// Parse a symbolic name back into a trigger value.
    fn from_name(name: &str) -> Option<Self>;
}

/// Maximum number of parameters a trigger may carry.
pub const MAX_TRIGGER_ARGS: usize = 3;

/// One type-erased trigger parameter.
///
/// The debug representation is captured at construction so the slot can be
/// fingerprinted for dedupe keys and quoted in guard-failure messages
/// without knowing the concrete type.
#[derive(Clone)]
struct ArgSlot {
    value: Arc<dyn Any + Send + Sync>,
    repr: String,
}

/// The 0..3 typed parameters carried by a fire.
///
/// Arguments are positional and type-erased; guards and entry callbacks
/// recover them with [`FireArgs::get`]. Construction captures a debug
/// representation per slot, which feeds the default dedupe key.
///
/// # Example
///
/// ```ignore
/// let args = FireArgs::one("s3cret");
/// let code: Option<&&str> = args.get(0);
/// ```
#[derive(Clone, Default)]
pub struct FireArgs {
    slots: SmallVec<[ArgSlot; MAX_TRIGGER_ARGS]>,
}

impl FireArgs {
    /// No parameters.
    pub fn none() -> Self {
        Self::default()
    }

    /// One parameter.
    pub fn one<A>(a: A) -> Self
    where
        A: fmt::Debug + Send + Sync + 'static,
    {
        let mut args = Self::default();
        args.push(a);
        args
    }

    /// Two parameters.
    pub fn two<A, B>(a: A, b: B) -> Self
    where
        A: fmt::Debug + Send + Sync + 'static,
        B: fmt::Debug + Send + Sync + 'static,
    {
        let mut args = Self::one(a);
        args.push(b);
        args
    }

    /// Three parameters.
    pub fn three<A, B, C>(a: A, b: B, c: C) -> Self
    where
        A: fmt::Debug + Send + Sync + 'static,
        B: fmt::Debug + Send + Sync + 'static,
        C: fmt::Debug + Send + Sync + 'static,
    {
        let mut args = Self::two(a, b);
        args.push(c);
        args
    }

    fn push<A>(&mut self, a: A)
    where
        A: fmt::Debug + Send + Sync + 'static,
    {
        debug_assert!(self.slots.len() < MAX_TRIGGER_ARGS);
        self.slots.push(ArgSlot {
            repr: format!("{a:?}"),
            value: Arc::new(a),
        });
    }

    /// Downcast the parameter at `index`.
    ///
    /// Returns `None` if the index is out of range or the type does not
    /// match what the caller supplied.
    pub fn get<V: 'static>(&self, index: usize) -> Option<&V> {
        self.slots.get(index)?.value.downcast_ref()
    }

    /// Number of parameters carried.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no parameters are carried.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The captured debug representation of the parameter at `index`.
    pub fn repr(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(|s| s.repr.as_str())
    }

    /// Stable 64-bit fingerprint of the argument values.
    ///
    /// FNV-1a over the captured representations. Dedupe keys embed this
    /// value and are persisted in snapshots, so the hash must not depend
    /// on process-local randomization.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for slot in &self.slots {
            for byte in slot.repr.as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(PRIME);
            }
            // Slot separator so ["ab"] and ["a", "b"] differ.
            hash ^= 0x1f;
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }
}

impl fmt::Debug for FireArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for slot in &self.slots {
            list.entry(&slot.repr);
        }
        list.finish()
    }
}

/// Caller-supplied identifier tracking related fires across actors.
///
/// Stored verbatim on every event appended while it is set. Use
/// [`CorrelationId::generate`] for a fresh random id or wrap an existing
/// request id with `CorrelationId::from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one actor instance.
///
/// Opaque to ratchet; the hosting framework decides its shape. Each actor
/// id owns exactly one event log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
