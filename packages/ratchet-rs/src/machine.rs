//! The pure hierarchical state-machine engine.
//!
//! Machines hold authoritative in-memory state and mechanically evaluate
//! triggers into transitions. No I/O, no async, no persistence - those
//! belong to the coordinator. The engine's contract:
//!
//! - **Resolution**: the current state and its ancestor chain are searched
//!   for a handler; the lowest descendant wins and shadows ancestors.
//! - **Ordering**: exit callbacks run leaf-first up to (not including) the
//!   lowest common ancestor with the destination, the state is updated,
//!   then entry callbacks run root-first down to the destination.
//! - **Purity**: guards must not read mutable engine state; callbacks run
//!   synchronously and must not fire re-entrantly (enforced by a flag
//!   spanning every callback invocation).
//!
//! Self-transitions re-run the destination's entry callbacks but not its
//! exit callbacks: the lowest common ancestor of a state and itself is the
//! state, which the exit path excludes and the entry path ends on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::core::{FireArgs, State, Trigger};
use crate::error::{ConfigurationError, RatchetError};
use crate::hierarchy::Hierarchy;

// =============================================================================
// Reentrancy Flag
// =============================================================================

/// Per-actor flag set across every callback invocation.
///
/// Any `fire` observing the flag set fails with `CallbackReentrancy`
/// before mutating anything. The flag is shared: an actor hosting several
/// engines (orthogonal regions) hands the same flag to each so a callback
/// in one region cannot synchronously fire another.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyFlag(Arc<AtomicBool>);

impl ReentrancyFlag {
    /// Fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a callback is executing.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> ReentrancyGuard<'_> {
        self.0.store(true, Ordering::Release);
        ReentrancyGuard { flag: &self.0 }
    }
}

/// Clears the flag when the callback scope unwinds or returns.
struct ReentrancyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// Transition
// =============================================================================

/// A resolved transition, handed to entry and exit callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, T> {
    /// State the machine left.
    pub source: S,
    /// State the machine entered.
    pub destination: S,
    /// Trigger that caused the transition.
    pub trigger: T,
}

impl<S: PartialEq, T> Transition<S, T> {
    /// True for transitions whose source and destination coincide.
    pub fn is_self_transition(&self) -> bool {
        self.source == self.destination
    }
}

/// What a successful engine fire did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFire<S, T> {
    /// A transition was performed.
    Transitioned(Transition<S, T>),
    /// The trigger is configured as ignored: accepted, no transition, no
    /// callbacks, and the coordinator appends no event.
    Ignored {
        /// State that ignored the trigger.
        state: S,
        /// The ignored trigger.
        trigger: T,
    },
}

impl<S, T> EngineFire<S, T> {
    /// The transition, when one occurred.
    pub fn transition(&self) -> Option<&Transition<S, T>> {
        match self {
            EngineFire::Transitioned(t) => Some(t),
            EngineFire::Ignored { .. } => None,
        }
    }
}

// =============================================================================
// Configuration storage
// =============================================================================

type Guard = Box<dyn Fn(&FireArgs) -> bool + Send + Sync>;
type Action<S, T> = Box<dyn FnMut(&Transition<S, T>, &FireArgs) + Send + Sync>;

struct GuardDef {
    description: String,
    predicate: Guard,
}

impl fmt::Debug for GuardDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardDef").field("description", &self.description).finish()
    }
}

struct TransitionDef<S> {
    destination: S,
    guards: Vec<GuardDef>,
}

struct StateNode<S, T> {
    transitions: HashMap<T, TransitionDef<S>>,
    ignored: HashSet<T>,
    entry: Vec<Action<S, T>>,
    entry_from: Vec<(T, Action<S, T>)>,
    exit: Vec<Action<S, T>>,
}

impl<S, T> Default for StateNode<S, T> {
    fn default() -> Self {
        Self {
            transitions: HashMap::new(),
            ignored: HashSet::new(),
            entry: Vec::new(),
            entry_from: Vec::new(),
            exit: Vec::new(),
        }
    }
}

// =============================================================================
// Introspection types
// =============================================================================

/// One configured transition, for dashboards and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionInfo {
    /// Symbolic source state.
    pub from: String,
    /// Symbolic trigger.
    pub trigger: String,
    /// Symbolic destination state.
    pub to: String,
    /// True when at least one guard gates the transition.
    pub guarded: bool,
}

/// One hierarchy edge, for dashboards and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyEdge {
    /// The substate.
    pub child: String,
    /// Its parent.
    pub parent: String,
}

/// Structural summary of a machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInfo {
    /// Symbolic current state.
    pub current_state: String,
    /// The full state domain.
    pub states: Vec<String>,
    /// Triggers that would currently succeed (no arguments supplied).
    pub permitted_triggers: Vec<String>,
    /// Every configured transition.
    pub transitions: Vec<TransitionInfo>,
    /// Every hierarchy edge.
    pub hierarchy: Vec<HierarchyEdge>,
}

/// Per-trigger detail for `detailed_permitted_triggers`.
#[derive(Debug, Clone)]
pub struct TriggerDetail<S, T> {
    /// The trigger under consideration.
    pub trigger: T,
    /// Destination, `None` for ignored triggers.
    pub destination: Option<S>,
    /// State on the ancestor chain that handles the trigger.
    pub handled_in: S,
    /// Guard descriptions attached to the transition.
    pub guard_descriptions: Vec<String>,
    /// Whether firing now (with the supplied arguments) would succeed.
    pub permitted: bool,
}

// =============================================================================
// State Machine
// =============================================================================

/// Pure in-memory hierarchical state machine.
///
/// # Example
///
/// ```ignore
/// let mut machine = StateMachine::new(DoorState::Closed);
/// machine
///     .configure(DoorState::Closed)
///     .permit(DoorTrigger::Open, DoorState::Open)
///     .permit_if1::<String>(DoorTrigger::Lock, DoorState::Locked,
///         "code is non-empty", |code| !code.is_empty());
/// machine
///     .configure(DoorState::Open)
///     .permit(DoorTrigger::Close, DoorState::Closed)
///     .on_entry(|t, _| println!("opened via {:?}", t.trigger));
/// machine.validate()?;
///
/// machine.fire(DoorTrigger::Open, &FireArgs::none())?;
/// assert_eq!(machine.current_state(), DoorState::Open);
/// ```
pub struct StateMachine<S: State, T: Trigger> {
    current: S,
    initial: S,
    nodes: HashMap<S, StateNode<S, T>>,
    hierarchy: Hierarchy<S>,
    reentrancy: ReentrancyFlag,
    deferred_errors: Vec<ConfigurationError>,
}

impl<S: State, T: Trigger> StateMachine<S, T> {
    /// Create a machine resting in `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            initial,
            nodes: HashMap::new(),
            hierarchy: Hierarchy::new(),
            reentrancy: ReentrancyFlag::new(),
            deferred_errors: Vec::new(),
        }
    }

    /// Share a reentrancy flag owned by the hosting actor.
    ///
    /// Call before configuring callbacks; regions of one actor must all
    /// carry the same flag.
    pub fn with_reentrancy(mut self, flag: ReentrancyFlag) -> Self {
        self.reentrancy = flag;
        self
    }

    /// The reentrancy flag guarding this machine's callbacks.
    pub fn reentrancy(&self) -> ReentrancyFlag {
        self.reentrancy.clone()
    }

    /// Open a state for configuration.
    pub fn configure(&mut self, state: S) -> StateConfigurer<'_, S, T> {
        self.nodes.entry(state).or_default();
        StateConfigurer { machine: self, state }
    }

    /// The state the machine currently rests in.
    pub fn current_state(&self) -> S {
        self.current
    }

    /// The declared initial state.
    pub fn initial_state(&self) -> S {
        self.initial
    }

    /// The hierarchy indexes.
    pub fn hierarchy(&self) -> &Hierarchy<S> {
        &self.hierarchy
    }

    /// True when `configure` was called for `state`.
    pub fn is_configured(&self, state: S) -> bool {
        self.nodes.contains_key(&state)
    }

    /// Surface configuration errors recorded during building.
    ///
    /// Called once at activation; the first recorded error wins.
    pub fn validate(&mut self) -> Result<(), ConfigurationError> {
        if self.deferred_errors.is_empty() {
            Ok(())
        } else {
            Err(self.deferred_errors.remove(0))
        }
    }

    /// Set the current state without running callbacks.
    ///
    /// Replay-only: events already record the deterministic outcome, so
    /// reconstruction must not re-run side effects.
    pub(crate) fn jump_to(&mut self, state: S) {
        self.current = state;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// True iff the machine is in `state` or one of its substates.
    pub fn is_in_state(&self, state: S) -> bool {
        self.current == state || self.hierarchy.is_ancestor(state, self.current)
    }

    /// Alias of [`StateMachine::is_in_state`] phrased from the parent's
    /// point of view.
    pub fn is_in_state_or_substate(&self, state: S) -> bool {
        self.is_in_state(state)
    }

    /// Path from the outermost ancestor down to the current state.
    pub fn current_path(&self) -> Vec<S> {
        self.hierarchy.path_from_root(self.current).into_vec()
    }

    /// True iff firing `trigger` with `args` would succeed.
    ///
    /// Ignored triggers count as permitted: firing them is accepted (as a
    /// no-op).
    pub fn can_fire(&self, trigger: T, args: &FireArgs) -> bool {
        self.can_fire_with_unmet_guards(trigger, args).0
    }

    /// Like [`StateMachine::can_fire`], also reporting which guard
    /// descriptions evaluated false.
    pub fn can_fire_with_unmet_guards(&self, trigger: T, args: &FireArgs) -> (bool, Vec<String>) {
        match self.resolve(trigger, args) {
            Resolution::Transition { .. } | Resolution::Ignored { .. } => (true, Vec::new()),
            Resolution::GuardsUnmet { unmet } => (false, unmet),
            Resolution::Unhandled => (false, Vec::new()),
        }
    }

    /// Triggers that would currently succeed, sorted by name.
    pub fn permitted_triggers(&self, args: &FireArgs) -> Vec<T> {
        let mut permitted: Vec<T> = self
            .scoped_triggers(args)
            .into_iter()
            .filter(|d| d.permitted)
            .map(|d| d.trigger)
            .collect();
        permitted.sort_by_key(Trigger::name);
        permitted
    }

    /// Detail for every trigger handled from the current state, including
    /// those whose guards currently fail.
    pub fn detailed_permitted_triggers(&self, args: &FireArgs) -> Vec<TriggerDetail<S, T>> {
        let mut details = self.scoped_triggers(args);
        details.sort_by_key(|d| d.trigger.name());
        details
    }

    /// Structural summary for dashboards.
    pub fn machine_info(&self) -> MachineInfo {
        let mut transitions: Vec<TransitionInfo> = self
            .nodes
            .iter()
            .flat_map(|(state, node)| {
                node.transitions.iter().map(|(trigger, def)| TransitionInfo {
                    from: state.name().to_string(),
                    trigger: trigger.name().to_string(),
                    to: def.destination.name().to_string(),
                    guarded: !def.guards.is_empty(),
                })
            })
            .collect();
        transitions.sort_by(|a, b| (&a.from, &a.trigger).cmp(&(&b.from, &b.trigger)));

        let mut hierarchy: Vec<HierarchyEdge> = self
            .hierarchy
            .edges()
            .map(|(child, parent)| HierarchyEdge {
                child: child.name().to_string(),
                parent: parent.name().to_string(),
            })
            .collect();
        hierarchy.sort_by(|a, b| a.child.cmp(&b.child));

        MachineInfo {
            current_state: self.current.name().to_string(),
            states: S::all().iter().map(|s| s.name().to_string()).collect(),
            permitted_triggers: self
                .permitted_triggers(&FireArgs::none())
                .iter()
                .map(|t| t.name().to_string())
                .collect(),
            transitions,
            hierarchy,
        }
    }

    // -------------------------------------------------------------------------
    // Fire
    // -------------------------------------------------------------------------

    /// Evaluate `trigger` into a transition, running exit and entry
    /// callbacks in the mandatory order.
    ///
    /// Fails with `InvalidTransition` (no side effects) when no permitted
    /// transition exists, and with `CallbackReentrancy` when invoked from
    /// inside a callback.
    pub fn fire(&mut self, trigger: T, args: &FireArgs) -> Result<EngineFire<S, T>, RatchetError> {
        if self.reentrancy.is_set() {
            return Err(RatchetError::CallbackReentrancy {
                state: self.current.name().to_string(),
                trigger: trigger.name().to_string(),
            });
        }

        let destination = match self.resolve(trigger, args) {
            Resolution::Ignored { state } => {
                trace!(state = state.name(), trigger = trigger.name(), "trigger ignored");
                return Ok(EngineFire::Ignored { state, trigger });
            }
            Resolution::Transition { destination } => destination,
            Resolution::GuardsUnmet { unmet } => {
                return Err(RatchetError::InvalidTransition {
                    state: self.current.name().to_string(),
                    trigger: trigger.name().to_string(),
                    unmet_guards: unmet,
                });
            }
            Resolution::Unhandled => {
                return Err(RatchetError::InvalidTransition {
                    state: self.current.name().to_string(),
                    trigger: trigger.name().to_string(),
                    unmet_guards: Vec::new(),
                });
            }
        };

        let transition = Transition {
            source: self.current,
            destination,
            trigger,
        };

        let lca = self.hierarchy.lowest_common_ancestor(self.current, destination);
        let exit_path = self.exit_path(lca);
        let entry_path = self.entry_path(destination, lca);

        trace!(
            from = transition.source.name(),
            to = destination.name(),
            trigger = trigger.name(),
            "transition"
        );

        for state in &exit_path {
            self.run_exit(*state, &transition, args);
        }
        self.current = destination;
        for state in &entry_path {
            self.run_entry(*state, &transition, args);
        }

        Ok(EngineFire::Transitioned(transition))
    }

    /// States to exit, leaf-first: the current state and its ancestors up
    /// to (not including) the lowest common ancestor.
    fn exit_path(&self, lca: Option<S>) -> Vec<S> {
        let mut path = Vec::new();
        let mut cursor = Some(self.current);
        while let Some(state) = cursor {
            if Some(state) == lca {
                break;
            }
            path.push(state);
            cursor = self.hierarchy.parent(state);
        }
        path
    }

    /// States to enter, root-first: ancestors of the destination below the
    /// lowest common ancestor, then the destination itself.
    fn entry_path(&self, destination: S, lca: Option<S>) -> Vec<S> {
        let mut above = Vec::new();
        let mut cursor = self.hierarchy.parent(destination);
        while let Some(state) = cursor {
            if Some(state) == lca {
                break;
            }
            above.push(state);
            cursor = self.hierarchy.parent(state);
        }
        above.reverse();
        above.push(destination);
        above
    }

    fn run_exit(&mut self, state: S, transition: &Transition<S, T>, args: &FireArgs) {
        let flag = self.reentrancy.clone();
        if let Some(node) = self.nodes.get_mut(&state) {
            for action in &mut node.exit {
                let _guard = flag.enter();
                action(transition, args);
            }
        }
    }

    fn run_entry(&mut self, state: S, transition: &Transition<S, T>, args: &FireArgs) {
        let flag = self.reentrancy.clone();
        if let Some(node) = self.nodes.get_mut(&state) {
            for action in &mut node.entry {
                let _guard = flag.enter();
                action(transition, args);
            }
            for (from, action) in &mut node.entry_from {
                if *from == transition.trigger {
                    let _guard = flag.enter();
                    action(transition, args);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    fn resolve(&self, trigger: T, args: &FireArgs) -> Resolution<S> {
        let mut cursor = Some(self.current);
        while let Some(state) = cursor {
            if let Some(node) = self.nodes.get(&state) {
                if node.ignored.contains(&trigger) {
                    return Resolution::Ignored { state };
                }
                if let Some(def) = node.transitions.get(&trigger) {
                    let unmet: Vec<String> = def
                        .guards
                        .iter()
                        .filter(|g| !(g.predicate)(args))
                        .map(|g| g.description.clone())
                        .collect();
                    // The lowest handler wins outright; a failing guard
                    // does not fall through to an ancestor's handler.
                    return if unmet.is_empty() {
                        Resolution::Transition {
                            destination: def.destination,
                        }
                    } else {
                        Resolution::GuardsUnmet { unmet }
                    };
                }
            }
            cursor = self.hierarchy.parent(state);
        }
        Resolution::Unhandled
    }

    fn scoped_triggers(&self, args: &FireArgs) -> Vec<TriggerDetail<S, T>> {
        let mut seen: HashSet<T> = HashSet::new();
        let mut details = Vec::new();
        let mut cursor = Some(self.current);
        while let Some(state) = cursor {
            if let Some(node) = self.nodes.get(&state) {
                for trigger in &node.ignored {
                    if seen.insert(*trigger) {
                        details.push(TriggerDetail {
                            trigger: *trigger,
                            destination: None,
                            handled_in: state,
                            guard_descriptions: Vec::new(),
                            permitted: true,
                        });
                    }
                }
                for (trigger, def) in &node.transitions {
                    if seen.insert(*trigger) {
                        let permitted = def.guards.iter().all(|g| (g.predicate)(args));
                        details.push(TriggerDetail {
                            trigger: *trigger,
                            destination: Some(def.destination),
                            handled_in: state,
                            guard_descriptions: def
                                .guards
                                .iter()
                                .map(|g| g.description.clone())
                                .collect(),
                            permitted,
                        });
                    }
                }
            }
            cursor = self.hierarchy.parent(state);
        }
        details
    }
}

enum Resolution<S> {
    Transition { destination: S },
    GuardsUnmet { unmet: Vec<String> },
    Ignored { state: S },
    Unhandled,
}

// =============================================================================
// State Configurer
// =============================================================================

/// Fluent configuration handle for one state.
///
/// Obtained from [`StateMachine::configure`]. Errors (duplicate triggers,
/// hierarchy violations) are recorded and surfaced by
/// [`StateMachine::validate`], so configuration chains stay fluent.
pub struct StateConfigurer<'a, S: State, T: Trigger> {
    machine: &'a mut StateMachine<S, T>,
    state: S,
}

impl<S: State, T: Trigger> StateConfigurer<'_, S, T> {
    /// Permit `trigger` to transition to `destination`.
    pub fn permit(&mut self, trigger: T, destination: S) -> &mut Self {
        self.add_transition(trigger, destination, Vec::new())
    }

    /// Permit `trigger` when `guard` evaluates true.
    ///
    /// The description names the condition in guard-failure reports, e.g.
    /// `"code matches"`.
    pub fn permit_if(
        &mut self,
        trigger: T,
        destination: S,
        description: impl Into<String>,
        guard: impl Fn(&FireArgs) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_transition(
            trigger,
            destination,
            vec![GuardDef {
                description: description.into(),
                predicate: Box::new(guard),
            }],
        )
    }

    /// Permit `trigger` gated on its first typed parameter.
    ///
    /// The guard fails when the parameter is missing or of the wrong type.
    pub fn permit_if1<P0>(
        &mut self,
        trigger: T,
        destination: S,
        description: impl Into<String>,
        guard: impl Fn(&P0) -> bool + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
    {
        self.permit_if(trigger, destination, description, move |args| {
            args.get::<P0>(0).is_some_and(|p0| guard(p0))
        })
    }

    /// Permit `trigger` gated on its first two typed parameters.
    pub fn permit_if2<P0, P1>(
        &mut self,
        trigger: T,
        destination: S,
        description: impl Into<String>,
        guard: impl Fn(&P0, &P1) -> bool + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
        P1: Send + Sync + 'static,
    {
        self.permit_if(trigger, destination, description, move |args| {
            match (args.get::<P0>(0), args.get::<P1>(1)) {
                (Some(p0), Some(p1)) => guard(p0, p1),
                _ => false,
            }
        })
    }

    /// Permit `trigger` gated on all three typed parameters.
    pub fn permit_if3<P0, P1, P2>(
        &mut self,
        trigger: T,
        destination: S,
        description: impl Into<String>,
        guard: impl Fn(&P0, &P1, &P2) -> bool + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
        P1: Send + Sync + 'static,
        P2: Send + Sync + 'static,
    {
        self.permit_if(trigger, destination, description, move |args| {
            match (args.get::<P0>(0), args.get::<P1>(1), args.get::<P2>(2)) {
                (Some(p0), Some(p1), Some(p2)) => guard(p0, p1, p2),
                _ => false,
            }
        })
    }

    /// Accept `trigger` as a no-op in this state.
    pub fn ignore(&mut self, trigger: T) -> &mut Self {
        if self.node().transitions.contains_key(&trigger) {
            self.record_duplicate(trigger);
        } else {
            self.node().ignored.insert(trigger);
        }
        self
    }

    /// Run `action` whenever this state is entered.
    pub fn on_entry(
        &mut self,
        action: impl FnMut(&Transition<S, T>, &FireArgs) + Send + Sync + 'static,
    ) -> &mut Self {
        self.node().entry.push(Box::new(action));
        self
    }

    /// Run `action` when this state is entered via `trigger`.
    pub fn on_entry_from(
        &mut self,
        trigger: T,
        action: impl FnMut(&Transition<S, T>, &FireArgs) + Send + Sync + 'static,
    ) -> &mut Self {
        self.node().entry_from.push((trigger, Box::new(action)));
        self
    }

    /// Typed variant of [`StateConfigurer::on_entry_from`] receiving the
    /// first trigger parameter. Skipped when the parameter is absent.
    pub fn on_entry_from1<P0>(
        &mut self,
        trigger: T,
        mut action: impl FnMut(&P0) + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
    {
        self.on_entry_from(trigger, move |_, args| {
            if let Some(p0) = args.get::<P0>(0) {
                action(p0);
            }
        })
    }

    /// Typed variant receiving the first two trigger parameters.
    pub fn on_entry_from2<P0, P1>(
        &mut self,
        trigger: T,
        mut action: impl FnMut(&P0, &P1) + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
        P1: Send + Sync + 'static,
    {
        self.on_entry_from(trigger, move |_, args| {
            if let (Some(p0), Some(p1)) = (args.get::<P0>(0), args.get::<P1>(1)) {
                action(p0, p1);
            }
        })
    }

    /// Typed variant receiving all three trigger parameters.
    pub fn on_entry_from3<P0, P1, P2>(
        &mut self,
        trigger: T,
        mut action: impl FnMut(&P0, &P1, &P2) + Send + Sync + 'static,
    ) -> &mut Self
    where
        P0: Send + Sync + 'static,
        P1: Send + Sync + 'static,
        P2: Send + Sync + 'static,
    {
        self.on_entry_from(trigger, move |_, args| {
            if let (Some(p0), Some(p1), Some(p2)) =
                (args.get::<P0>(0), args.get::<P1>(1), args.get::<P2>(2))
            {
                action(p0, p1, p2);
            }
        })
    }

    /// Run `action` whenever this state is exited.
    pub fn on_exit(
        &mut self,
        action: impl FnMut(&Transition<S, T>, &FireArgs) + Send + Sync + 'static,
    ) -> &mut Self {
        self.node().exit.push(Box::new(action));
        self
    }

    /// Declare this state a substate of `parent`.
    pub fn substate_of(&mut self, parent: S) -> &mut Self {
        let state = self.state;
        if let Err(err) = self.machine.hierarchy.set_parent(state, parent) {
            self.machine.deferred_errors.push(err);
        }
        self
    }

    fn add_transition(&mut self, trigger: T, destination: S, guards: Vec<GuardDef>) -> &mut Self {
        let node = self.node();
        if node.transitions.contains_key(&trigger) || node.ignored.contains(&trigger) {
            self.record_duplicate(trigger);
            return self;
        }
        self.node()
            .transitions
            .insert(trigger, TransitionDef { destination, guards });
        self
    }

    fn record_duplicate(&mut self, trigger: T) {
        let err = ConfigurationError::DuplicateTransition {
            state: self.state.name().to_string(),
            trigger: trigger.name().to_string(),
        };
        self.machine.deferred_errors.push(err);
    }

    fn node(&mut self) -> &mut StateNode<S, T> {
        self.machine.nodes.entry(self.state).or_default()
    }
}
