//! The in-process actor host.
//!
//! One tokio task per actor drains an mpsc mailbox, so at most one
//! operation executes per actor at any moment and turns never interleave
//! - the single-writer discipline every other module assumes. Timer
//! expiries enter the same mailbox and are therefore serialized with
//! caller fires.
//!
//! Actors activate on first reference: the runtime builds the machine
//! from its definition, replays the log, rehydrates timers, and only then
//! hands out a handle. Deactivation stops the task and drops ephemeral
//! timers; the next reference replays.
//!
//! This host is deliberately small. A production deployment swaps in its
//! own placement and storage by implementing [`EventStore`],
//! [`StreamPublisher`], and [`ReminderStore`]; the actor contract exposed
//! by [`ActorHandle`] stays the same.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorOptions;
use crate::coordinator::{Activation, Coordinator, FireOptions, FireOutcome};
use crate::core::{ActorId, CorrelationId, FireArgs, State, Trigger};
use crate::error::RatchetError;
use crate::event::TransitionEvent;
use crate::machine::{MachineInfo, StateMachine, TriggerDetail};
use crate::region::{RegionFireReport, RegionSet, StateSummary};
use crate::store::{EventStore, LogIndex};
use crate::stream::StreamPublisher;
use crate::timer::{ReminderStore, TimeoutConfig, TimerFire};
use crate::upcast::UpcastRegistry;

// =============================================================================
// Definitions
// =============================================================================

/// Constructor-time hooks for one actor type.
///
/// Replaces deep runtime inheritance with composition: the definition
/// describes the machine, the runtime assembles engine, persistence,
/// timers, and hierarchy around it.
///
/// # Example
///
/// ```ignore
/// struct DoorDef;
///
/// impl MachineDef for DoorDef {
///     type State = DoorState;
///     type Trigger = DoorTrigger;
///
///     fn initial_state(&self) -> DoorState {
///         DoorState::Closed
///     }
///
///     fn build(&self, machine: &mut StateMachine<DoorState, DoorTrigger>) {
///         machine.configure(DoorState::Closed)
///             .permit(DoorTrigger::Open, DoorState::Open);
///         machine.configure(DoorState::Open)
///             .permit(DoorTrigger::Close, DoorState::Closed);
///     }
/// }
/// ```
pub trait MachineDef: Send + Sync + 'static {
    /// The state domain.
    type State: State;
    /// The trigger domain.
    type Trigger: Trigger;

    /// The state a fresh actor rests in.
    fn initial_state(&self) -> Self::State;

    /// Configure transitions, guards, callbacks, and hierarchy.
    fn build(&self, machine: &mut StateMachine<Self::State, Self::Trigger>);

    /// State-scoped timeouts.
    fn timeouts(&self) -> Vec<TimeoutConfig<Self::State, Self::Trigger>> {
        Vec::new()
    }

    /// Adjust the runtime's default options for this actor type.
    fn configure_options(&self, defaults: CoordinatorOptions) -> CoordinatorOptions {
        defaults
    }

    /// Domain payload carried in snapshots.
    fn snapshot_payload(&self) -> Option<Value> {
        None
    }

    /// Restore the payload a snapshot carried. Definitions keeping domain
    /// state use interior mutability here.
    fn restore_snapshot_payload(&self, _payload: Value) {}
}

/// Constructor-time hooks for a container actor with orthogonal regions.
pub trait RegionDef: Send + Sync + 'static {
    /// The state domain, shared by primary and regions.
    type State: State;
    /// The trigger domain.
    type Trigger: Trigger;

    /// The primary machine's initial state.
    fn initial_state(&self) -> Self::State;

    /// Configure the primary machine.
    fn build_primary(&self, machine: &mut StateMachine<Self::State, Self::Trigger>);

    /// Register regions, routes, reactions, and composite resolution.
    fn build_regions(&self, regions: &mut RegionSet<Self::State, Self::Trigger>);

    /// Adjust the runtime's default options for this container type.
    fn configure_options(&self, defaults: CoordinatorOptions) -> CoordinatorOptions {
        defaults
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Builds an [`ActorRuntime`].
pub struct ActorRuntimeBuilder {
    store: Arc<dyn EventStore>,
    publisher: Option<Arc<dyn StreamPublisher>>,
    reminders: Option<Arc<dyn ReminderStore>>,
    upcasts: Option<Arc<UpcastRegistry>>,
    clock: Arc<dyn Clock>,
    options: CoordinatorOptions,
}

impl ActorRuntimeBuilder {
    /// Stream publisher handed to every coordinator.
    pub fn publisher(mut self, publisher: Arc<dyn StreamPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Durable reminder store handed to every coordinator.
    pub fn reminders(mut self, store: Arc<dyn ReminderStore>) -> Self {
        self.reminders = Some(store);
        self
    }

    /// Upcast registry; the process default otherwise.
    pub fn upcasts(mut self, registry: Arc<UpcastRegistry>) -> Self {
        self.upcasts = Some(registry);
        self
    }

    /// Clock override for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runtime-wide default options; definitions may adjust per type.
    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Finish the build.
    pub fn build(self) -> ActorRuntime {
        ActorRuntime {
            store: self.store,
            publisher: self.publisher,
            reminders: self.reminders,
            upcasts: self.upcasts.unwrap_or_else(UpcastRegistry::process_default),
            clock: self.clock,
            options: self.options,
            directory: DashMap::new(),
            activation: tokio::sync::Mutex::new(()),
        }
    }
}

/// Hosts actors: activation on first reference, one mailbox task each.
pub struct ActorRuntime {
    store: Arc<dyn EventStore>,
    publisher: Option<Arc<dyn StreamPublisher>>,
    reminders: Option<Arc<dyn ReminderStore>>,
    upcasts: Arc<UpcastRegistry>,
    clock: Arc<dyn Clock>,
    options: CoordinatorOptions,
    directory: DashMap<ActorId, Box<dyn std::any::Any + Send + Sync>>,
    /// Serializes activations so two callers racing on the same id don't
    /// both replay.
    activation: tokio::sync::Mutex<()>,
}

impl ActorRuntime {
    /// Start building a runtime over a storage provider.
    pub fn builder(store: Arc<dyn EventStore>) -> ActorRuntimeBuilder {
        ActorRuntimeBuilder {
            store,
            publisher: None,
            reminders: None,
            upcasts: None,
            clock: Arc::new(SystemClock),
            options: CoordinatorOptions::default(),
        }
    }

    /// Obtain a handle to an actor, activating it on first reference.
    pub async fn actor<D: MachineDef>(
        &self,
        id: impl Into<ActorId>,
        def: Arc<D>,
    ) -> Result<ActorHandle<D::State, D::Trigger>, RatchetError> {
        let id = id.into();
        let _guard = self.activation.lock().await;

        if let Some(entry) = self.directory.get(&id) {
            if let Some(handle) = entry.downcast_ref::<ActorHandle<D::State, D::Trigger>>() {
                if handle.is_alive() {
                    return Ok(handle.clone());
                }
            }
        }

        let handle = self.activate_plain(id.clone(), def).await?;
        self.directory.insert(id, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Obtain a handle to a container actor with orthogonal regions.
    pub async fn container<D: RegionDef>(
        &self,
        id: impl Into<ActorId>,
        def: Arc<D>,
    ) -> Result<ContainerHandle<D::State, D::Trigger>, RatchetError> {
        let id = id.into();
        let _guard = self.activation.lock().await;

        if let Some(entry) = self.directory.get(&id) {
            if let Some(handle) = entry.downcast_ref::<ContainerHandle<D::State, D::Trigger>>() {
                if handle.is_alive() {
                    return Ok(handle.clone());
                }
            }
        }

        let handle = self.activate_container(id.clone(), def).await?;
        self.directory.insert(id, Box::new(handle.clone()));
        Ok(handle)
    }

    async fn activate_plain<D: MachineDef>(
        &self,
        id: ActorId,
        def: Arc<D>,
    ) -> Result<ActorHandle<D::State, D::Trigger>, RatchetError> {
        let mut machine = StateMachine::new(def.initial_state());
        def.build(&mut machine);

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let payload_def = def.clone();
        let mut builder = Coordinator::builder(id.clone(), machine, self.store.clone())
            .options(def.configure_options(self.options.clone()))
            .upcasts(self.upcasts.clone())
            .clock(self.clock.clone())
            .timeouts(def.timeouts(), timer_tx)
            .snapshot_payload(move || payload_def.snapshot_payload());
        if let Some(publisher) = &self.publisher {
            builder = builder.publisher(publisher.clone());
        }
        if let Some(reminders) = &self.reminders {
            builder = builder.reminders(reminders.clone());
        }
        let mut coordinator = builder.build();

        let activation = coordinator.activate().await?;
        if let Some(payload) = activation.domain_payload {
            def.restore_snapshot_payload(payload);
        }

        let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<Op<D::State, D::Trigger>>();
        let actor_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    op = ops_rx.recv() => {
                        let Some(op) = op else { break };
                        if run_op(&mut coordinator, op).await.is_break() {
                            break;
                        }
                    }
                    Some(fire) = timer_rx.recv() => {
                        run_timer_fire(&mut coordinator, fire).await;
                    }
                }
            }
            debug!(actor = %actor_id, "actor task stopped");
        });

        Ok(ActorHandle { id, tx: ops_tx })
    }

    async fn activate_container<D: RegionDef>(
        &self,
        id: ActorId,
        def: Arc<D>,
    ) -> Result<ContainerHandle<D::State, D::Trigger>, RatchetError> {
        let mut machine = StateMachine::new(def.initial_state());
        def.build_primary(&mut machine);

        let mut regions = RegionSet::new(machine.reentrancy());
        def.build_regions(&mut regions);
        regions.validate()?;

        // Region states ride in the snapshot's domain payload. The mirror
        // exists because the snapshot closure cannot borrow the region set
        // owned by the actor task.
        let mirror: Arc<Mutex<BTreeMap<String, String>>> = Arc::new(Mutex::new(
            regions
                .all_region_states()
                .into_iter()
                .map(|(name, state)| (name, state.name().to_string()))
                .collect(),
        ));

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let snapshot_mirror = mirror.clone();
        let mut builder = Coordinator::builder(id.clone(), machine, self.store.clone())
            .options(def.configure_options(self.options.clone()))
            .upcasts(self.upcasts.clone())
            .clock(self.clock.clone())
            .timeouts(Vec::new(), timer_tx)
            .snapshot_payload(move || {
                Some(json!({ "regions": snapshot_mirror.lock().unwrap().clone() }))
            });
        if let Some(publisher) = &self.publisher {
            builder = builder.publisher(publisher.clone());
        }
        if let Some(reminders) = &self.reminders {
            builder = builder.reminders(reminders.clone());
        }
        let mut coordinator = builder.build();

        let activation = coordinator.activate().await?;
        restore_regions(&mut regions, &mirror, &activation)?;

        let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<ContainerOp<D::State, D::Trigger>>();
        let actor_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    op = ops_rx.recv() => {
                        let Some(op) = op else { break };
                        if run_container_op(&mut coordinator, &mut regions, &mirror, op)
                            .await
                            .is_break()
                        {
                            break;
                        }
                    }
                    Some(fire) = timer_rx.recv() => {
                        run_timer_fire(&mut coordinator, fire).await;
                    }
                }
            }
            debug!(actor = %actor_id, "container task stopped");
        });

        Ok(ContainerHandle { id, tx: ops_tx })
    }
}

fn restore_regions<S: State, T: Trigger>(
    regions: &mut RegionSet<S, T>,
    mirror: &Arc<Mutex<BTreeMap<String, String>>>,
    activation: &Activation,
) -> Result<(), RatchetError> {
    // Snapshot first, then the region events that followed it.
    if let Some(map) = activation
        .domain_payload
        .as_ref()
        .and_then(|p| p.get("regions"))
        .and_then(Value::as_object)
    {
        for (name, state_name) in map {
            let Some(state) = state_name.as_str().and_then(S::from_name) else {
                continue;
            };
            // Regions may come and go across versions; unknown names in
            // an old snapshot are not fatal.
            if regions.restore_region(name, state).is_err() {
                warn!(region = %name, "snapshot names an unknown region");
            }
        }
    }
    for event in &activation.region_events {
        let Some(region) = event.region() else { continue };
        let Some(state) = event.to_state_parsed::<S>() else {
            continue;
        };
        if regions.restore_region(region, state).is_err() {
            warn!(region = %region, "event names an unknown region");
        }
    }
    let mut mirror = mirror.lock().unwrap();
    *mirror = regions
        .all_region_states()
        .into_iter()
        .map(|(name, state)| (name, state.name().to_string()))
        .collect();
    Ok(())
}

// =============================================================================
// Operations
// =============================================================================

enum Op<S: State, T: Trigger> {
    Fire {
        trigger: T,
        opts: FireOptions,
        reply: oneshot::Sender<Result<FireOutcome<S>, RatchetError>>,
    },
    Inspect(Box<dyn FnOnce(&Coordinator<S, T>) + Send>),
    Mutate(Box<dyn FnOnce(&mut Coordinator<S, T>) + Send>),
    History {
        from: LogIndex,
        to: LogIndex,
        reply: oneshot::Sender<Result<Vec<TransitionEvent>, RatchetError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<u64, RatchetError>>,
    },
    Deactivate {
        reply: oneshot::Sender<()>,
    },
}

async fn run_op<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    op: Op<S, T>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;
    match op {
        Op::Fire { trigger, opts, reply } => {
            let result = coordinator.fire(trigger, opts).await;
            let _ = reply.send(result);
        }
        Op::Inspect(f) => f(coordinator),
        Op::Mutate(f) => f(coordinator),
        Op::History { from, to, reply } => {
            let _ = reply.send(coordinator.event_history(from, to).await);
        }
        Op::Snapshot { reply } => {
            let _ = reply.send(coordinator.create_snapshot().await);
        }
        Op::Deactivate { reply } => {
            coordinator.deactivate();
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

async fn run_timer_fire<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    fire: TimerFire<T>,
) {
    let opts = FireOptions {
        timer: Some((fire.timer_name.clone(), fire.tick)),
        ..Default::default()
    };
    match coordinator.fire(fire.trigger, opts).await {
        Ok(_) => {}
        // The state moved on before the expiry landed; nothing to do.
        Err(RatchetError::InvalidTransition { state, trigger, .. }) => {
            debug!(timer = %fire.timer_name, %state, %trigger, "late timer fire discarded");
        }
        Err(err) => {
            warn!(timer = %fire.timer_name, error = %err, "timer fire failed");
        }
    }
}

enum ContainerOp<S: State, T: Trigger> {
    Fire {
        trigger: T,
        args: FireArgs,
        reply: oneshot::Sender<Result<ContainerFireReport<S, T>, RatchetError>>,
    },
    FireInRegion {
        region: String,
        trigger: T,
        args: FireArgs,
        reply: oneshot::Sender<Result<RegionFireReport<S, T>, RatchetError>>,
    },
    InspectRegions(Box<dyn FnOnce(&Coordinator<S, T>, &RegionSet<S, T>) + Send>),
    Mutate(Box<dyn FnOnce(&mut Coordinator<S, T>) + Send>),
    History {
        from: LogIndex,
        to: LogIndex,
        reply: oneshot::Sender<Result<Vec<TransitionEvent>, RatchetError>>,
    },
    Deactivate {
        reply: oneshot::Sender<()>,
    },
}

/// What one container fire did: the primary's outcome plus the regions'.
#[derive(Debug)]
pub struct ContainerFireReport<S, T> {
    /// Outcome of the primary machine's fire, when it could fire.
    pub primary: Option<FireOutcome<S>>,
    /// The regions' transitions, reactions, and failures.
    pub regions: RegionFireReport<S, T>,
}

async fn run_container_op<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    regions: &mut RegionSet<S, T>,
    mirror: &Arc<Mutex<BTreeMap<String, String>>>,
    op: ContainerOp<S, T>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;
    match op {
        ContainerOp::Fire { trigger, args, reply } => {
            let result = container_fire(coordinator, regions, mirror, trigger, args).await;
            let _ = reply.send(result);
        }
        ContainerOp::FireInRegion { region, trigger, args, reply } => {
            let result =
                container_fire_in_region(coordinator, regions, mirror, &region, trigger, args)
                    .await;
            let _ = reply.send(result);
        }
        ContainerOp::InspectRegions(f) => f(coordinator, regions),
        ContainerOp::Mutate(f) => f(coordinator),
        ContainerOp::History { from, to, reply } => {
            let _ = reply.send(coordinator.event_history(from, to).await);
        }
        ContainerOp::Deactivate { reply } => {
            coordinator.deactivate();
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

async fn container_fire<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    regions: &mut RegionSet<S, T>,
    mirror: &Arc<Mutex<BTreeMap<String, String>>>,
    trigger: T,
    args: FireArgs,
) -> Result<ContainerFireReport<S, T>, RatchetError> {
    let mut primary = None;
    if coordinator.machine().can_fire(trigger, &args) {
        let outcome = coordinator
            .fire(trigger, FireOptions::with_args(args.clone()))
            .await?;
        primary = Some(outcome);
    }

    let report = regions.fire_regions(trigger, &args)?;
    commit_region_changes(coordinator, regions, mirror, &report).await?;
    Ok(ContainerFireReport { primary, regions: report })
}

async fn container_fire_in_region<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    regions: &mut RegionSet<S, T>,
    mirror: &Arc<Mutex<BTreeMap<String, String>>>,
    region: &str,
    trigger: T,
    args: FireArgs,
) -> Result<RegionFireReport<S, T>, RatchetError> {
    let report = regions.fire_in_region(region, trigger, &args)?;
    commit_region_changes(coordinator, regions, mirror, &report).await?;
    Ok(report)
}

/// Persist each region transition and refresh the snapshot mirror.
async fn commit_region_changes<S: State, T: Trigger>(
    coordinator: &mut Coordinator<S, T>,
    regions: &RegionSet<S, T>,
    mirror: &Arc<Mutex<BTreeMap<String, String>>>,
    report: &RegionFireReport<S, T>,
) -> Result<(), RatchetError> {
    for change in &report.changes {
        coordinator
            .record_region_transition(&change.region, change.from, change.to, change.trigger)
            .await?;
    }
    if !report.changes.is_empty() {
        let mut mirror = mirror.lock().unwrap();
        *mirror = regions
            .all_region_states()
            .into_iter()
            .map(|(name, state)| (name, state.name().to_string()))
            .collect();
    }
    Ok(())
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Clonable reference to a running actor.
///
/// Every method is a message into the actor's mailbox; a closed mailbox
/// (deactivated actor) surfaces as `ActorUnavailable`. Obtain a fresh
/// handle from the runtime to reactivate.
pub struct ActorHandle<S: State, T: Trigger> {
    id: ActorId,
    tx: mpsc::UnboundedSender<Op<S, T>>,
}

impl<S: State, T: Trigger> Clone for ActorHandle<S, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: State, T: Trigger> ActorHandle<S, T> {
    /// The actor's identity.
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// True while the actor task is running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn unavailable(&self) -> RatchetError {
        RatchetError::ActorUnavailable {
            actor_id: self.id.to_string(),
        }
    }

    fn send(&self, op: Op<S, T>) -> Result<(), RatchetError> {
        self.tx.send(op).map_err(|_| self.unavailable())
    }

    async fn inspect<R: Send + 'static>(
        &self,
        f: impl FnOnce(&Coordinator<S, T>) -> R + Send + 'static,
    ) -> Result<R, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::Inspect(Box::new(move |c| {
            let _ = tx.send(f(c));
        })))?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Fire a nullary trigger.
    pub async fn fire(&self, trigger: T) -> Result<FireOutcome<S>, RatchetError> {
        self.fire_opts(trigger, FireOptions::default()).await
    }

    /// Fire a trigger with parameters.
    pub async fn fire_with(&self, trigger: T, args: FireArgs) -> Result<FireOutcome<S>, RatchetError> {
        self.fire_opts(trigger, FireOptions::with_args(args)).await
    }

    /// Fire with full options (dedupe override, cancellation, timeout).
    pub async fn fire_opts(
        &self,
        trigger: T,
        mut opts: FireOptions,
    ) -> Result<FireOutcome<S>, RatchetError> {
        let timeout = opts.timeout.take();
        let (tx, rx) = oneshot::channel();
        self.send(Op::Fire {
            trigger,
            opts,
            reply: tx,
        })?;
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply.map_err(|_| self.unavailable())?,
                // The fire keeps running to completion inside the actor;
                // only this caller stops waiting.
                Err(_) => Err(RatchetError::Timeout { timeout: limit }),
            },
            None => rx.await.map_err(|_| self.unavailable())?,
        }
    }

    /// The current state.
    pub async fn current_state(&self) -> Result<S, RatchetError> {
        self.inspect(|c| c.machine().current_state()).await
    }

    /// True iff the actor is in `state` or one of its substates.
    pub async fn is_in_state(&self, state: S) -> Result<bool, RatchetError> {
        self.inspect(move |c| c.machine().is_in_state(state)).await
    }

    /// Alias phrased from the parent's point of view.
    pub async fn is_in_state_or_substate(&self, state: S) -> Result<bool, RatchetError> {
        self.inspect(move |c| c.machine().is_in_state_or_substate(state)).await
    }

    /// Whether `trigger` would currently succeed.
    pub async fn can_fire(&self, trigger: T) -> Result<bool, RatchetError> {
        self.can_fire_with(trigger, FireArgs::none()).await
    }

    /// Whether `trigger` with `args` would currently succeed.
    pub async fn can_fire_with(&self, trigger: T, args: FireArgs) -> Result<bool, RatchetError> {
        self.inspect(move |c| c.machine().can_fire(trigger, &args)).await
    }

    /// Like `can_fire`, also naming the guards that failed.
    pub async fn can_fire_with_unmet_guards(
        &self,
        trigger: T,
        args: FireArgs,
    ) -> Result<(bool, Vec<String>), RatchetError> {
        self.inspect(move |c| c.machine().can_fire_with_unmet_guards(trigger, &args))
            .await
    }

    /// Triggers that would currently succeed.
    pub async fn permitted_triggers(&self) -> Result<Vec<T>, RatchetError> {
        self.permitted_triggers_with(FireArgs::none()).await
    }

    /// Triggers that would succeed under `args`.
    pub async fn permitted_triggers_with(&self, args: FireArgs) -> Result<Vec<T>, RatchetError> {
        self.inspect(move |c| c.machine().permitted_triggers(&args)).await
    }

    /// Per-trigger detail including guard descriptions.
    pub async fn detailed_permitted_triggers(
        &self,
        args: FireArgs,
    ) -> Result<Vec<TriggerDetail<S, T>>, RatchetError> {
        self.inspect(move |c| c.machine().detailed_permitted_triggers(&args))
            .await
    }

    /// Structural summary of the machine.
    pub async fn machine_info(&self) -> Result<MachineInfo, RatchetError> {
        self.inspect(|c| c.machine().machine_info()).await
    }

    /// Set the correlation id stamped on subsequent events.
    pub async fn set_correlation_id(&self, cid: Option<CorrelationId>) -> Result<(), RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::Mutate(Box::new(move |c| {
            c.set_correlation_id(cid);
            let _ = tx.send(());
        })))?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// The correlation id currently in effect.
    pub async fn last_correlation_id(&self) -> Result<Option<CorrelationId>, RatchetError> {
        self.inspect(|c| c.last_correlation_id()).await
    }

    /// Number of transitions applied since the log began.
    pub async fn transition_count(&self) -> Result<u64, RatchetError> {
        self.inspect(|c| c.transition_count()).await
    }

    /// Log index covered by the latest snapshot.
    pub async fn snapshot_version(&self) -> Result<u64, RatchetError> {
        self.inspect(|c| c.snapshot_version()).await
    }

    /// Write a snapshot now.
    pub async fn create_snapshot(&self) -> Result<u64, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::Snapshot { reply: tx })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Decode the events between two log indexes, inclusive.
    pub async fn event_history(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransitionEvent>, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::History {
            from: LogIndex::new(from),
            to: LogIndex::new(to),
            reply: tx,
        })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// The parent of `state`, if any.
    pub async fn parent_of(&self, state: S) -> Result<Option<S>, RatchetError> {
        self.inspect(move |c| c.machine().hierarchy().parent(state)).await
    }

    /// Direct substates of `state`.
    pub async fn substates_of(&self, state: S) -> Result<Vec<S>, RatchetError> {
        self.inspect(move |c| c.machine().hierarchy().children(state).to_vec())
            .await
    }

    /// Ancestors of `state`, nearest first.
    pub async fn ancestors(&self, state: S) -> Result<Vec<S>, RatchetError> {
        self.inspect(move |c| c.machine().hierarchy().ancestors(state).into_vec())
            .await
    }

    /// Transitive substates of `state`, breadth-first.
    pub async fn descendants(&self, state: S) -> Result<Vec<S>, RatchetError> {
        self.inspect(move |c| c.machine().hierarchy().descendants(state)).await
    }

    /// Path from the outermost ancestor down to the current state.
    pub async fn current_path(&self) -> Result<Vec<S>, RatchetError> {
        self.inspect(|c| c.machine().current_path()).await
    }

    /// Stop the actor. Ephemeral timers die; the log remains; the next
    /// runtime reference reactivates and replays.
    pub async fn deactivate(&self) -> Result<(), RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::Deactivate { reply: tx })?;
        rx.await.map_err(|_| self.unavailable())
    }
}

// =============================================================================
// Container Handle
// =============================================================================

/// Clonable reference to a running container actor.
pub struct ContainerHandle<S: State, T: Trigger> {
    id: ActorId,
    tx: mpsc::UnboundedSender<ContainerOp<S, T>>,
}

impl<S: State, T: Trigger> Clone for ContainerHandle<S, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: State, T: Trigger> ContainerHandle<S, T> {
    /// The container's identity.
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// True while the container task is running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn unavailable(&self) -> RatchetError {
        RatchetError::ActorUnavailable {
            actor_id: self.id.to_string(),
        }
    }

    fn send(&self, op: ContainerOp<S, T>) -> Result<(), RatchetError> {
        self.tx.send(op).map_err(|_| self.unavailable())
    }

    async fn inspect<R: Send + 'static>(
        &self,
        f: impl FnOnce(&Coordinator<S, T>, &RegionSet<S, T>) -> R + Send + 'static,
    ) -> Result<R, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::InspectRegions(Box::new(move |c, r| {
            let _ = tx.send(f(c, r));
        })))?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Fire at the primary and the routed regions.
    pub async fn fire(&self, trigger: T) -> Result<ContainerFireReport<S, T>, RatchetError> {
        self.fire_with(trigger, FireArgs::none()).await
    }

    /// Fire with parameters.
    pub async fn fire_with(
        &self,
        trigger: T,
        args: FireArgs,
    ) -> Result<ContainerFireReport<S, T>, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::Fire {
            trigger,
            args,
            reply: tx,
        })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Fire into one named region.
    pub async fn fire_in_region(
        &self,
        region: impl Into<String>,
        trigger: T,
    ) -> Result<RegionFireReport<S, T>, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::FireInRegion {
            region: region.into(),
            trigger,
            args: FireArgs::none(),
            reply: tx,
        })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// The primary machine's current state.
    pub async fn current_state(&self) -> Result<S, RatchetError> {
        self.inspect(|c, _| c.machine().current_state()).await
    }

    /// One region's current state.
    pub async fn region_state(&self, name: impl Into<String>) -> Result<Option<S>, RatchetError> {
        let name = name.into();
        self.inspect(move |_, r| r.region_state(&name)).await
    }

    /// Every region's current state.
    pub async fn all_region_states(&self) -> Result<BTreeMap<String, S>, RatchetError> {
        self.inspect(|_, r| r.all_region_states()).await
    }

    /// The derived composite state.
    pub async fn composite_state(&self) -> Result<S, RatchetError> {
        self.inspect(|c, r| r.composite_state(c.machine().current_state())).await
    }

    /// Full summary of primary, composite, and regions.
    pub async fn state_summary(&self) -> Result<StateSummary<S>, RatchetError> {
        self.inspect(|c, r| r.state_summary(c.machine().current_state())).await
    }

    /// Number of transitions (primary and regions) in the log.
    pub async fn transition_count(&self) -> Result<u64, RatchetError> {
        self.inspect(|c, _| c.transition_count()).await
    }

    /// Structural summary of the primary machine.
    pub async fn machine_info(&self) -> Result<MachineInfo, RatchetError> {
        self.inspect(|c, _| c.machine().machine_info()).await
    }

    /// Set the correlation id stamped on subsequent events.
    pub async fn set_correlation_id(&self, cid: Option<CorrelationId>) -> Result<(), RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::Mutate(Box::new(move |c| {
            c.set_correlation_id(cid);
            let _ = tx.send(());
        })))?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// The correlation id currently in effect.
    pub async fn last_correlation_id(&self) -> Result<Option<CorrelationId>, RatchetError> {
        self.inspect(|c, _| c.last_correlation_id()).await
    }

    /// Decode the events between two log indexes, inclusive.
    pub async fn event_history(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransitionEvent>, RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::History {
            from: LogIndex::new(from),
            to: LogIndex::new(to),
            reply: tx,
        })?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Stop the container; the next runtime reference reactivates.
    pub async fn deactivate(&self) -> Result<(), RatchetError> {
        let (tx, rx) = oneshot::channel();
        self.send(ContainerOp::Deactivate { reply: tx })?;
        rx.await.map_err(|_| self.unavailable())
    }
}
