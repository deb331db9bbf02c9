//! The transition coordinator: durable, idempotent, observable fires.
//!
//! # The Per-Fire Protocol
//!
//! 1. Callback guard - reject fires from inside callbacks.
//! 2. Dedupe - a recently seen key is acknowledged as a no-op.
//! 3. Engine fire - guards, exit/entry callbacks, state update.
//! 4. Event construction - symbolic names, monotonic timestamp,
//!    correlation, hierarchy metadata.
//! 5. Append - expected-index write with bounded backoff retries.
//! 6. Snapshot - every `snapshot_interval` transitions.
//! 7. Publish - best-effort stream emission.
//! 8. Timers - cancel the exited states', arm the entered states'.
//! 9. Dedupe insert.
//!
//! Cancellation is honored only before step 3. Once the engine has
//! mutated, the fire always runs through step 9: a half-persisted
//! transition is worse than a slow one.
//!
//! # Activation
//!
//! Replay loads the latest snapshot, routes newer events through the
//! upcast registry, applies `current := to_state` per event (callbacks do
//! NOT re-run), verifies log continuity, and rehydrates timers for the
//! final state's path. The log is the authority; activation rebuilds the
//! cache that is in-memory state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonotonicStamper, SystemClock};
use crate::config::{CoordinatorOptions, APPEND_RETRY_ATTEMPTS, APPEND_RETRY_BASE};
use crate::core::{ActorId, CorrelationId, FireArgs, State, Trigger};
use crate::dedupe::DedupeCache;
use crate::error::{ConfigurationError, RatchetError};
use crate::event::{
    SnapshotRecord, TransitionEvent, META_ANCESTORS_OF_DESTINATION, META_ANCESTORS_OF_SOURCE,
    META_REGION, META_SHARED_ANCESTOR_COUNT, META_TIMER, SNAPSHOT_LAYOUT_VERSION,
};
use crate::machine::{EngineFire, StateMachine};
use crate::store::{EventStore, LogIndex, StoreError, StoredEvent};
use crate::stream::StreamPublisher;
use crate::timer::{ReminderStore, TimeoutConfig, TimerFire, TimerRuntime};
use crate::upcast::{MigrationContext, Upcast, UpcastRegistry};

// =============================================================================
// Cancellation
// =============================================================================

/// Caller-held cancellation token, honored before the engine mutates.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Fire options and outcome
// =============================================================================

/// Per-fire inputs beyond the trigger itself.
#[derive(Default)]
pub struct FireOptions {
    /// Trigger parameters.
    pub args: FireArgs,
    /// Override the computed dedupe key.
    pub dedupe_key: Option<String>,
    /// Set for timer-synthesized fires: `(timer name, tick)`. Timer fires
    /// ignore cancellation and suffix their dedupe key with the tick.
    pub timer: Option<(String, u64)>,
    /// Cancellation token, honored before the engine mutates.
    pub cancel: Option<CancelToken>,
    /// Per-operation timeout, enforced by the actor handle while waiting
    /// for its turn. Once the engine has mutated the fire completes
    /// regardless; the caller may still observe the timeout.
    pub timeout: Option<std::time::Duration>,
}

impl FireOptions {
    /// Options carrying only arguments.
    pub fn with_args(args: FireArgs) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }
}

/// What a coordinated fire did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome<S> {
    /// A transition was performed and persisted.
    Transitioned {
        /// State before the fire.
        from: S,
        /// State after the fire.
        to: S,
        /// Log index of the appended event.
        index: LogIndex,
    },
    /// The dedupe key was recently seen; nothing happened.
    Duplicate,
    /// The trigger is configured as ignored; nothing was appended.
    Ignored {
        /// State that ignored the trigger.
        state: S,
    },
}

impl<S> FireOutcome<S> {
    /// True when an event was appended.
    pub fn transitioned(&self) -> bool {
        matches!(self, FireOutcome::Transitioned { .. })
    }
}

/// What activation recovered.
#[derive(Debug, Default)]
pub struct Activation {
    /// Events replayed (snapshot events excluded).
    pub replayed: usize,
    /// Region-tagged events, for the container host to apply; empty for
    /// plain actors.
    pub region_events: Vec<TransitionEvent>,
    /// Domain payload from the snapshot, for the definition to restore.
    pub domain_payload: Option<Value>,
}

type SnapshotPayloadFn = Box<dyn Fn() -> Option<Value> + Send + Sync>;
type AppendFailedFn = Box<dyn Fn(&StoreError) + Send + Sync>;

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Coordinator`].
///
/// ```ignore
/// let coordinator = Coordinator::builder(actor_id, machine, store)
///     .options(options)
///     .publisher(publisher)
///     .timeouts(timeouts, timer_sink)
///     .build();
/// ```
pub struct CoordinatorBuilder<S: State, T: Trigger> {
    actor: ActorId,
    machine: StateMachine<S, T>,
    store: Arc<dyn EventStore>,
    options: CoordinatorOptions,
    publisher: Option<Arc<dyn StreamPublisher>>,
    upcasts: Option<Arc<UpcastRegistry>>,
    clock: Arc<dyn Clock>,
    timeouts: Vec<TimeoutConfig<S, T>>,
    timer_sink: Option<mpsc::UnboundedSender<TimerFire<T>>>,
    reminders: Option<Arc<dyn ReminderStore>>,
    snapshot_payload: Option<SnapshotPayloadFn>,
    on_append_failed: Option<AppendFailedFn>,
}

impl<S: State, T: Trigger> CoordinatorBuilder<S, T> {
    /// Coordinator options; defaults otherwise.
    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Stream publisher for step 7.
    pub fn publisher(mut self, publisher: Arc<dyn StreamPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Upcast registry used during replay; the process default otherwise.
    pub fn upcasts(mut self, registry: Arc<UpcastRegistry>) -> Self {
        self.upcasts = Some(registry);
        self
    }

    /// Clock override for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Timeout configs and the mailbox sink expiries are posted to.
    pub fn timeouts(
        mut self,
        timeouts: Vec<TimeoutConfig<S, T>>,
        sink: mpsc::UnboundedSender<TimerFire<T>>,
    ) -> Self {
        self.timeouts = timeouts;
        self.timer_sink = Some(sink);
        self
    }

    /// Durable reminder store supplied by the host.
    pub fn reminders(mut self, store: Arc<dyn ReminderStore>) -> Self {
        self.reminders = Some(store);
        self
    }

    /// Supplier of the snapshot's domain payload.
    pub fn snapshot_payload(mut self, supplier: impl Fn() -> Option<Value> + Send + Sync + 'static) -> Self {
        self.snapshot_payload = Some(Box::new(supplier));
        self
    }

    /// Observer for append failures in auto-confirm mode.
    pub fn on_append_failed(mut self, observer: impl Fn(&StoreError) + Send + Sync + 'static) -> Self {
        self.on_append_failed = Some(Box::new(observer));
        self
    }

    /// Finish the build. Activation is a separate, failable step.
    pub fn build(self) -> Coordinator<S, T> {
        let sink = self.timer_sink.unwrap_or_else(|| {
            // No sink means no one can receive expiries; timers configured
            // this way die silently, so warn at build time.
            if !self.timeouts.is_empty() {
                warn!(actor = %self.actor, "timeouts configured without a timer sink");
            }
            mpsc::unbounded_channel().0
        });
        let timers = TimerRuntime::new(
            self.actor.clone(),
            self.timeouts,
            sink,
            self.reminders,
        );
        let dedupe = DedupeCache::with_capacity(self.options.max_dedupe_keys_in_memory);
        Coordinator {
            actor: self.actor,
            machine: self.machine,
            store: self.store,
            options: self.options,
            publisher: self.publisher,
            upcasts: self.upcasts.unwrap_or_else(UpcastRegistry::process_default),
            clock: self.clock,
            stamper: MonotonicStamper::new(),
            dedupe,
            timers,
            correlation: None,
            transition_count: 0,
            tail: LogIndex::NONE,
            last_snapshot_at: LogIndex::NONE,
            snapshot_payload: self.snapshot_payload,
            on_append_failed: self.on_append_failed,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Orchestrates fires for one actor's machine.
pub struct Coordinator<S: State, T: Trigger> {
    actor: ActorId,
    machine: StateMachine<S, T>,
    store: Arc<dyn EventStore>,
    options: CoordinatorOptions,
    publisher: Option<Arc<dyn StreamPublisher>>,
    upcasts: Arc<UpcastRegistry>,
    clock: Arc<dyn Clock>,
    stamper: MonotonicStamper,
    dedupe: DedupeCache,
    timers: TimerRuntime<S, T>,
    correlation: Option<CorrelationId>,
    transition_count: u64,
    tail: LogIndex,
    last_snapshot_at: LogIndex,
    snapshot_payload: Option<SnapshotPayloadFn>,
    on_append_failed: Option<AppendFailedFn>,
}

impl<S: State, T: Trigger> Coordinator<S, T> {
    /// Start building a coordinator.
    pub fn builder(
        actor: ActorId,
        machine: StateMachine<S, T>,
        store: Arc<dyn EventStore>,
    ) -> CoordinatorBuilder<S, T> {
        CoordinatorBuilder {
            actor,
            machine,
            store,
            options: CoordinatorOptions::default(),
            publisher: None,
            upcasts: None,
            clock: Arc::new(SystemClock),
            timeouts: Vec::new(),
            timer_sink: None,
            reminders: None,
            snapshot_payload: None,
            on_append_failed: None,
        }
    }

    /// The machine, for read-only queries.
    pub fn machine(&self) -> &StateMachine<S, T> {
        &self.machine
    }

    /// The actor this coordinator belongs to.
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Number of transitions applied since the log began.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Log index covered by the latest snapshot.
    pub fn snapshot_version(&self) -> u64 {
        self.last_snapshot_at.value()
    }

    /// Set the correlation id stamped on subsequent events.
    pub fn set_correlation_id(&mut self, cid: Option<CorrelationId>) {
        self.correlation = cid;
    }

    /// The correlation id currently in effect.
    pub fn last_correlation_id(&self) -> Option<CorrelationId> {
        self.correlation.clone()
    }

    // -------------------------------------------------------------------------
    // Activation / replay
    // -------------------------------------------------------------------------

    /// Validate configuration, replay the log, rehydrate timers.
    pub async fn activate(&mut self) -> Result<Activation, RatchetError> {
        self.machine.validate()?;
        self.validate_timeouts()?;

        let activation = self.load_and_apply().await?;

        for state in self.machine.current_path() {
            self.timers.rehydrate(state).await;
        }

        info!(
            actor = %self.actor,
            state = self.machine.current_state().name(),
            replayed = activation.replayed,
            transitions = self.transition_count,
            "actor activated"
        );
        Ok(activation)
    }

    /// Cancel timers and drop in-memory state. The log remains.
    pub fn deactivate(&mut self) {
        self.timers.shutdown();
        info!(actor = %self.actor, state = self.machine.current_state().name(), "actor deactivated");
    }

    fn validate_timeouts(&self) -> Result<(), ConfigurationError> {
        for config in self.timers.configs() {
            if !self.machine.is_configured(config.state) {
                return Err(ConfigurationError::TimeoutForUnknownState {
                    name: config.name.clone(),
                    state: config.state.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Load snapshot + events and rebuild in-memory state. Shared by
    /// activation and by rollback after persistence failure.
    async fn load_and_apply(&mut self) -> Result<Activation, RatchetError> {
        self.machine.jump_to(self.machine.initial_state());
        self.transition_count = 0;
        self.tail = LogIndex::NONE;
        self.last_snapshot_at = LogIndex::NONE;
        self.dedupe = DedupeCache::with_capacity(self.options.max_dedupe_keys_in_memory);
        self.stamper = MonotonicStamper::new();

        let log = self
            .store
            .load(&self.actor)
            .await
            .map_err(|source| RatchetError::PersistenceFailed { attempts: 1, source })?;

        let mut activation = Activation::default();

        if let Some((snapshot, at)) = log.snapshot {
            let state = snapshot.current_state_parsed::<S>().ok_or_else(|| {
                RatchetError::ReplayFailure {
                    index: at.value(),
                    from_state: snapshot.current_state.clone(),
                    to_state: snapshot.current_state.clone(),
                    trigger: String::new(),
                    timestamp: None,
                    reason: "snapshot names an unknown state".into(),
                }
            })?;
            self.machine.jump_to(state);
            self.transition_count = snapshot.transition_count;
            self.dedupe.restore(snapshot.dedupe_keys);
            self.correlation = snapshot.correlation_id;
            activation.domain_payload = snapshot.domain_payload;
            self.tail = at;
            self.last_snapshot_at = at;
        }

        for stored in log.events {
            self.apply_stored(stored, &mut activation)?;
        }
        Ok(activation)
    }

    fn apply_stored(
        &mut self,
        stored: StoredEvent,
        activation: &mut Activation,
    ) -> Result<(), RatchetError> {
        let payload = self.route_through_upcasts(&stored)?;
        let event: TransitionEvent =
            serde_json::from_value(payload).map_err(|err| RatchetError::ReplayFailure {
                index: stored.index.value(),
                from_state: String::new(),
                to_state: String::new(),
                trigger: String::new(),
                timestamp: None,
                reason: format!("undecodable event: {err}"),
            })?;

        let (index, ev_from, ev_to, ev_trigger, ev_timestamp) = (
            stored.index.value(),
            event.from_state.clone(),
            event.to_state.clone(),
            event.trigger.clone(),
            event.timestamp.to_rfc3339(),
        );
        let replay_failure = move |reason: String| RatchetError::ReplayFailure {
            index,
            from_state: ev_from.clone(),
            to_state: ev_to.clone(),
            trigger: ev_trigger.clone(),
            timestamp: Some(ev_timestamp.clone()),
            reason,
        };

        if T::from_name(&event.trigger).is_none() {
            return Err(replay_failure(format!("unknown trigger {}", event.trigger)));
        }

        self.stamper.observe(event.timestamp);
        self.tail = stored.index;
        self.transition_count += 1;
        if let Some(key) = &event.dedupe_key {
            self.dedupe.insert(key.clone());
        }
        if event.correlation_id.is_some() {
            self.correlation = event.correlation_id.clone();
        }

        // Region transitions belong to the container's sub-machines; the
        // host applies them after activation.
        if event.region().is_some() {
            activation.region_events.push(event);
            return Ok(());
        }

        let to = event
            .to_state_parsed::<S>()
            .ok_or_else(|| replay_failure(format!("unknown destination state {}", event.to_state)))?;
        let from = event
            .from_state_parsed::<S>()
            .ok_or_else(|| replay_failure(format!("unknown source state {}", event.from_state)))?;
        if from != self.machine.current_state() {
            return Err(replay_failure(format!(
                "log discontinuity: expected source {}, machine is in {}",
                event.from_state,
                self.machine.current_state().name()
            )));
        }

        self.machine.jump_to(to);
        activation.replayed += 1;
        Ok(())
    }

    fn route_through_upcasts(&self, stored: &StoredEvent) -> Result<Value, RatchetError> {
        let recorded = stored
            .payload
            .get("StateMachineVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(recorded), Some(current)) = (recorded, self.options.schema_version.clone())
        else {
            // Version-less events predate versioning; apply as written.
            return Ok(stored.payload.clone());
        };
        if recorded == current {
            return Ok(stored.payload.clone());
        }

        let ctx = MigrationContext::replay(self.actor.clone(), stored.index);
        let outcome = self
            .upcasts
            .upcast(&recorded, &current, stored.payload.clone(), &ctx)
            .map_err(|err| RatchetError::ReplayFailure {
                index: stored.index.value(),
                from_state: String::new(),
                to_state: String::new(),
                trigger: String::new(),
                timestamp: None,
                reason: format!("upcast {recorded} -> {current} failed: {err}"),
            })?;
        match outcome {
            Upcast::Done(value) => Ok(value),
            Upcast::NoPath if self.options.strict_replay => Err(RatchetError::NoUpcastPath {
                from: recorded,
                to: current,
            }),
            Upcast::NoPath => {
                debug!(actor = %self.actor, from = %recorded, to = %current,
                       "no upcast path, applying event as written");
                Ok(stored.payload.clone())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fire
    // -------------------------------------------------------------------------

    /// Run the full per-fire protocol.
    pub async fn fire(&mut self, trigger: T, opts: FireOptions) -> Result<FireOutcome<S>, RatchetError> {
        // Step 1: callback guard.
        if self.machine.reentrancy().is_set() {
            return Err(RatchetError::CallbackReentrancy {
                state: self.machine.current_state().name().to_string(),
                trigger: trigger.name().to_string(),
            });
        }

        // Cancellation checkpoint; timer fires carry no caller to cancel.
        if opts.timer.is_none() {
            if let Some(token) = &opts.cancel {
                if token.is_cancelled() {
                    return Err(RatchetError::Cancelled);
                }
            }
        }

        // Step 2: dedupe.
        let dedupe_key = self.dedupe_key_for(trigger, &opts);
        if self.options.enable_idempotency && self.dedupe.contains(&dedupe_key) {
            debug!(actor = %self.actor, trigger = trigger.name(), key = %dedupe_key,
                   "duplicate fire suppressed");
            return Ok(FireOutcome::Duplicate);
        }

        // Step 3: engine fire. From here on the fire is non-cancellable.
        let transition = match self.machine.fire(trigger, &opts.args)? {
            EngineFire::Ignored { state, .. } => return Ok(FireOutcome::Ignored { state }),
            EngineFire::Transitioned(t) => t,
        };

        // Step 4: event construction.
        let timestamp = self.stamper.next(self.clock.as_ref());
        let mut event = TransitionEvent::record(
            transition.source,
            transition.destination,
            trigger,
            timestamp,
        )
        .with_correlation(self.correlation.clone())
        .with_dedupe_key(dedupe_key.clone())
        .with_version(self.options.schema_version.clone());
        self.attach_hierarchy_metadata(&mut event, transition.source, transition.destination);
        if let Some((name, _)) = &opts.timer {
            event = event.with_metadata(META_TIMER, Value::from(name.clone()));
        }

        // Step 5: append.
        let index = self.append_committed(event.clone()).await?;
        self.transition_count += 1;

        // Step 6: snapshot.
        if self.snapshot_due() {
            self.write_snapshot().await;
        }

        // Step 7: publish.
        self.publish(&event).await;

        // Step 8: timers.
        self.rearm_timers(transition.source, transition.destination).await;

        // Step 9: dedupe insert.
        if self.options.enable_idempotency {
            self.dedupe.insert(dedupe_key);
        }

        debug!(
            actor = %self.actor,
            from = transition.source.name(),
            to = transition.destination.name(),
            trigger = trigger.name(),
            index = %index,
            "transition committed"
        );

        Ok(FireOutcome::Transitioned {
            from: transition.source,
            to: transition.destination,
            index,
        })
    }

    /// Append a region transition to the container's log.
    ///
    /// Region sub-machines transition in memory (the region set runs
    /// them); this records the fact with `metadata["region"]` so replay
    /// can restore the region.
    pub async fn record_region_transition(
        &mut self,
        region: &str,
        from: S,
        to: S,
        trigger: T,
    ) -> Result<LogIndex, RatchetError> {
        let timestamp = self.stamper.next(self.clock.as_ref());
        let event = TransitionEvent::record(from, to, trigger, timestamp)
            .with_correlation(self.correlation.clone())
            .with_version(self.options.schema_version.clone())
            .with_metadata(META_REGION, Value::from(region.to_string()));
        let index = self.append_committed(event.clone()).await?;
        self.transition_count += 1;
        if self.snapshot_due() {
            self.write_snapshot().await;
        }
        self.publish(&event).await;
        Ok(index)
    }

    fn dedupe_key_for(&self, trigger: T, opts: &FireOptions) -> String {
        let base = opts.dedupe_key.clone().unwrap_or_else(|| {
            format!(
                "{}:{}:{:016x}",
                self.actor,
                trigger.name(),
                opts.args.fingerprint()
            )
        });
        match &opts.timer {
            // The tick keeps repeating timers out of idempotent suppression.
            Some((_, tick)) => format!("{base}:{tick}"),
            None => base,
        }
    }

    fn attach_hierarchy_metadata(&self, event: &mut TransitionEvent, from: S, to: S) {
        let hierarchy = self.machine.hierarchy();
        if hierarchy.is_empty() {
            return;
        }
        let source_chain: Vec<Value> = hierarchy
            .ancestors(from)
            .into_iter()
            .map(|s| Value::from(s.name()))
            .collect();
        let dest_ancestors = hierarchy.ancestors(to);
        let dest_chain: Vec<Value> = dest_ancestors
            .iter()
            .map(|s| Value::from(s.name()))
            .collect();
        let source_set: HashSet<S> = hierarchy.ancestors(from).into_iter().collect();
        let shared = dest_ancestors.iter().filter(|s| source_set.contains(s)).count();

        event
            .metadata
            .insert(META_ANCESTORS_OF_SOURCE.into(), Value::from(source_chain));
        event
            .metadata
            .insert(META_ANCESTORS_OF_DESTINATION.into(), Value::from(dest_chain));
        event
            .metadata
            .insert(META_SHARED_ANCESTOR_COUNT.into(), Value::from(shared));
    }

    /// Append with bounded backoff. Conflicts never retry; transient
    /// failures do. Exhaustion behaves per mode: auto-confirm surfaces the
    /// failure to the observer and keeps going, strict mode rolls the
    /// engine back by replaying the log and fails the fire.
    async fn append_committed(&mut self, event: TransitionEvent) -> Result<LogIndex, RatchetError> {
        let mut attempt: u32 = 0;
        let failure = loop {
            attempt += 1;
            match self.store.append(&self.actor, &event, self.tail).await {
                Ok(index) => {
                    self.tail = index;
                    return Ok(index);
                }
                Err(err) if err.is_transient() && attempt < APPEND_RETRY_ATTEMPTS => {
                    let delay = APPEND_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(actor = %self.actor, attempt, error = %err, ?delay, "append retry");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break err,
            }
        };

        if self.options.auto_confirm_events {
            // The engine keeps its optimistic state; the log is behind.
            // The next activation replays the truth.
            error!(actor = %self.actor, attempts = attempt, error = %failure,
                   "append failed in auto-confirm mode, continuing unpersisted");
            if let Some(observer) = &self.on_append_failed {
                observer(&failure);
            }
            self.tail = self.tail.next();
            return Ok(self.tail);
        }

        error!(actor = %self.actor, attempts = attempt, error = %failure,
               "append failed, rolling back via replay");
        // Rollback must succeed; a second storage failure here leaves the
        // actor for the host to reactivate.
        if let Err(reload_err) = self.load_and_apply().await {
            error!(actor = %self.actor, error = %reload_err, "rollback replay failed");
        }
        Err(RatchetError::PersistenceFailed {
            attempts: attempt,
            source: failure,
        })
    }

    fn snapshot_due(&self) -> bool {
        self.options.enable_snapshots
            && self.options.snapshot_interval > 0
            && self.transition_count % self.options.snapshot_interval == 0
    }

    /// Write a snapshot now, regardless of the interval.
    pub async fn create_snapshot(&mut self) -> Result<u64, RatchetError> {
        self.write_snapshot().await;
        Ok(self.snapshot_version())
    }

    /// Snapshot failures are logged and skipped: the log is the
    /// authority, a snapshot only accelerates replay, and the next
    /// interval tries again.
    async fn write_snapshot(&mut self) {
        let snapshot = SnapshotRecord {
            version: SNAPSHOT_LAYOUT_VERSION,
            current_state: self.machine.current_state().name().to_string(),
            transition_count: self.transition_count,
            dedupe_keys: self.dedupe.export(),
            correlation_id: self.correlation.clone(),
            schema_version: self.options.schema_version.clone(),
            domain_payload: self.snapshot_payload.as_ref().and_then(|f| f()),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.write_snapshot(&self.actor, &snapshot, self.tail).await {
                Ok(()) => {
                    self.last_snapshot_at = self.tail;
                    debug!(actor = %self.actor, at = %self.tail, "snapshot written");
                    return;
                }
                Err(err) if err.is_transient() && attempt < APPEND_RETRY_ATTEMPTS => {
                    let delay = APPEND_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(actor = %self.actor, attempt, error = %err, ?delay, "snapshot retry");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(actor = %self.actor, attempts = attempt, error = %err,
                           "snapshot failed, continuing without");
                    return;
                }
            }
        }
    }

    async fn publish(&self, event: &TransitionEvent) {
        if !self.options.publish_to_stream {
            return;
        }
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(err) = publisher
            .publish(&self.options.stream_namespace, self.actor.as_str(), event)
            .await
        {
            // Best-effort: the log already has the event.
            warn!(actor = %self.actor, error = %err, "stream publish failed");
        }
    }

    async fn rearm_timers(&mut self, from: S, to: S) {
        let hierarchy = self.machine.hierarchy();
        let lca = hierarchy.lowest_common_ancestor(from, to);

        let mut exited = Vec::new();
        let mut cursor = Some(from);
        while let Some(state) = cursor {
            if Some(state) == lca {
                break;
            }
            exited.push(state);
            cursor = hierarchy.parent(state);
        }

        let mut entered = Vec::new();
        let mut cursor = hierarchy.parent(to);
        while let Some(state) = cursor {
            if Some(state) == lca {
                break;
            }
            entered.push(state);
            cursor = hierarchy.parent(state);
        }
        entered.reverse();
        entered.push(to);

        for state in exited {
            self.timers.on_state_exited(state).await;
        }
        for state in entered {
            self.timers.on_state_entered(state).await;
        }
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// Decode the events between two log indexes, inclusive.
    pub async fn event_history(
        &self,
        from: LogIndex,
        to: LogIndex,
    ) -> Result<Vec<TransitionEvent>, RatchetError> {
        let stored = self
            .store
            .read(&self.actor, from, to)
            .await
            .map_err(|source| RatchetError::PersistenceFailed { attempts: 1, source })?;
        stored
            .iter()
            .map(|e| {
                e.decode().map_err(|err| RatchetError::ReplayFailure {
                    index: e.index.value(),
                    from_state: String::new(),
                    to_state: String::new(),
                    trigger: String::new(),
                    timestamp: None,
                    reason: format!("undecodable event: {err}"),
                })
            })
            .collect()
    }

    /// The log tail index.
    pub fn tail(&self) -> LogIndex {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::InMemoryEventStore;
    use crate::stream::BroadcastPublisher;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Open,
        Closed,
        Locked,
    }

    impl State for Door {
        fn name(&self) -> &'static str {
            match self {
                Door::Open => "Open",
                Door::Closed => "Closed",
                Door::Locked => "Locked",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "Open" => Some(Door::Open),
                "Closed" => Some(Door::Closed),
                "Locked" => Some(Door::Locked),
                _ => None,
            }
        }

        fn all() -> &'static [Self] {
            &[Door::Open, Door::Closed, Door::Locked]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum DoorTrigger {
        Open,
        Close,
        Lock,
        Unlock,
    }

    impl Trigger for DoorTrigger {
        fn name(&self) -> &'static str {
            match self {
                DoorTrigger::Open => "Open",
                DoorTrigger::Close => "Close",
                DoorTrigger::Lock => "Lock",
                DoorTrigger::Unlock => "Unlock",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "Open" => Some(DoorTrigger::Open),
                "Close" => Some(DoorTrigger::Close),
                "Lock" => Some(DoorTrigger::Lock),
                "Unlock" => Some(DoorTrigger::Unlock),
                _ => None,
            }
        }
    }

    fn door_machine() -> StateMachine<Door, DoorTrigger> {
        let mut machine = StateMachine::new(Door::Closed);
        machine
            .configure(Door::Closed)
            .permit(DoorTrigger::Open, Door::Open)
            .permit_if1::<String>(DoorTrigger::Lock, Door::Locked, "code is non-empty", |c| {
                !c.is_empty()
            });
        machine
            .configure(Door::Open)
            .permit(DoorTrigger::Close, Door::Closed);
        machine
            .configure(Door::Locked)
            .permit_if1::<String>(DoorTrigger::Unlock, Door::Closed, "code matches", |c| {
                c == "s3cret"
            });
        machine
    }

    async fn activated(
        store: Arc<InMemoryEventStore>,
        options: CoordinatorOptions,
    ) -> Coordinator<Door, DoorTrigger> {
        let mut coordinator = Coordinator::builder(ActorId::new("door-1"), door_machine(), store)
            .options(options)
            .build();
        coordinator.activate().await.unwrap();
        coordinator
    }

    fn fire_args(args: FireArgs) -> FireOptions {
        FireOptions::with_args(args)
    }

    #[tokio::test]
    async fn test_fire_appends_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        let outcome = coordinator
            .fire(DoorTrigger::Open, FireOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FireOutcome::Transitioned { from: Door::Closed, to: Door::Open, index } if index == LogIndex::new(1)
        ));
        assert_eq!(coordinator.transition_count(), 1);

        let events = store.decoded_events(&ActorId::new("door-1"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_state, "Closed");
        assert_eq!(events[0].to_state, "Open");
        assert!(events[0].dedupe_key.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_fire_is_suppressed() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        for i in 0..3 {
            let outcome = coordinator
                .fire(DoorTrigger::Open, FireOptions::default())
                .await
                .unwrap();
            if i == 0 {
                assert!(outcome.transitioned());
            } else {
                assert_eq!(outcome, FireOutcome::Duplicate);
            }
        }
        assert_eq!(store.event_count(&ActorId::new("door-1")), 1);
        assert_eq!(coordinator.machine().current_state(), Door::Open);
        assert_eq!(coordinator.transition_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_disabled_appends_each_fire() {
        let store = Arc::new(InMemoryEventStore::new());
        let options = CoordinatorOptions {
            enable_idempotency: false,
            ..Default::default()
        };
        let mut coordinator = activated(store.clone(), options).await;

        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
        let second = coordinator.fire(DoorTrigger::Open, FireOptions::default()).await;
        // Second Open is invalid from Open, not a duplicate.
        assert!(matches!(second, Err(RatchetError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_invalid_transition_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        let err = coordinator
            .fire(DoorTrigger::Unlock, fire_args(FireArgs::one("wrong".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, RatchetError::InvalidTransition { .. }));
        assert_eq!(store.event_count(&ActorId::new("door-1")), 0);
        assert_eq!(coordinator.transition_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_restores_state_without_callbacks() {
        let store = Arc::new(InMemoryEventStore::new());
        {
            let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;
            coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
            coordinator.fire(DoorTrigger::Close, FireOptions::default()).await.unwrap();
            coordinator
                .fire(DoorTrigger::Lock, fire_args(FireArgs::one("s3cret".to_string())))
                .await
                .unwrap();
            coordinator.deactivate();
        }

        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;
        assert_eq!(coordinator.machine().current_state(), Door::Locked);
        assert_eq!(coordinator.transition_count(), 3);

        // Replay restored dedupe keys: the original Open fire stays a no-op.
        let outcome = coordinator
            .fire(DoorTrigger::Open, FireOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, FireOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_snapshot_written_at_interval() {
        let store = Arc::new(InMemoryEventStore::new());
        let options = CoordinatorOptions {
            snapshot_interval: 2,
            ..Default::default()
        };
        let mut coordinator = activated(store.clone(), options).await;

        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
        assert!(store.snapshot(&ActorId::new("door-1")).is_none());

        coordinator.fire(DoorTrigger::Close, FireOptions::default()).await.unwrap();
        let (snapshot, at) = store.snapshot(&ActorId::new("door-1")).unwrap();
        assert_eq!(snapshot.current_state, "Closed");
        assert_eq!(snapshot.transition_count, 2);
        assert_eq!(at, LogIndex::new(2));
        assert_eq!(coordinator.snapshot_version(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_plus_tail_equals_full_replay() {
        let store = Arc::new(InMemoryEventStore::new());
        let options = CoordinatorOptions {
            snapshot_interval: 2,
            ..Default::default()
        };
        {
            let mut coordinator = activated(store.clone(), options.clone()).await;
            coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
            coordinator.fire(DoorTrigger::Close, FireOptions::default()).await.unwrap();
            coordinator
                .fire(DoorTrigger::Lock, fire_args(FireArgs::one("s3cret".to_string())))
                .await
                .unwrap();
        }

        // Reactivation: snapshot at 2 + one tail event.
        let mut coordinator = activated(store.clone(), options).await;
        assert_eq!(coordinator.machine().current_state(), Door::Locked);
        assert_eq!(coordinator.transition_count(), 3);
        assert_eq!(coordinator.tail(), LogIndex::new(3));
        coordinator.deactivate();
    }

    #[tokio::test]
    async fn test_publish_emits_committed_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let publisher = BroadcastPublisher::new();
        let mut feed = publisher.subscribe();
        let options = CoordinatorOptions {
            publish_to_stream: true,
            stream_namespace: "Doors".into(),
            ..Default::default()
        };
        let mut coordinator =
            Coordinator::builder(ActorId::new("door-1"), door_machine(), store)
                .options(options)
                .publisher(Arc::new(publisher))
                .build();
        coordinator.activate().await.unwrap();

        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();

        let envelope = feed.recv().await.unwrap();
        assert_eq!(envelope.namespace, "Doors");
        assert_eq!(envelope.key, "door-1");
        assert_eq!(envelope.event.to_state, "Open");
    }

    #[tokio::test]
    async fn test_cancelled_before_engine_is_clean() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        let token = CancelToken::new();
        token.cancel();
        let err = coordinator
            .fire(
                DoorTrigger::Open,
                FireOptions {
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RatchetError::Cancelled));
        assert_eq!(coordinator.machine().current_state(), Door::Closed);
        assert_eq!(store.event_count(&ActorId::new("door-1")), 0);
    }

    #[tokio::test]
    async fn test_timer_fire_ignores_cancellation_and_keys_on_tick() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        let token = CancelToken::new();
        token.cancel();
        let outcome = coordinator
            .fire(
                DoorTrigger::Open,
                FireOptions {
                    timer: Some(("auto-open".into(), 1)),
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.transitioned());

        let events = store.decoded_events(&ActorId::new("door-1"));
        let key = events[0].dedupe_key.as_deref().unwrap();
        assert!(key.ends_with(":1"), "tick missing from key: {key}");
        assert_eq!(
            events[0].metadata.get(META_TIMER),
            Some(&Value::from("auto-open"))
        );
    }

    #[tokio::test]
    async fn test_correlation_id_travels_on_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        coordinator.set_correlation_id(Some(CorrelationId::from("req-7")));
        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();

        let events = store.decoded_events(&ActorId::new("door-1"));
        assert_eq!(events[0].correlation_id, Some(CorrelationId::from("req-7")));
        assert_eq!(coordinator.last_correlation_id(), Some(CorrelationId::from("req-7")));
    }

    #[tokio::test]
    async fn test_event_history_window() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
        coordinator.fire(DoorTrigger::Close, FireOptions::default()).await.unwrap();
        coordinator
            .fire(DoorTrigger::Lock, fire_args(FireArgs::one("s3cret".to_string())))
            .await
            .unwrap();

        let window = coordinator
            .event_history(LogIndex::new(2), LogIndex::new(3))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].trigger, "Close");
        assert_eq!(window[1].trigger, "Lock");
    }

    #[tokio::test]
    async fn test_timestamps_monotonic_across_fires() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut coordinator = activated(store.clone(), CoordinatorOptions::default()).await;

        coordinator.fire(DoorTrigger::Open, FireOptions::default()).await.unwrap();
        coordinator.fire(DoorTrigger::Close, FireOptions::default()).await.unwrap();
        coordinator.fire(DoorTrigger::Open, FireOptions {
            dedupe_key: Some("second-open".into()),
            ..Default::default()
        }).await.unwrap();

        let events = store.decoded_events(&ActorId::new("door-1"));
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
            assert_eq!(pair[0].to_state, pair[1].from_state);
        }
    }

    #[tokio::test]
    async fn test_corrupt_log_fails_activation() {
        let store = Arc::new(InMemoryEventStore::new());
        // Write a discontinuous log by hand: Closed->Open then Locked->Open.
        let actor = ActorId::new("door-1");
        let e1 = TransitionEvent::record(Door::Closed, Door::Open, DoorTrigger::Open, chrono::Utc::now());
        let i1 = store.append(&actor, &e1, LogIndex::NONE).await.unwrap();
        let e2 = TransitionEvent::record(Door::Locked, Door::Open, DoorTrigger::Open, chrono::Utc::now());
        store.append(&actor, &e2, i1).await.unwrap();

        let mut coordinator =
            Coordinator::builder(actor, door_machine(), store).build();
        let err = coordinator.activate().await.unwrap_err();
        match err {
            RatchetError::ReplayFailure { index, reason, .. } => {
                assert_eq!(index, 2);
                assert!(reason.contains("discontinuity"), "{reason}");
            }
            other => panic!("expected ReplayFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_strict_replay_requires_upcast_path() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = ActorId::new("door-1");
        let old = TransitionEvent::record(Door::Closed, Door::Open, DoorTrigger::Open, chrono::Utc::now())
            .with_version(Some("v1".into()));
        store.append(&actor, &old, LogIndex::NONE).await.unwrap();

        let options = CoordinatorOptions {
            schema_version: Some("v2".into()),
            strict_replay: true,
            ..Default::default()
        };
        let registry = Arc::new(UpcastRegistry::new());
        let mut coordinator = Coordinator::builder(actor.clone(), door_machine(), store.clone())
            .options(options.clone())
            .upcasts(registry.clone())
            .build();
        let err = coordinator.activate().await.unwrap_err();
        assert!(matches!(err, RatchetError::NoUpcastPath { .. }));

        // With a registered path activation succeeds.
        registry.register_fn("v1", "v2", |mut payload, _| {
            payload["StateMachineVersion"] = Value::from("v2");
            Ok(payload)
        });
        let mut coordinator = Coordinator::builder(actor, door_machine(), store)
            .options(options)
            .upcasts(registry)
            .build();
        coordinator.activate().await.unwrap();
        assert_eq!(coordinator.machine().current_state(), Door::Open);
    }

    #[tokio::test]
    async fn test_region_events_are_skipped_by_primary_replay() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = ActorId::new("house-1");
        let e1 = TransitionEvent::record(Door::Closed, Door::Open, DoorTrigger::Open, chrono::Utc::now());
        let i1 = store.append(&actor, &e1, LogIndex::NONE).await.unwrap();
        let regional =
            TransitionEvent::record(Door::Open, Door::Locked, DoorTrigger::Lock, chrono::Utc::now())
                .with_metadata(META_REGION, Value::from("Security"));
        store.append(&actor, &regional, i1).await.unwrap();

        let mut coordinator = Coordinator::builder(actor, door_machine(), store).build();
        let activation = coordinator.activate().await.unwrap();
        // Primary stayed where its own events put it.
        assert_eq!(coordinator.machine().current_state(), Door::Open);
        assert_eq!(activation.region_events.len(), 1);
        assert_eq!(activation.region_events[0].region(), Some("Security"));
    }
}
