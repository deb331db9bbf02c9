//! State-scoped timeouts: ephemeral timers and durable reminders.
//!
//! Entering a state arms every timeout configured for it; leaving the
//! state cancels them. Expiry does not touch the engine directly - it
//! posts a [`TimerFire`] into the owning actor's mailbox, so synthesized
//! fires run the full coordinator protocol under the same single-writer
//! discipline as caller fires.
//!
//! # Modes
//!
//! - **Ephemeral** timers are tokio tasks. Cheap, precise, lost on
//!   deactivation. Good for sub-minute durations.
//! - **Durable** reminders are registered through the host's
//!   [`ReminderStore`] and survive deactivation and relocation; the host
//!   delivers them by firing the target trigger on the (re)activated
//!   actor. Good for long durations. The boundary is the caller's choice.
//!
//! # Dedupe interaction
//!
//! Every expiry carries the timer's monotonic `tick`. The coordinator
//! appends `:<tick>` to the dedupe key of a timer-synthesized fire, so a
//! repeating timer is not idempotently suppressed after its first round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{ActorId, State, Trigger};

/// Where a timeout lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutMode {
    /// In-memory tokio task, lost on deactivation.
    Ephemeral,
    /// Registered with the host's reminder service, survives deactivation.
    Durable,
}

/// Whether a timeout fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutRepeat {
    /// Single fire after the duration.
    Once,
    /// Fire every `duration` until the state is exited.
    Repeat,
}

/// One state-scoped timeout.
///
/// # Example
///
/// ```ignore
/// TimeoutConfig::ephemeral(Device::Processing, Duration::from_secs(2), DeviceTrigger::Timeout)
///     .named("processing-deadline")
/// ```
#[derive(Debug, Clone)]
pub struct TimeoutConfig<S, T> {
    /// State the timeout is scoped to.
    pub state: S,
    /// Delay before (each) fire.
    pub duration: Duration,
    /// Trigger synthesized on expiry.
    pub trigger: T,
    /// Ephemeral or durable.
    pub mode: TimeoutMode,
    /// Once or repeating.
    pub repeat: TimeoutRepeat,
    /// Handle name, unique per state.
    pub name: String,
}

impl<S: State, T: Trigger> TimeoutConfig<S, T> {
    /// An ephemeral one-shot timeout named after its state and trigger.
    pub fn ephemeral(state: S, duration: Duration, trigger: T) -> Self {
        Self {
            name: format!("{}:{}", state.name(), trigger.name()),
            state,
            duration,
            trigger,
            mode: TimeoutMode::Ephemeral,
            repeat: TimeoutRepeat::Once,
        }
    }

    /// A durable one-shot timeout named after its state and trigger.
    pub fn durable(state: S, duration: Duration, trigger: T) -> Self {
        Self {
            mode: TimeoutMode::Durable,
            ..Self::ephemeral(state, duration, trigger)
        }
    }

    /// Make the timeout repeat with period `duration`.
    pub fn repeating(mut self) -> Self {
        self.repeat = TimeoutRepeat::Repeat;
        self
    }

    /// Override the handle name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// An expiry, posted into the owning actor's mailbox.
#[derive(Debug, Clone)]
pub struct TimerFire<T> {
    /// The trigger to synthesize.
    pub trigger: T,
    /// Name of the timer that expired.
    pub timer_name: String,
    /// Monotonic firing count of this timer instance, starting at 1.
    pub tick: u64,
}

// =============================================================================
// Reminder Store
// =============================================================================

/// A durable reminder as the host persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRequest {
    /// Handle name, unique per actor.
    pub name: String,
    /// Delay before the first fire.
    pub due: Duration,
    /// Repeat period, `None` for one-shot.
    pub period: Option<Duration>,
    /// Symbolic name of the trigger to synthesize.
    pub trigger: String,
    /// Symbolic name of the state the reminder is scoped to.
    pub state: String,
}

/// Host contract for reminders that outlive the actor's activation.
///
/// The host is responsible for delivery: when a reminder comes due it
/// fires the recorded trigger on the actor (activating it first if
/// needed). Registration must be idempotent per `(actor, name)`.
#[async_trait]
pub trait ReminderStore: Send + Sync + 'static {
    /// Register or refresh a reminder.
    async fn register(&self, actor: &ActorId, reminder: &ReminderRequest) -> anyhow::Result<()>;

    /// Request cancellation of a reminder.
    async fn unregister(&self, actor: &ActorId, name: &str) -> anyhow::Result<()>;

    /// Reminders currently registered for an actor.
    async fn list(&self, actor: &ActorId) -> anyhow::Result<Vec<ReminderRequest>>;
}

// =============================================================================
// Timer Runtime
// =============================================================================

struct ActiveTimer {
    state_name: &'static str,
    handle: JoinHandle<()>,
}

/// Arms and cancels the timeouts of one actor.
///
/// Owned by the actor task; every method runs under its single-writer
/// discipline. Expiries flow through `sink` back into the mailbox.
pub struct TimerRuntime<S: State, T: Trigger> {
    actor: ActorId,
    by_state: HashMap<S, Vec<TimeoutConfig<S, T>>>,
    sink: mpsc::UnboundedSender<TimerFire<T>>,
    active: HashMap<String, ActiveTimer>,
    reminders: Option<Arc<dyn ReminderStore>>,
}

impl<S: State, T: Trigger> TimerRuntime<S, T> {
    /// Build a runtime from the machine definition's timeout configs.
    pub fn new(
        actor: ActorId,
        configs: Vec<TimeoutConfig<S, T>>,
        sink: mpsc::UnboundedSender<TimerFire<T>>,
        reminders: Option<Arc<dyn ReminderStore>>,
    ) -> Self {
        let mut by_state: HashMap<S, Vec<TimeoutConfig<S, T>>> = HashMap::new();
        for config in configs {
            by_state.entry(config.state).or_default().push(config);
        }
        Self {
            actor,
            by_state,
            sink,
            active: HashMap::new(),
            reminders,
        }
    }

    /// Every configured timeout.
    pub fn configs(&self) -> impl Iterator<Item = &TimeoutConfig<S, T>> {
        self.by_state.values().flatten()
    }

    /// Names of currently armed ephemeral timers.
    pub fn armed(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Arm every timeout scoped to `state`.
    pub async fn on_state_entered(&mut self, state: S) {
        let Some(configs) = self.by_state.get(&state) else {
            return;
        };
        for config in configs.clone() {
            match config.mode {
                TimeoutMode::Ephemeral => self.spawn_ephemeral(&config),
                TimeoutMode::Durable => self.register_durable(&config).await,
            }
        }
    }

    /// Cancel every timeout scoped to `state`.
    ///
    /// Ephemeral cancellation is synchronous (the task is aborted before
    /// this returns); durable cancellation is a request to the host.
    pub async fn on_state_exited(&mut self, state: S) {
        let state_name = state.name();
        let names: Vec<String> = self
            .active
            .iter()
            .filter(|(_, t)| t.state_name == state_name)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(timer) = self.active.remove(&name) {
                timer.handle.abort();
                debug!(actor = %self.actor, timer = %name, "ephemeral timer cancelled");
            }
        }

        if let Some(store) = &self.reminders {
            if let Some(configs) = self.by_state.get(&state) {
                for config in configs {
                    if config.mode == TimeoutMode::Durable {
                        if let Err(err) = store.unregister(&self.actor, &config.name).await {
                            warn!(actor = %self.actor, timer = %config.name, error = %err,
                                  "durable reminder unregister failed");
                        }
                    }
                }
            }
        }
    }

    /// Re-arm timeouts for the state replay landed on.
    ///
    /// Ephemeral timers restart from zero (the previous activation's tasks
    /// died with it); durable reminders are re-registered, which the store
    /// treats as a refresh.
    pub async fn rehydrate(&mut self, state: S) {
        self.on_state_entered(state).await;
    }

    /// Drop every armed timer without firing. Used at deactivation.
    pub fn shutdown(&mut self) {
        for (name, timer) in self.active.drain() {
            timer.handle.abort();
            debug!(actor = %self.actor, timer = %name, "ephemeral timer dropped at deactivation");
        }
    }

    fn spawn_ephemeral(&mut self, config: &TimeoutConfig<S, T>) {
        // Re-entering a state re-arms from zero.
        if let Some(existing) = self.active.remove(&config.name) {
            existing.handle.abort();
        }

        let sink = self.sink.clone();
        let trigger = config.trigger;
        let name = config.name.clone();
        let duration = config.duration;
        let repeat = config.repeat;
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            loop {
                tokio::time::sleep(duration).await;
                tick += 1;
                let fire = TimerFire {
                    trigger,
                    timer_name: task_name.clone(),
                    tick,
                };
                if sink.send(fire).is_err() {
                    // Mailbox gone: the actor deactivated.
                    return;
                }
                if repeat == TimeoutRepeat::Once {
                    return;
                }
            }
        });

        debug!(actor = %self.actor, timer = %name, ?duration, "ephemeral timer armed");
        self.active.insert(
            name,
            ActiveTimer {
                state_name: config.state.name(),
                handle,
            },
        );
    }

    async fn register_durable(&mut self, config: &TimeoutConfig<S, T>) {
        let Some(store) = &self.reminders else {
            warn!(actor = %self.actor, timer = %config.name,
                  "durable timeout configured but no reminder store; skipping");
            return;
        };
        let request = ReminderRequest {
            name: config.name.clone(),
            due: config.duration,
            period: (config.repeat == TimeoutRepeat::Repeat).then_some(config.duration),
            trigger: config.trigger.name().to_string(),
            state: config.state.name().to_string(),
        };
        match store.register(&self.actor, &request).await {
            Ok(()) => debug!(actor = %self.actor, timer = %config.name, "durable reminder registered"),
            Err(err) => warn!(actor = %self.actor, timer = %config.name, error = %err,
                              "durable reminder registration failed"),
        }
    }
}

impl<S: State, T: Trigger> Drop for TimerRuntime<S, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Idle,
        Processing,
    }

    impl State for Phase {
        fn name(&self) -> &'static str {
            match self {
                Phase::Idle => "Idle",
                Phase::Processing => "Processing",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "Idle" => Some(Phase::Idle),
                "Processing" => Some(Phase::Processing),
                _ => None,
            }
        }

        fn all() -> &'static [Self] {
            &[Phase::Idle, Phase::Processing]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Tick {
        Timeout,
    }

    impl Trigger for Tick {
        fn name(&self) -> &'static str {
            "Timeout"
        }

        fn from_name(name: &str) -> Option<Self> {
            (name == "Timeout").then_some(Tick::Timeout)
        }
    }

    fn runtime_with(
        configs: Vec<TimeoutConfig<Phase, Tick>>,
        reminders: Option<Arc<dyn ReminderStore>>,
    ) -> (TimerRuntime<Phase, Tick>, mpsc::UnboundedReceiver<TimerFire<Tick>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerRuntime::new(ActorId::new("t-1"), configs, tx, reminders), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timer_fires_once() {
        let config = TimeoutConfig::ephemeral(Phase::Processing, Duration::from_secs(2), Tick::Timeout);
        let (mut timers, mut rx) = runtime_with(vec![config], None);

        timers.on_state_entered(Phase::Processing).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let fire = rx.try_recv().unwrap();
        assert_eq!(fire.trigger, Tick::Timeout);
        assert_eq!(fire.tick, 1);
        assert_eq!(fire.timer_name, "Processing:Timeout");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err(), "one-shot fired twice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_counts_ticks() {
        let config = TimeoutConfig::ephemeral(Phase::Processing, Duration::from_secs(1), Tick::Timeout)
            .repeating();
        let (mut timers, mut rx) = runtime_with(vec![config], None);

        timers.on_state_entered(Phase::Processing).await;
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let ticks: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|f| f.tick).collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_before_expiry() {
        let config = TimeoutConfig::ephemeral(Phase::Processing, Duration::from_secs(2), Tick::Timeout);
        let (mut timers, mut rx) = runtime_with(vec![config], None);

        timers.on_state_entered(Phase::Processing).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        timers.on_state_exited(Phase::Processing).await;
        assert!(timers.armed().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "cancelled timer fired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_rearms_from_zero() {
        let config = TimeoutConfig::ephemeral(Phase::Processing, Duration::from_secs(2), Tick::Timeout);
        let (mut timers, mut rx) = runtime_with(vec![config], None);

        timers.on_state_entered(Phase::Processing).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Re-enter: the 1.5s of elapsed wait must not carry over.
        timers.on_state_entered(Phase::Processing).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err(), "timer fired with carried-over elapsed time");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.try_recv().unwrap().tick, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_without_configs_are_noops() {
        let (mut timers, mut rx) = runtime_with(vec![], None);
        timers.on_state_entered(Phase::Idle).await;
        timers.on_state_exited(Phase::Idle).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    // =========================================================================
    // Durable reminders
    // =========================================================================

    #[derive(Default)]
    struct RecordingReminderStore {
        calls: Mutex<Vec<String>>,
        registered: Mutex<HashMap<String, ReminderRequest>>,
    }

    #[async_trait]
    impl ReminderStore for RecordingReminderStore {
        async fn register(&self, actor: &ActorId, reminder: &ReminderRequest) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("register:{}:{}", actor, reminder.name));
            self.registered
                .lock()
                .unwrap()
                .insert(reminder.name.clone(), reminder.clone());
            Ok(())
        }

        async fn unregister(&self, actor: &ActorId, name: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unregister:{}:{}", actor, name));
            self.registered.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list(&self, _actor: &ActorId) -> anyhow::Result<Vec<ReminderRequest>> {
            Ok(self.registered.lock().unwrap().values().cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_durable_registers_and_unregisters() {
        let store = Arc::new(RecordingReminderStore::default());
        let config = TimeoutConfig::durable(Phase::Processing, Duration::from_secs(3600), Tick::Timeout)
            .named("escalation");
        let (mut timers, _rx) = runtime_with(vec![config], Some(store.clone()));

        timers.on_state_entered(Phase::Processing).await;
        let registered = store.list(&ActorId::new("t-1")).await.unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].trigger, "Timeout");
        assert_eq!(registered[0].state, "Processing");
        assert_eq!(registered[0].period, None);

        timers.on_state_exited(Phase::Processing).await;
        assert!(store.list(&ActorId::new("t-1")).await.unwrap().is_empty());
        assert_eq!(
            store.calls.lock().unwrap().clone(),
            vec![
                "register:t-1:escalation".to_string(),
                "unregister:t-1:escalation".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_rehydrate_reregisters_durable() {
        let store = Arc::new(RecordingReminderStore::default());
        let config = TimeoutConfig::durable(Phase::Processing, Duration::from_secs(600), Tick::Timeout)
            .repeating();
        let (mut timers, _rx) = runtime_with(vec![config], Some(store.clone()));

        timers.rehydrate(Phase::Processing).await;
        let registered = store.list(&ActorId::new("t-1")).await.unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].period, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_durable_without_store_is_skipped() {
        let config = TimeoutConfig::durable(Phase::Processing, Duration::from_secs(60), Tick::Timeout);
        let (mut timers, mut rx) = runtime_with(vec![config], None);
        timers.on_state_entered(Phase::Processing).await;
        assert!(timers.armed().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
