//! Orthogonal regions: independent machines co-located in one actor.
//!
//! A container actor owns a primary machine (run by its coordinator, so
//! primary transitions are persisted like any other) plus a [`RegionSet`]
//! of named regions, each a fully independent engine with its own initial
//! state. Triggers route by an explicit map; unmapped triggers broadcast
//! to every region. Regions are independent - one region's failure never
//! aborts the others; failures are reported in aggregate.
//!
//! # Reactions
//!
//! The `on_region_changed` hook turns one region's transition into fires
//! in others (presence flips to away, security arms, climate drops to
//! eco). Reaction waves are bounded: a cascade deeper than the configured
//! limit is cut off with `CascadeLimitExceeded` rather than looping
//! forever.
//!
//! All machines in a container share one reentrancy flag: a callback in
//! any of them cannot synchronously fire another.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::{debug, warn};

use crate::config::DEFAULT_CASCADE_LIMIT;
use crate::core::{FireArgs, State, Trigger};
use crate::error::{ConfigurationError, RatchetError};
use crate::machine::{EngineFire, ReentrancyFlag, StateMachine};

/// One region's completed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionChange<S, T> {
    /// Region that transitioned.
    pub region: String,
    /// State it left.
    pub from: S,
    /// State it entered.
    pub to: S,
    /// Trigger that caused it.
    pub trigger: T,
}

/// A reaction requested by the `on_region_changed` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReaction<T> {
    /// Region to fire into.
    pub region: String,
    /// Trigger to fire.
    pub trigger: T,
}

impl<T> RegionReaction<T> {
    /// Shorthand constructor.
    pub fn fire(region: impl Into<String>, trigger: T) -> Self {
        Self {
            region: region.into(),
            trigger,
        }
    }
}

/// Everything one routed fire did across the regions.
#[derive(Debug)]
pub struct RegionFireReport<S, T> {
    /// Region transitions in commit order, reactions included.
    pub changes: Vec<RegionChange<S, T>>,
    /// Per-region failures; the rest of the fire proceeded.
    pub failures: Vec<(String, RatchetError)>,
    /// Number of reaction waves processed (1 = no reactions fired).
    pub cascade_depth: usize,
}

impl<S, T> RegionFireReport<S, T> {
    fn empty() -> Self {
        Self {
            changes: Vec::new(),
            failures: Vec::new(),
            cascade_depth: 0,
        }
    }
}

/// Composite-state summary across a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSummary<S> {
    /// The primary machine's state.
    pub primary: S,
    /// The derived composite state.
    pub composite: S,
    /// Every region's state, by name.
    pub regions: BTreeMap<String, S>,
}

impl<S: State> fmt::Display for StateSummary<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "composite={}", self.composite.name())?;
        write!(f, " primary={}", self.primary.name())?;
        for (name, state) in &self.regions {
            write!(f, " {name}={}", state.name())?;
        }
        Ok(())
    }
}

type ReactionHook<S, T> = Box<dyn FnMut(&RegionChange<S, T>) -> Vec<RegionReaction<T>> + Send + Sync>;
type CompositeResolver<S> = Box<dyn Fn(S, &BTreeMap<String, S>) -> S + Send + Sync>;

/// Named orthogonal regions with routing, reactions, and composition.
pub struct RegionSet<S: State, T: Trigger> {
    regions: BTreeMap<String, StateMachine<S, T>>,
    routes: HashMap<T, HashSet<String>>,
    on_region_changed: Option<ReactionHook<S, T>>,
    composite: Option<CompositeResolver<S>>,
    cascade_limit: usize,
    reentrancy: ReentrancyFlag,
}

impl<S: State, T: Trigger> RegionSet<S, T> {
    /// Empty set sharing the container's reentrancy flag.
    pub fn new(reentrancy: ReentrancyFlag) -> Self {
        Self {
            regions: BTreeMap::new(),
            routes: HashMap::new(),
            on_region_changed: None,
            composite: None,
            cascade_limit: DEFAULT_CASCADE_LIMIT,
            reentrancy,
        }
    }

    /// Register a region. Its machine is re-flagged to share the
    /// container's reentrancy flag.
    pub fn add_region(
        &mut self,
        name: impl Into<String>,
        machine: StateMachine<S, T>,
    ) -> Result<(), ConfigurationError> {
        let name = name.into();
        if self.regions.contains_key(&name) {
            return Err(ConfigurationError::DuplicateRegion { region: name });
        }
        let machine = machine.with_reentrancy(self.reentrancy.clone());
        self.regions.insert(name, machine);
        Ok(())
    }

    /// Route `trigger` to a specific set of regions. Unmapped triggers
    /// broadcast to every region.
    pub fn route(&mut self, trigger: T, regions: impl IntoIterator<Item = impl Into<String>>) {
        self.routes
            .entry(trigger)
            .or_default()
            .extend(regions.into_iter().map(Into::into));
    }

    /// Hook invoked after each region transition; its reactions fire in
    /// the next cascade wave.
    pub fn on_region_changed(
        &mut self,
        hook: impl FnMut(&RegionChange<S, T>) -> Vec<RegionReaction<T>> + Send + Sync + 'static,
    ) {
        self.on_region_changed = Some(Box::new(hook));
    }

    /// Override composite-state derivation (default: the primary's
    /// state). Receives the primary state and every region state.
    pub fn composite_resolver(
        &mut self,
        resolver: impl Fn(S, &BTreeMap<String, S>) -> S + Send + Sync + 'static,
    ) {
        self.composite = Some(Box::new(resolver));
    }

    /// Override the cascade depth bound.
    pub fn cascade_limit(&mut self, limit: usize) {
        self.cascade_limit = limit;
    }

    /// Validate every region machine.
    pub fn validate(&mut self) -> Result<(), ConfigurationError> {
        for machine in self.regions.values_mut() {
            machine.validate()?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// One region's current state.
    pub fn region_state(&self, name: &str) -> Option<S> {
        self.regions.get(name).map(StateMachine::current_state)
    }

    /// Every region's current state.
    pub fn all_region_states(&self) -> BTreeMap<String, S> {
        self.regions
            .iter()
            .map(|(name, machine)| (name.clone(), machine.current_state()))
            .collect()
    }

    /// Registered region names.
    pub fn region_names(&self) -> Vec<String> {
        self.regions.keys().cloned().collect()
    }

    /// True when no regions are registered.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The derived composite state, given the primary's.
    pub fn composite_state(&self, primary: S) -> S {
        match &self.composite {
            Some(resolver) => resolver(primary, &self.all_region_states()),
            None => primary,
        }
    }

    /// Full summary of the container, given the primary's state.
    pub fn state_summary(&self, primary: S) -> StateSummary<S> {
        StateSummary {
            primary,
            composite: self.composite_state(primary),
            regions: self.all_region_states(),
        }
    }

    /// Set a region's state without callbacks, for replay.
    pub fn restore_region(&mut self, name: &str, state: S) -> Result<(), RatchetError> {
        let machine = self
            .regions
            .get_mut(name)
            .ok_or_else(|| RatchetError::UnknownRegion {
                region: name.to_string(),
            })?;
        machine.jump_to(state);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fire
    // -------------------------------------------------------------------------

    /// Fire `trigger` at the routed regions, then run reaction cascades
    /// to quiescence.
    pub fn fire_regions(
        &mut self,
        trigger: T,
        args: &FireArgs,
    ) -> Result<RegionFireReport<S, T>, RatchetError> {
        let mut report = RegionFireReport::empty();

        let targets: Vec<String> = match self.routes.get(&trigger) {
            Some(named) => self
                .regions
                .keys()
                .filter(|n| named.contains(*n))
                .cloned()
                .collect(),
            None => self.regions.keys().cloned().collect(),
        };

        let mut wave = VecDeque::new();
        for name in targets {
            if let Some(change) = self.fire_region_once(&name, trigger, args, &mut report.failures) {
                wave.push_back(change);
            }
        }

        self.run_cascades(wave, &mut report)?;
        Ok(report)
    }

    /// Fire `trigger` into one named region, then run reaction cascades.
    pub fn fire_in_region(
        &mut self,
        name: &str,
        trigger: T,
        args: &FireArgs,
    ) -> Result<RegionFireReport<S, T>, RatchetError> {
        if !self.regions.contains_key(name) {
            return Err(RatchetError::UnknownRegion {
                region: name.to_string(),
            });
        }
        let mut report = RegionFireReport::empty();
        let mut wave = VecDeque::new();
        if let Some(change) = self.fire_region_once(name, trigger, args, &mut report.failures) {
            wave.push_back(change);
        }
        self.run_cascades(wave, &mut report)?;
        Ok(report)
    }

    /// One region fire, failure recorded rather than propagated.
    fn fire_region_once(
        &mut self,
        name: &str,
        trigger: T,
        args: &FireArgs,
        failures: &mut Vec<(String, RatchetError)>,
    ) -> Option<RegionChange<S, T>> {
        let machine = self.regions.get_mut(name)?;
        if !machine.can_fire(trigger, args) {
            return None;
        }
        match machine.fire(trigger, args) {
            Ok(EngineFire::Transitioned(t)) => Some(RegionChange {
                region: name.to_string(),
                from: t.source,
                to: t.destination,
                trigger,
            }),
            Ok(EngineFire::Ignored { .. }) => None,
            Err(err) => {
                warn!(region = name, trigger = trigger.name(), error = %err, "region fire failed");
                failures.push((name.to_string(), err));
                None
            }
        }
    }

    /// Process reaction waves breadth-first until quiescence or the depth
    /// bound. Each wave's changes are appended to the report; the wave's
    /// reactions form the next wave.
    fn run_cascades(
        &mut self,
        mut wave: VecDeque<RegionChange<S, T>>,
        report: &mut RegionFireReport<S, T>,
    ) -> Result<(), RatchetError> {
        while !wave.is_empty() {
            report.cascade_depth += 1;
            if report.cascade_depth > self.cascade_limit {
                return Err(RatchetError::CascadeLimitExceeded {
                    depth: report.cascade_depth,
                    limit: self.cascade_limit,
                });
            }

            let mut reactions: Vec<RegionReaction<T>> = Vec::new();
            for change in wave.drain(..) {
                debug!(
                    region = %change.region,
                    from = change.from.name(),
                    to = change.to.name(),
                    "region transitioned"
                );
                if let Some(hook) = &mut self.on_region_changed {
                    reactions.extend(hook(&change));
                }
                report.changes.push(change);
            }

            let mut next = VecDeque::new();
            for reaction in reactions {
                if !self.regions.contains_key(&reaction.region) {
                    report.failures.push((
                        reaction.region.clone(),
                        RatchetError::UnknownRegion {
                            region: reaction.region,
                        },
                    ));
                    continue;
                }
                if let Some(change) = self.fire_region_once(
                    &reaction.region,
                    reaction.trigger,
                    &FireArgs::none(),
                    &mut report.failures,
                ) {
                    next.push_back(change);
                }
            }
            wave = next;
        }
        Ok(())
    }
}
