//! Versioned event types and upcast chains.
//!
//! # Schema Evolution
//!
//! New event versions are new types: `order.placed.v1` stays as written
//! forever, `order.placed.v2` is a different name, and the registry holds
//! the transformations between them. Replay routes old payloads through a
//! chain of upcasters discovered by breadth-first search over the
//! registered edges; no row is ever migrated in place.
//!
//! Two version-suffix conventions are recognized when deriving a type's
//! base name and version: a dotted suffix (`order.placed.v2`) and a
//! trailing PascalCase suffix (`OrderPlacedV2`, `OrderPlacedVersion2`).
//! A name with neither suffix is version 1.
//!
//! # Sharing
//!
//! The registry is the one process-wide mutable resource in the runtime:
//! writes happen during initialization, reads on every replay. It is
//! backed by concurrent maps and shared as `Arc<UpcastRegistry>`; a
//! process default exists for ergonomics but nothing requires it.

use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::ActorId;
use crate::store::LogIndex;

/// Default bound on upcast chain length, in edges.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 10;

/// Default bound on cached composed chains.
pub const DEFAULT_CHAIN_CACHE_CAPACITY: usize = 256;

/// Context handed to every upcaster invocation.
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    /// Actor whose log is being replayed, when known.
    pub actor: Option<ActorId>,
    /// Log index of the event being transformed, when known.
    pub index: Option<LogIndex>,
}

impl MigrationContext {
    /// Context for a replay position.
    pub fn replay(actor: ActorId, index: LogIndex) -> Self {
        Self {
            actor: Some(actor),
            index: Some(index),
        }
    }
}

/// A single registered transformation between adjacent versions.
///
/// Implementations must be pure: same payload in, same payload out.
pub trait EventUpcast: Send + Sync + 'static {
    /// Versioned name of the type this upcast consumes.
    fn from_type(&self) -> &str;

    /// Versioned name of the type this upcast produces.
    fn to_type(&self) -> &str;

    /// Transform one payload.
    fn apply(&self, payload: Value, ctx: &MigrationContext) -> anyhow::Result<Value>;
}

/// Outcome of a lenient upcast attempt.
#[derive(Debug)]
pub enum Upcast {
    /// The payload at the target version (unchanged when already there).
    Done(Value),
    /// No chain connects the two types.
    NoPath,
}

impl Upcast {
    /// The transformed payload, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Upcast::Done(value) => Some(value),
            Upcast::NoPath => None,
        }
    }
}

/// Details handed to the failure observer when no path exists.
#[derive(Debug, Clone)]
pub struct UpcastFailure {
    /// Source type name.
    pub from: String,
    /// Target type name.
    pub to: String,
    /// Context of the failed attempt.
    pub actor: Option<ActorId>,
    /// Log index of the event that could not be transformed.
    pub index: Option<LogIndex>,
}

type Edge = Arc<dyn EventUpcast>;
type FailureObserver = Arc<dyn Fn(&UpcastFailure) + Send + Sync>;

/// Registry of versioned event types and the upcasts between them.
pub struct UpcastRegistry {
    /// from-type -> outgoing edges.
    edges: DashMap<String, Vec<Edge>>,
    /// Composed chains, keyed `from\u{1f}to`. Bounded; full means no new
    /// entries, correctness is unaffected.
    chain_cache: DashMap<String, Vec<Edge>>,
    max_chain_length: usize,
    cache_capacity: usize,
    on_failed: Mutex<Option<FailureObserver>>,
}

impl Default for UpcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UpcastRegistry {
    /// Empty registry with default bounds.
    pub fn new() -> Self {
        Self {
            edges: DashMap::new(),
            chain_cache: DashMap::new(),
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            cache_capacity: DEFAULT_CHAIN_CACHE_CAPACITY,
            on_failed: Mutex::new(None),
        }
    }

    /// Override the chain length bound.
    pub fn with_max_chain_length(mut self, max: usize) -> Self {
        self.max_chain_length = max;
        self
    }

    /// The process-default registry.
    ///
    /// Convenience only: every consumer also accepts an explicit
    /// `Arc<UpcastRegistry>`.
    pub fn process_default() -> Arc<UpcastRegistry> {
        static DEFAULT: OnceLock<Arc<UpcastRegistry>> = OnceLock::new();
        DEFAULT.get_or_init(|| Arc::new(UpcastRegistry::new())).clone()
    }

    /// Observer invoked when a lenient upcast finds no path.
    pub fn set_failure_observer(&self, observer: impl Fn(&UpcastFailure) + Send + Sync + 'static) {
        *self.on_failed.lock().unwrap() = Some(Arc::new(observer));
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register one upcast edge.
    ///
    /// Returns `false` (with a warning) when an edge between the same two
    /// types already exists; the original wins.
    pub fn register(&self, upcast: impl EventUpcast) -> bool {
        self.register_boxed(Arc::new(upcast))
    }

    /// Register a closure as an upcast edge.
    pub fn register_fn(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        apply: impl Fn(Value, &MigrationContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> bool {
        struct FnUpcast<F> {
            from: String,
            to: String,
            apply: F,
        }
        impl<F> EventUpcast for FnUpcast<F>
        where
            F: Fn(Value, &MigrationContext) -> anyhow::Result<Value> + Send + Sync + 'static,
        {
            fn from_type(&self) -> &str {
                &self.from
            }
            fn to_type(&self) -> &str {
                &self.to
            }
            fn apply(&self, payload: Value, ctx: &MigrationContext) -> anyhow::Result<Value> {
                (self.apply)(payload, ctx)
            }
        }
        self.register_boxed(Arc::new(FnUpcast {
            from: from.into(),
            to: to.into(),
            apply,
        }))
    }

    /// Register every upcast a module declares.
    ///
    /// The registration-phase analog of assembly scanning: modules expose
    /// `fn upcasts() -> Vec<Arc<dyn EventUpcast>>` and the host feeds them
    /// all in at startup.
    pub fn register_all(&self, upcasts: impl IntoIterator<Item = Arc<dyn EventUpcast>>) -> usize {
        upcasts
            .into_iter()
            .filter(|u| self.register_boxed(u.clone()))
            .count()
    }

    fn register_boxed(&self, upcast: Edge) -> bool {
        let from = upcast.from_type().to_string();
        let to = upcast.to_type().to_string();
        let mut outgoing = self.edges.entry(from.clone()).or_default();
        if outgoing.iter().any(|e| e.to_type() == to) {
            warn!(%from, %to, "duplicate upcaster registration rejected");
            return false;
        }
        debug!(%from, %to, "upcaster registered");
        outgoing.push(upcast);
        // Any cached chain may now be stale in the lenient direction
        // (previously-missing paths can exist); drop the cache.
        drop(outgoing);
        self.chain_cache.clear();
        true
    }

    // -------------------------------------------------------------------------
    // Upcasting
    // -------------------------------------------------------------------------

    /// True when a chain (possibly empty) connects `from` to `to`.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        from == to || self.find_chain(from, to).is_some()
    }

    /// Transform `payload` from type `from` to type `to`, leniently.
    ///
    /// Returns [`Upcast::NoPath`] (and notifies the failure observer)
    /// when no chain exists. Upcaster application errors propagate: a
    /// broken transformation is corruption, not a missing path.
    pub fn upcast(
        &self,
        from: &str,
        to: &str,
        payload: Value,
        ctx: &MigrationContext,
    ) -> anyhow::Result<Upcast> {
        if from == to {
            return Ok(Upcast::Done(payload));
        }
        let Some(chain) = self.find_chain(from, to) else {
            let failure = UpcastFailure {
                from: from.to_string(),
                to: to.to_string(),
                actor: ctx.actor.clone(),
                index: ctx.index,
            };
            warn!(from = %failure.from, to = %failure.to, "no upcast path");
            if let Some(observer) = self.on_failed.lock().unwrap().clone() {
                observer(&failure);
            }
            return Ok(Upcast::NoPath);
        };
        let mut value = payload;
        for edge in &chain {
            value = edge.apply(value, ctx)?;
        }
        Ok(Upcast::Done(value))
    }

    /// Breadth-first search for the shortest chain, bounded by
    /// `max_chain_length` edges. Results are cached.
    fn find_chain(&self, from: &str, to: &str) -> Option<Vec<Edge>> {
        let cache_key = format!("{from}\u{1f}{to}");
        if let Some(chain) = self.chain_cache.get(&cache_key) {
            return Some(chain.clone());
        }

        let mut frontier: Vec<(String, Vec<Edge>)> = vec![(from.to_string(), Vec::new())];
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        visited.insert(from.to_string());

        for _depth in 0..self.max_chain_length {
            let mut next_frontier = Vec::new();
            for (node, path) in frontier {
                let Some(outgoing) = self.edges.get(&node) else {
                    continue;
                };
                for edge in outgoing.iter() {
                    let target = edge.to_type().to_string();
                    if !visited.insert(target.clone()) {
                        continue;
                    }
                    let mut path = path.clone();
                    path.push(edge.clone());
                    if target == to {
                        if self.chain_cache.len() < self.cache_capacity {
                            self.chain_cache.insert(cache_key, path.clone());
                        }
                        return Some(path);
                    }
                    next_frontier.push((target, path));
                }
            }
            if next_frontier.is_empty() {
                return None;
            }
            frontier = next_frontier;
        }
        None
    }

    // -------------------------------------------------------------------------
    // Version discovery
    // -------------------------------------------------------------------------

    /// Highest-version registered type sharing `name`'s base.
    ///
    /// `latest_version("order.placed.v1")` returns `"order.placed.v3"`
    /// when v2 and v3 edges are registered. Falls back to `name` itself
    /// when nothing newer is known.
    pub fn latest_version(&self, name: &str) -> String {
        let (base, mut best_version) = split_versioned(name);
        let mut best = name.to_string();
        let mut consider = |candidate: &str| {
            let (candidate_base, version) = split_versioned(candidate);
            if candidate_base == base && version > best_version {
                best_version = version;
                best = candidate.to_string();
            }
        };
        for entry in self.edges.iter() {
            consider(entry.key());
            for edge in entry.value() {
                consider(edge.to_type());
            }
        }
        best
    }
}

/// Split a versioned type name into base name and version.
///
/// Recognized suffixes: `.vN`, `VN`, `VersionN`. Anything else is
/// version 1 with the whole name as base.
pub fn split_versioned(name: &str) -> (String, u32) {
    // Dotted convention: "order.placed.v2"
    if let Some(pos) = name.rfind(".v") {
        if let Ok(version) = name[pos + 2..].parse::<u32>() {
            return (name[..pos].to_string(), version);
        }
    }
    // PascalCase conventions: "OrderPlacedV2", "OrderPlacedVersion2"
    let digits_at = name.rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1);
    if let Some(start) = digits_at {
        if start < name.len() {
            let (head, digits) = name.split_at(start);
            if let Ok(version) = digits.parse::<u32>() {
                if let Some(base) = head.strip_suffix("Version").or_else(|| head.strip_suffix('V')) {
                    if !base.is_empty() {
                        return (base.to_string(), version);
                    }
                }
            }
        }
    }
    (name.to_string(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_v1_to_v3() -> UpcastRegistry {
        let registry = UpcastRegistry::new();
        registry.register_fn("order.placed.v1", "order.placed.v2", |mut payload, _| {
            payload["Currency"] = json!("USD");
            Ok(payload)
        });
        registry.register_fn("order.placed.v2", "order.placed.v3", |mut payload, _| {
            let amount = payload["Amount"].as_i64().unwrap_or(0);
            payload["AmountMinor"] = json!(amount * 100);
            Ok(payload)
        });
        registry
    }

    #[test]
    fn test_same_type_is_identity() {
        let registry = UpcastRegistry::new();
        let payload = json!({"a": 1});
        let out = registry
            .upcast("x.v1", "x.v1", payload.clone(), &MigrationContext::default())
            .unwrap();
        assert_eq!(out.into_value(), Some(payload));
    }

    #[test]
    fn test_chain_composes_in_order() {
        let registry = registry_v1_to_v3();
        let out = registry
            .upcast(
                "order.placed.v1",
                "order.placed.v3",
                json!({"Amount": 7}),
                &MigrationContext::default(),
            )
            .unwrap();
        let value = out.into_value().unwrap();
        assert_eq!(value["Currency"], "USD");
        assert_eq!(value["AmountMinor"], 700);
    }

    #[test]
    fn test_upcast_idempotent_on_current_version() {
        let registry = registry_v1_to_v3();
        let payload = json!({"Amount": 7, "Currency": "USD", "AmountMinor": 700});
        let out = registry
            .upcast(
                "order.placed.v3",
                "order.placed.v3",
                payload.clone(),
                &MigrationContext::default(),
            )
            .unwrap();
        assert_eq!(out.into_value(), Some(payload));
    }

    #[test]
    fn test_no_path_is_lenient_and_observed() {
        let registry = registry_v1_to_v3();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        registry.set_failure_observer(move |failure| {
            assert_eq!(failure.from, "order.placed.v3");
            assert_eq!(failure.to, "order.placed.v1");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Downgrade: no edges point backwards.
        let out = registry
            .upcast(
                "order.placed.v3",
                "order.placed.v1",
                json!({}),
                &MigrationContext::default(),
            )
            .unwrap();
        assert!(matches!(out, Upcast::NoPath));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = UpcastRegistry::new();
        assert!(registry.register_fn("a.v1", "a.v2", |p, _| Ok(p)));
        assert!(!registry.register_fn("a.v1", "a.v2", |_, _| {
            panic!("duplicate must never run")
        }));
        let out = registry
            .upcast("a.v1", "a.v2", json!({"x": 1}), &MigrationContext::default())
            .unwrap();
        assert_eq!(out.into_value(), Some(json!({"x": 1})));
    }

    #[test]
    fn test_chain_length_bound() {
        let registry = UpcastRegistry::new().with_max_chain_length(3);
        for i in 0..5 {
            registry.register_fn(format!("t.v{}", i + 1), format!("t.v{}", i + 2), |p, _| Ok(p));
        }
        assert!(registry.has_path("t.v1", "t.v4")); // 3 edges
        assert!(!registry.has_path("t.v1", "t.v6")); // 5 edges, over bound
    }

    #[test]
    fn test_registration_cycles_are_safe() {
        let registry = UpcastRegistry::new();
        registry.register_fn("a", "b", |p, _| Ok(p));
        registry.register_fn("b", "a", |p, _| Ok(p));
        assert!(registry.has_path("a", "b"));
        assert!(!registry.has_path("a", "missing"));
    }

    #[test]
    fn test_upcaster_error_propagates() {
        let registry = UpcastRegistry::new();
        registry.register_fn("bad.v1", "bad.v2", |_, _| anyhow::bail!("mangled payload"));
        let err = registry
            .upcast("bad.v1", "bad.v2", json!({}), &MigrationContext::default())
            .unwrap_err();
        assert!(err.to_string().contains("mangled"));
    }

    #[test]
    fn test_chain_cache_serves_repeat_lookups() {
        let registry = registry_v1_to_v3();
        for _ in 0..3 {
            let out = registry
                .upcast(
                    "order.placed.v1",
                    "order.placed.v3",
                    json!({"Amount": 1}),
                    &MigrationContext::default(),
                )
                .unwrap();
            assert!(matches!(out, Upcast::Done(_)));
        }
    }

    #[test]
    fn test_latest_version_lookup() {
        let registry = registry_v1_to_v3();
        assert_eq!(registry.latest_version("order.placed.v1"), "order.placed.v3");
        assert_eq!(registry.latest_version("unrelated.v1"), "unrelated.v1");
    }

    #[test]
    fn test_split_versioned_conventions() {
        assert_eq!(split_versioned("order.placed.v2"), ("order.placed".into(), 2));
        assert_eq!(split_versioned("OrderPlacedV2"), ("OrderPlaced".into(), 2));
        assert_eq!(split_versioned("OrderPlacedVersion12"), ("OrderPlaced".into(), 12));
        assert_eq!(split_versioned("OrderPlaced"), ("OrderPlaced".into(), 1));
        // A bare "V2" has no base and stays itself.
        assert_eq!(split_versioned("V2"), ("V2".into(), 1));
    }

    #[test]
    fn test_register_all_counts_new_edges() {
        let registry = UpcastRegistry::new();
        struct Up(&'static str, &'static str);
        impl EventUpcast for Up {
            fn from_type(&self) -> &str {
                self.0
            }
            fn to_type(&self) -> &str {
                self.1
            }
            fn apply(&self, payload: Value, _: &MigrationContext) -> anyhow::Result<Value> {
                Ok(payload)
            }
        }
        let batch: Vec<Arc<dyn EventUpcast>> = vec![
            Arc::new(Up("a.v1", "a.v2")),
            Arc::new(Up("a.v2", "a.v3")),
            Arc::new(Up("a.v1", "a.v2")), // duplicate
        ];
        assert_eq!(registry.register_all(batch), 2);
    }

    #[test]
    fn test_migration_context_replay() {
        let ctx = MigrationContext::replay(ActorId::new("door-1"), LogIndex::new(4));
        assert_eq!(ctx.actor.unwrap().as_str(), "door-1");
        assert_eq!(ctx.index.unwrap().value(), 4);
    }
}
