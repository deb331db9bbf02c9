//! Parent/child indexes over the state domain.
//!
//! The hierarchy is a forest: every state has at most one parent and the
//! parent relation is acyclic, enforced at edge insertion so a bad machine
//! definition fails activation instead of corrupting a running fire.
//! Transition path computation (exit leaf-first, enter root-first) is
//! derived entirely from these two indexes.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use crate::core::State;
use crate::error::ConfigurationError;

/// Expected hierarchy depth; deeper chains spill to the heap.
type Path<S> = SmallVec<[S; 4]>;

/// Parent and children indexes with derived queries.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy<S: State> {
    parent_of: HashMap<S, S>,
    children_of: HashMap<S, Vec<S>>,
}

impl<S: State> Hierarchy<S> {
    /// Empty hierarchy (a flat machine).
    pub fn new() -> Self {
        Self {
            parent_of: HashMap::new(),
            children_of: HashMap::new(),
        }
    }

    /// Declare `child` a substate of `parent`.
    ///
    /// Rejects a second parent for the same child and any edge that would
    /// close a cycle.
    pub fn set_parent(&mut self, child: S, parent: S) -> Result<(), ConfigurationError> {
        if let Some(existing) = self.parent_of.get(&child) {
            return Err(ConfigurationError::DuplicateParent {
                child: child.name().to_string(),
                existing: existing.name().to_string(),
                parent: parent.name().to_string(),
            });
        }
        // Walking up from the proposed parent must never reach the child.
        let mut cursor = Some(parent);
        while let Some(state) = cursor {
            if state == child {
                return Err(ConfigurationError::HierarchyCycle {
                    child: child.name().to_string(),
                    parent: parent.name().to_string(),
                });
            }
            cursor = self.parent_of.get(&state).copied();
        }
        self.parent_of.insert(child, parent);
        self.children_of.entry(parent).or_default().push(child);
        Ok(())
    }

    /// The parent of `state`, if any.
    pub fn parent(&self, state: S) -> Option<S> {
        self.parent_of.get(&state).copied()
    }

    /// Direct substates of `state`, in declaration order.
    pub fn children(&self, state: S) -> &[S] {
        self.children_of.get(&state).map_or(&[], Vec::as_slice)
    }

    /// Ancestors of `state`, nearest first, excluding `state` itself.
    pub fn ancestors(&self, state: S) -> Path<S> {
        let mut chain = Path::new();
        let mut cursor = self.parent(state);
        while let Some(ancestor) = cursor {
            chain.push(ancestor);
            cursor = self.parent(ancestor);
        }
        chain
    }

    /// All transitive substates of `state`, breadth-first, excluding
    /// `state` itself.
    pub fn descendants(&self, state: S) -> Vec<S> {
        let mut found = Vec::new();
        let mut queue: VecDeque<S> = self.children(state).iter().copied().collect();
        let mut seen: HashSet<S> = queue.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            found.push(next);
            for child in self.children(next) {
                if seen.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        found
    }

    /// True iff `ancestor` appears on `state`'s parent chain.
    pub fn is_ancestor(&self, ancestor: S, state: S) -> bool {
        let mut cursor = self.parent(state);
        while let Some(next) = cursor {
            if next == ancestor {
                return true;
            }
            cursor = self.parent(next);
        }
        false
    }

    /// Path from the outermost ancestor down to `state`, inclusive.
    pub fn path_from_root(&self, state: S) -> Path<S> {
        let mut path = self.ancestors(state);
        path.reverse();
        path.push(state);
        path
    }

    /// Deepest state that is `a`, `b`, or an ancestor of both.
    ///
    /// Returns `None` when the two states live in unrelated trees.
    pub fn lowest_common_ancestor(&self, a: S, b: S) -> Option<S> {
        let mut a_chain: HashSet<S> = HashSet::new();
        a_chain.insert(a);
        for ancestor in self.ancestors(a) {
            a_chain.insert(ancestor);
        }
        if a_chain.contains(&b) {
            return Some(b);
        }
        self.ancestors(b).into_iter().find(|s| a_chain.contains(s))
    }

    /// All (child, parent) edges, for introspection.
    pub fn edges(&self) -> impl Iterator<Item = (S, S)> + '_ {
        self.parent_of.iter().map(|(c, p)| (*c, *p))
    }

    /// True when no edges are declared.
    pub fn is_empty(&self) -> bool {
        self.parent_of.is_empty()
    }
}
