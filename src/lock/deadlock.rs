//! Wait-for graph deadlock prevention (spec §4.7).
//!
//! A blocking request is checked against the graph *before* it is
//! enqueued; if granting the wait would close a cycle the request is
//! rejected outright rather than queued and later aborted.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::instrument;

use crate::error::{Error, Result};

/// Directed wait-for graph: an edge `waiter -> holder` means `waiter`
/// is blocked on a lock `holder` currently owns.
///
/// All mutation and traversal is serialized behind a single mutex
/// (spec §4.7: the graph is small and mutated infrequently compared to
/// the hot lock-insert path, so a coarse lock is the right tradeoff).
#[derive(Default)]
pub struct WaitForGraph {
    edges: Mutex<HashMap<String, HashSet<String>>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if adding an edge `waiter -> holder` would close a
    /// cycle, i.e. `holder` can already (transitively) reach `waiter`.
    #[instrument(skip(self))]
    pub fn would_cause_cycle(&self, waiter: &str, holders: &[String]) -> bool {
        let edges = self.edges.lock().unwrap();
        holders.iter().any(|holder| Self::reaches(&edges, holder, waiter))
    }

    fn reaches(edges: &HashMap<String, HashSet<String>>, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut visited = HashSet::new();

        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(next) = edges.get(&node) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }

    /// Validates and records that `waiter` is now blocked on every
    /// owner in `holders`. Rejects with [`Error::Deadlock`] if doing so
    /// would close a cycle; in that case no edges are added.
    #[instrument(skip(self))]
    pub fn add_waiter(&self, waiter: &str, holders: &[String]) -> Result<()> {
        let mut edges = self.edges.lock().unwrap();
        if holders.iter().any(|holder| Self::reaches(&edges, holder, waiter)) {
            return Err(Error::Deadlock);
        }
        let entry = edges.entry(waiter.to_string()).or_default();
        for holder in holders {
            entry.insert(holder.clone());
        }
        Ok(())
    }

    /// Removes every outbound edge recorded by a previous
    /// [`Self::add_waiter`] call for `owner`: the full set of holders it
    /// was waiting on. Called on grant or cancel (spec §4.7), since the
    /// owner no longer waits on anything once either happens.
    pub fn remove_waiter(&self, owner: &str) {
        let mut edges = self.edges.lock().unwrap();
        edges.remove(owner);
    }

    /// Drops every edge involving `owner`, whether as a waiter or as a
    /// holder. Called on full lock release / connection teardown so
    /// stale edges never linger past an owner's lifetime.
    pub fn remove_owner(&self, owner: &str) {
        let mut edges = self.edges.lock().unwrap();
        edges.remove(owner);
        for targets in edges.values_mut() {
            targets.remove(owner);
        }
        edges.retain(|_, targets| !targets.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_waiters_do_not_conflict() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string()]).unwrap();
        graph.add_waiter("c", &["d".to_string()]).unwrap();
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string()]).unwrap();
        let result = graph.add_waiter("b", &["a".to_string()]);
        assert!(matches!(result, Err(Error::Deadlock)));
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string()]).unwrap();
        graph.add_waiter("b", &["c".to_string()]).unwrap();
        let result = graph.add_waiter("c", &["a".to_string()]);
        assert!(matches!(result, Err(Error::Deadlock)));
    }

    #[test]
    fn rejected_edge_is_not_recorded() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string()]).unwrap();
        graph.add_waiter("b", &["a".to_string()]).unwrap_err();
        // b should still be able to wait on something unrelated.
        graph.add_waiter("b", &["c".to_string()]).unwrap();
    }

    #[test]
    fn remove_waiter_clears_all_outbound_edges() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string(), "c".to_string()]).unwrap();
        graph.remove_waiter("a");
        // a no longer waits on b or c, so both can now wait on a.
        graph.add_waiter("b", &["a".to_string()]).unwrap();
        graph.add_waiter("c", &["a".to_string()]).unwrap();
    }

    #[test]
    fn remove_owner_clears_both_directions() {
        let graph = WaitForGraph::new();
        graph.add_waiter("a", &["b".to_string()]).unwrap();
        graph.remove_owner("a");
        graph.add_waiter("b", &["a".to_string()]).unwrap();
    }

    #[test]
    fn multi_holder_waiter_checks_every_holder() {
        let graph = WaitForGraph::new();
        graph.add_waiter("x", &["a".to_string()]).unwrap();
        let result = graph.add_waiter("a", &["y".to_string(), "x".to_string()]);
        assert!(matches!(result, Err(Error::Deadlock)));
    }
}
