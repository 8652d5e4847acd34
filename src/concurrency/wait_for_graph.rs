use std::collections::{BTreeMap, BTreeSet};

use crate::common::TxnId;

/// Directed waits-for graph over transaction ids, rebuilt from scratch on
/// every detection pass. BTree containers keep iteration order sorted by
/// txn id so cycle detection is deterministic.
pub struct WaitForGraph {
    // key waits for each transaction in the value set
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    /// Removes a transaction and every edge touching it.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
    }

    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// Finds a cycle via DFS, visiting sources and neighbors in ascending
    /// txn-id order. Returns the transactions on the cycle.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut visited = BTreeSet::new();
        let mut on_path = BTreeSet::new();
        let mut path = Vec::new();

        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.dfs(start, &mut visited, &mut on_path, &mut path) {
                return Some(cycle);
            }
        }

        None
    }

    fn dfs(
        &self,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if on_path.contains(&node) {
            // Back edge: the cycle is the path suffix starting at `node`
            let pos = path.iter().position(|&t| t == node).unwrap();
            return Some(path[pos..].to_vec());
        }
        if visited.contains(&node) {
            return None;
        }

        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if let Some(cycle) = self.dfs(next, visited, on_path, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}
