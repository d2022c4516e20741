//! Wait-for graph.
//!
//! Nodes are transaction families (identified by their root). A blocked
//! request adds edges from its family to every family holding a conflicting
//! range. Each waiter carries the sequence number of its request so victim
//! selection can pick the most recent one.

use crate::types::{DictId, TxnId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A blocked lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEntry {
    /// Requesting transaction.
    pub txn: TxnId,
    /// Root of the requester's family.
    pub root: TxnId,
    /// Dictionary the request waits on.
    pub dict: DictId,
    /// Roots of the families it waits for.
    pub blockers: Vec<TxnId>,
    /// Request sequence number; higher is more recent.
    pub seq: u64,
}

/// A transaction rejected to break a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlockVictim {
    /// The rejected transaction.
    pub txn: TxnId,
    /// Dictionary it was waiting on.
    pub dict: DictId,
}

/// The current waits plus pending rejections.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    waiting: HashMap<TxnId, WaitEntry>,
    rejected: HashSet<TxnId>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or refreshes) a wait.
    pub fn set_waiting(&mut self, entry: WaitEntry) {
        self.waiting.insert(entry.txn, entry);
    }

    /// Removes the wait of `txn`.
    pub fn clear(&mut self, txn: TxnId) {
        self.waiting.remove(&txn);
    }

    /// Returns the wait of `txn`, if blocked.
    pub fn entry(&self, txn: TxnId) -> Option<&WaitEntry> {
        self.waiting.get(&txn)
    }

    /// Number of blocked requests.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Returns true if nothing waits.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Consumes a pending rejection for `txn`.
    pub fn take_rejection(&mut self, txn: TxnId) -> bool {
        self.rejected.remove(&txn)
    }

    /// Forgets a transaction entirely (it finished).
    pub fn forget(&mut self, txn: TxnId) {
        self.waiting.remove(&txn);
        self.rejected.remove(&txn);
    }

    fn adjacency(&self) -> BTreeMap<TxnId, BTreeSet<TxnId>> {
        let mut edges: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        for entry in self.waiting.values() {
            edges
                .entry(entry.root)
                .or_default()
                .extend(entry.blockers.iter().copied().filter(|b| *b != entry.root));
        }
        edges
    }

    /// Returns true if the wait of `txn` lies on a cycle.
    pub fn closes_cycle(&self, txn: TxnId) -> bool {
        let Some(entry) = self.waiting.get(&txn) else {
            return false;
        };
        let edges = self.adjacency();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<TxnId> = entry.blockers.clone();
        while let Some(node) = stack.pop() {
            if node == entry.root {
                return true;
            }
            if seen.insert(node) {
                if let Some(next) = edges.get(&node) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }

    /// Finds one cycle and returns the families on it.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let edges = self.adjacency();
        let mut done = BTreeSet::new();

        for &start in edges.keys() {
            if done.contains(&start) {
                continue;
            }
            // Iterative DFS keeping the current path.
            let mut path: Vec<TxnId> = vec![start];
            let mut on_path: BTreeSet<TxnId> = BTreeSet::from([start]);
            let mut iters: Vec<Vec<TxnId>> =
                vec![edges.get(&start).map(|s| s.iter().copied().collect()).unwrap_or_default()];

            while let Some(frontier) = iters.last_mut() {
                match frontier.pop() {
                    Some(next) if on_path.contains(&next) => {
                        let from = path.iter().position(|n| *n == next).unwrap_or(0);
                        return Some(path[from..].to_vec());
                    }
                    Some(next) if !done.contains(&next) => {
                        path.push(next);
                        on_path.insert(next);
                        iters.push(
                            edges
                                .get(&next)
                                .map(|s| s.iter().copied().collect())
                                .unwrap_or_default(),
                        );
                    }
                    Some(_) => {}
                    None => {
                        iters.pop();
                        if let Some(node) = path.pop() {
                            on_path.remove(&node);
                            done.insert(node);
                        }
                    }
                }
            }
        }
        None
    }

    /// Breaks every cycle by rejecting, per cycle, the most recent request
    /// made by a member family.
    pub fn reject_cycles(&mut self) -> Vec<DeadlockVictim> {
        let mut victims = Vec::new();
        while let Some(cycle) = self.find_cycle() {
            let members: BTreeSet<TxnId> = cycle.into_iter().collect();
            let victim = self
                .waiting
                .values()
                .filter(|entry| members.contains(&entry.root))
                .max_by_key(|entry| entry.seq)
                .map(|entry| DeadlockVictim {
                    txn: entry.txn,
                    dict: entry.dict,
                });
            let Some(victim) = victim else {
                break;
            };
            self.waiting.remove(&victim.txn);
            self.rejected.insert(victim.txn);
            victims.push(victim);
        }
        victims
    }
}
