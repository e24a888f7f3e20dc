//! # Summary
//!
//! This module implements the deadlock-resolving lock manager. Requests
//! enter their key queues immediately on arrival, and a transaction may add
//! requests in several pieces (one per home region of a multi-home
//! transaction), so opposing arrival orders on different keys can produce a
//! cycle in the waits-for graph. A cycle is detected on the insertion that
//! closes it and broken by aborting its youngest member — the one with the
//! highest transaction id.

use hashbrown::{HashMap, HashSet};

use crate::transaction::{Key, KeyMode, TxnId};

use super::{compatible, Acquire};

pub struct DdrLockManager {
    /// Requests per key, in arrival order. The head is always granted.
    table: HashMap<Key, Vec<(TxnId, KeyMode)>>,

    /// Outstanding blockers of each waiting transaction. Granted
    /// transactions have no entry.
    waits_for: HashMap<TxnId, HashSet<TxnId>>,

    /// Keys each active transaction has requested so far.
    txn_keys: HashMap<TxnId, Vec<Key>>,

    deadlocks_resolved: u64,
}

impl DdrLockManager {
    pub fn new() -> Self {
        DdrLockManager {
            table: HashMap::new(),
            waits_for: HashMap::new(),
            txn_keys: HashMap::new(),
            deadlocks_resolved: 0,
        }
    }

    /// Add one piece of a transaction's requests. May be called again for
    /// the same transaction with further keys; `acquired` reflects all
    /// pieces added so far.
    pub fn acquire(&mut self, txn_id: TxnId, keys: &[(Key, KeyMode)]) -> Acquire {
        let mut blockers: HashSet<TxnId> = HashSet::new();
        for (key, mode) in keys {
            let queue = self.table.entry(key.clone()).or_default();
            for (earlier, held) in queue.iter() {
                if *earlier != txn_id && !compatible(*held, *mode) {
                    blockers.insert(*earlier);
                }
            }
            queue.push((txn_id, *mode));
            self.txn_keys.entry(txn_id).or_default().push(key.clone());
        }

        if !blockers.is_empty() {
            self.waits_for.entry(txn_id).or_default().extend(blockers);
        }

        let mut victims = Vec::new();
        let mut ready = Vec::new();
        while let Some(cycle) = self.find_cycle(txn_id) {
            let victim = *cycle.iter().max().expect("[INTERNAL ERROR]: empty cycle");
            info!("breaking deadlock {:?} by aborting {}", cycle, victim);
            self.deadlocks_resolved += 1;
            victims.push(victim);
            ready.extend(self.remove(victim));
            if victim == txn_id {
                break;
            }
        }
        ready.retain(|id| *id != txn_id);

        let acquired = self.txn_keys.contains_key(&txn_id) && !self.waits_for.contains_key(&txn_id);
        Acquire { acquired, victims, ready }
    }

    pub fn release(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        self.remove(txn_id)
    }

    /// Drop every trace of a transaction and report who that unblocked.
    fn remove(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let keys = match self.txn_keys.remove(&txn_id) {
        | Some(keys) => keys,
        | None => return Vec::new(),
        };
        for key in keys {
            if let Some(queue) = self.table.get_mut(&key) {
                queue.retain(|(id, _)| *id != txn_id);
                if queue.is_empty() {
                    self.table.remove(&key);
                }
            }
        }
        self.waits_for.remove(&txn_id);

        let mut ready = Vec::new();
        self.waits_for.retain(|other, blockers| {
            blockers.remove(&txn_id);
            if blockers.is_empty() {
                ready.push(*other);
                false
            } else {
                true
            }
        });
        ready
    }

    /// Find a cycle through `start` in the waits-for graph, if the last
    /// insertion closed one.
    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut visited = HashSet::new();
        visited.insert(start);
        if self.dfs(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        node: TxnId,
        start: TxnId,
        path: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> bool {
        let blockers = match self.waits_for.get(&node) {
        | Some(blockers) => blockers,
        | None => return false,
        };
        for next in blockers {
            if *next == start {
                return true;
            }
            if visited.insert(*next) {
                path.push(*next);
                if self.dfs(*next, start, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    pub fn num_locked_keys(&self) -> usize {
        self.table.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waits_for.len()
    }

    pub fn deadlocks_resolved(&self) -> u64 {
        self.deadlocks_resolved
    }

    pub fn stats(&self, level: u32) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "num_locked_keys": self.num_locked_keys(),
            "num_waiting_txns": self.num_waiting(),
            "num_deadlocks_resolved": self.deadlocks_resolved,
        });
        if level >= 1 {
            let graph: Vec<serde_json::Value> = self
                .waits_for
                .iter()
                .map(|(txn, blockers)| {
                    serde_json::json!([txn, blockers.iter().collect::<Vec<_>>()])
                })
                .collect();
            stats["waits_for_graph"] = serde_json::Value::Array(graph);
        }
        if level >= 2 {
            let table: Vec<serde_json::Value> = self
                .table
                .iter()
                .map(|(key, queue)| {
                    serde_json::json!({
                        "key": String::from_utf8_lossy(key),
                        "queue": queue
                            .iter()
                            .map(|(id, mode)| serde_json::json!([id, format!("{:?}", mode)]))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            stats["lock_table"] = serde_json::Value::Array(table);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &[u8]) -> (Key, KeyMode) {
        (key.to_vec(), KeyMode::Write)
    }

    #[test]
    fn uncontended_requests_grant_immediately() {
        let mut lm = DdrLockManager::new();
        assert!(lm.acquire(1, &[write(b"a"), write(b"b")]).acquired);
        assert_eq!(lm.num_locked_keys(), 2);
    }

    #[test]
    fn opposing_piecewise_arrival_forms_and_breaks_a_cycle() {
        let mut lm = DdrLockManager::new();

        // Txn 1 and txn 2 each want k1 and k2, but their pieces arrive in
        // opposite orders.
        assert!(lm.acquire(1, &[write(b"k1")]).acquired);
        assert!(lm.acquire(2, &[write(b"k2")]).acquired);

        // Txn 2's second piece waits on txn 1.
        let second = lm.acquire(2, &[write(b"k1")]);
        assert!(!second.acquired);
        assert!(second.victims.is_empty());

        // Txn 1's second piece closes the cycle; the youngest (2) dies.
        let closing = lm.acquire(1, &[write(b"k2")]);
        assert_eq!(closing.victims, vec![2]);
        assert!(closing.acquired, "survivor holds both keys after the break");
        assert_eq!(lm.deadlocks_resolved(), 1);

        assert_eq!(lm.release(1), Vec::<TxnId>::new());
        assert_eq!(lm.num_locked_keys(), 0);
    }

    #[test]
    fn youngest_dies_even_when_it_is_the_inserter() {
        let mut lm = DdrLockManager::new();
        assert!(lm.acquire(2, &[write(b"k1")]).acquired);
        assert!(lm.acquire(1, &[write(b"k2")]).acquired);
        assert!(!lm.acquire(1, &[write(b"k1")]).acquired);

        // Txn 2 closes the cycle and is itself the youngest.
        let closing = lm.acquire(2, &[write(b"k2")]);
        assert_eq!(closing.victims, vec![2]);
        assert!(!closing.acquired);
        // Txn 1 is unblocked by the victim's removal.
        assert_eq!(closing.ready, vec![1]);
    }

    #[test]
    fn release_unblocks_in_arrival_order_semantics() {
        let mut lm = DdrLockManager::new();
        assert!(lm.acquire(1, &[write(b"k")]).acquired);
        assert!(!lm.acquire(2, &[write(b"k")]).acquired);
        let ready = lm.release(1);
        assert_eq!(ready, vec![2]);
        assert!(lm.acquire(3, &[write(b"k")]).acquired == false);
    }

    #[test]
    fn readers_do_not_conflict() {
        let mut lm = DdrLockManager::new();
        let read = |k: &[u8]| (k.to_vec(), KeyMode::Read);
        assert!(lm.acquire(1, &[read(b"k")]).acquired);
        assert!(lm.acquire(2, &[read(b"k")]).acquired);
        assert!(!lm.acquire(3, &[write(b"k")]).acquired);
    }
}
