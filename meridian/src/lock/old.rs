//! # Summary
//!
//! This module implements the strict reader-writer lock manager. Each key
//! keeps its current holders and a FIFO queue of waiters; a waiter is
//! promoted only when it reaches the head of the queue and every holder is
//! compatible with it. Arrival order over the deterministic stream is total,
//! so no waiter can starve and no cycle can form.

use hashbrown::HashMap;

use crate::transaction::{Key, KeyMode, TxnId};

use super::{compatible, Acquire};

#[derive(Default)]
struct LockQueue {
    /// Current holders; either one writer or any number of readers.
    holders: Vec<(TxnId, KeyMode)>,

    /// Waiters in arrival order.
    waiters: std::collections::VecDeque<(TxnId, KeyMode)>,
}

impl LockQueue {
    fn grantable(&self, mode: KeyMode) -> bool {
        self.waiters.is_empty() && self.holders.iter().all(|(_, held)| compatible(*held, mode))
    }

    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

pub struct OldLockManager {
    table: HashMap<Key, LockQueue>,

    /// Keys each active transaction requested, for release.
    txn_keys: HashMap<TxnId, Vec<Key>>,

    /// Requested keys not yet granted, per waiting transaction.
    num_waiting_for: HashMap<TxnId, usize>,
}

impl OldLockManager {
    pub fn new() -> Self {
        OldLockManager {
            table: HashMap::new(),
            txn_keys: HashMap::new(),
            num_waiting_for: HashMap::new(),
        }
    }

    pub fn acquire(&mut self, txn_id: TxnId, keys: &[(Key, KeyMode)]) -> Acquire {
        debug_assert!(!self.txn_keys.contains_key(&txn_id));
        let mut waiting = 0;
        for (key, mode) in keys {
            let queue = self.table.entry(key.clone()).or_default();
            if queue.grantable(*mode) {
                queue.holders.push((txn_id, *mode));
            } else {
                queue.waiters.push_back((txn_id, *mode));
                waiting += 1;
            }
        }
        self.txn_keys.insert(txn_id, keys.iter().map(|(k, _)| k.clone()).collect());
        if waiting > 0 {
            self.num_waiting_for.insert(txn_id, waiting);
        }
        Acquire { acquired: waiting == 0, ..Acquire::default() }
    }

    pub fn release(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let keys = match self.txn_keys.remove(&txn_id) {
        | Some(keys) => keys,
        | None => return Vec::new(),
        };
        self.num_waiting_for.remove(&txn_id);

        let mut ready = Vec::new();
        for key in keys {
            let queue = match self.table.get_mut(&key) {
            | Some(queue) => queue,
            | None => continue,
            };
            queue.holders.retain(|(id, _)| *id != txn_id);
            queue.waiters.retain(|(id, _)| *id != txn_id);

            // Promote from the head while the lock set stays compatible.
            while let Some((waiter, mode)) = queue.waiters.front().copied() {
                if !queue.holders.iter().all(|(_, held)| compatible(*held, mode)) {
                    break;
                }
                queue.waiters.pop_front();
                queue.holders.push((waiter, mode));
                let remaining = self
                    .num_waiting_for
                    .get_mut(&waiter)
                    .expect("[INTERNAL ERROR]: waiter with no wait count");
                *remaining -= 1;
                if *remaining == 0 {
                    self.num_waiting_for.remove(&waiter);
                    ready.push(waiter);
                }
            }
            if queue.is_empty() {
                self.table.remove(&key);
            }
        }
        ready
    }

    pub fn num_locked_keys(&self) -> usize {
        self.table.values().filter(|q| !q.holders.is_empty()).count()
    }

    pub fn num_waiting(&self) -> usize {
        self.num_waiting_for.len()
    }

    pub fn stats(&self, level: u32) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "num_locked_keys": self.num_locked_keys(),
            "num_waiting_txns": self.num_waiting(),
        });
        if level >= 2 {
            let table: Vec<serde_json::Value> = self
                .table
                .iter()
                .map(|(key, queue)| {
                    serde_json::json!({
                        "key": String::from_utf8_lossy(key),
                        "holders": queue.holders.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                        "waiters": queue
                            .waiters
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

    fn read(key: &[u8]) -> (Key, KeyMode) {
        (key.to_vec(), KeyMode::Read)
    }

    #[test]
    fn readers_share_writers_exclude() {
        let mut lm = OldLockManager::new();
        assert!(lm.acquire(1, &[read(b"k")]).acquired);
        assert!(lm.acquire(2, &[read(b"k")]).acquired);
        assert!(!lm.acquire(3, &[write(b"k")]).acquired);
        assert_eq!(lm.num_locked_keys(), 1);
    }

    #[test]
    fn fifo_order_is_respected() {
        let mut lm = OldLockManager::new();
        assert!(lm.acquire(1, &[write(b"k")]).acquired);
        assert!(!lm.acquire(2, &[write(b"k")]).acquired);
        assert!(!lm.acquire(3, &[read(b"k")]).acquired);

        // Txn 2 arrived first and must win the lock before txn 3.
        assert_eq!(lm.release(1), vec![2]);
        assert_eq!(lm.release(2), vec![3]);
        assert_eq!(lm.release(3), Vec::<TxnId>::new());
        assert_eq!(lm.num_locked_keys(), 0);
    }

    #[test]
    fn reader_batch_promotes_together() {
        let mut lm = OldLockManager::new();
        assert!(lm.acquire(1, &[write(b"k")]).acquired);
        assert!(!lm.acquire(2, &[read(b"k")]).acquired);
        assert!(!lm.acquire(3, &[read(b"k")]).acquired);
        let mut ready = lm.release(1);
        ready.sort_unstable();
        assert_eq!(ready, vec![2, 3]);
    }

    #[test]
    fn multi_key_txn_ready_only_when_all_granted() {
        let mut lm = OldLockManager::new();
        assert!(lm.acquire(1, &[write(b"a")]).acquired);
        assert!(lm.acquire(2, &[write(b"b")]).acquired);
        assert!(!lm.acquire(3, &[write(b"a"), write(b"b")]).acquired);
        assert_eq!(lm.release(1), Vec::<TxnId>::new());
        assert_eq!(lm.release(2), vec![3]);
    }

    #[test]
    fn a_reader_behind_a_waiting_writer_waits() {
        let mut lm = OldLockManager::new();
        assert!(lm.acquire(1, &[read(b"k")]).acquired);
        assert!(!lm.acquire(2, &[write(b"k")]).acquired);
        // Compatible with the holder, but queued behind the writer.
        assert!(!lm.acquire(3, &[read(b"k")]).acquired);
        assert_eq!(lm.release(1), vec![2]);
    }
}
