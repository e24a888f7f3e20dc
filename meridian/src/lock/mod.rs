//! # Summary
//!
//! This module implements the two lock managers the scheduler can be built
//! with. Both are plain data structures owned by the scheduler thread —
//! per-key locks are bookkeeping, not OS mutexes.
//!
//! - `Old` (also serving RMA mode): strict reader-writer queues, FIFO by
//!   arrival on the deterministic stream. Deadlock-free because each
//!   transaction's requests are issued atomically in stream order.
//! - `Ddr`: requests enqueue immediately; a waits-for graph is maintained
//!   and any cycle created by an insertion is broken by aborting its
//!   youngest member (highest txn id).

use crate::config::LockManagerMode;
use crate::transaction::{Key, KeyMode, TxnId};

mod ddr;
mod old;

pub use self::ddr::DdrLockManager;
pub use self::old::OldLockManager;

/// Outcome of issuing one transaction's lock requests.
#[derive(Debug, Default)]
pub struct Acquire {
    /// All requested locks are held; the transaction can dispatch.
    pub acquired: bool,

    /// Transactions to abort as deadlock victims (DDR only). May include
    /// the requesting transaction itself.
    pub victims: Vec<TxnId>,

    /// Other transactions unblocked by victim removal (DDR only).
    pub ready: Vec<TxnId>,
}

pub enum LockManager {
    Old(OldLockManager),
    Ddr(DdrLockManager),
}

impl LockManager {
    pub fn new(mode: LockManagerMode) -> Self {
        match mode {
        | LockManagerMode::Old | LockManagerMode::Rma => LockManager::Old(OldLockManager::new()),
        | LockManagerMode::Ddr => LockManager::Ddr(DdrLockManager::new()),
        }
    }

    /// Issue all of a transaction's requests atomically. The caller
    /// guarantees at most one acquire per transaction.
    pub fn acquire(&mut self, txn_id: TxnId, keys: &[(Key, KeyMode)]) -> Acquire {
        match self {
        | LockManager::Old(lm) => lm.acquire(txn_id, keys),
        | LockManager::Ddr(lm) => lm.acquire(txn_id, keys),
        }
    }

    /// Release everything a transaction holds or waits for, returning the
    /// transactions that now hold their full lock sets.
    pub fn release(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        match self {
        | LockManager::Old(lm) => lm.release(txn_id),
        | LockManager::Ddr(lm) => lm.release(txn_id),
        }
    }

    pub fn num_locked_keys(&self) -> usize {
        match self {
        | LockManager::Old(lm) => lm.num_locked_keys(),
        | LockManager::Ddr(lm) => lm.num_locked_keys(),
        }
    }

    pub fn num_waiting(&self) -> usize {
        match self {
        | LockManager::Old(lm) => lm.num_waiting(),
        | LockManager::Ddr(lm) => lm.num_waiting(),
        }
    }

    pub fn deadlocks_resolved(&self) -> u64 {
        match self {
        | LockManager::Old(_) => 0,
        | LockManager::Ddr(lm) => lm.deadlocks_resolved(),
        }
    }

    pub fn stats(&self, level: u32) -> serde_json::Value {
        match self {
        | LockManager::Old(lm) => lm.stats(level),
        | LockManager::Ddr(lm) => lm.stats(level),
        }
    }
}

fn compatible(held: KeyMode, requested: KeyMode) -> bool {
    held == KeyMode::Read && requested == KeyMode::Read
}
