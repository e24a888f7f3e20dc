//! # Summary
//!
//! This module defines the transaction model: keys and their access modes,
//! mastership metadata, procedure calls, statuses, and the internal record a
//! transaction accumulates while it moves through the pipeline. A transaction
//! is owned by exactly one component at a time; every handoff goes through the
//! envelope bus, so nothing here is shared or locked.

use serde_derive::{Deserialize, Serialize};

use crate::execution::ProcedureId;
use crate::message::MachineId;

pub type TxnId = u64;
pub type Key = Vec<u8>;
pub type RegionId = u32;
pub type PartitionId = u32;

/// Microseconds since the Unix epoch, for trace events and future-txn release.
pub fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Access mode of a single key in a transaction.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyMode {
    Read,
    Write,
}

/// Mastership record for a key. The counter increases by exactly one on
/// every remaster and never decreases at any replica.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub master: RegionId,
    pub counter: u32,
}

/// One key of a transaction, with the metadata observed by the forwarder
/// stamped in. The scheduler validates the stamped counter against its own
/// view once the key's lock is held.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct KeyEntry {
    pub key: Key,
    pub mode: KeyMode,
    pub metadata: Option<Metadata>,
}

/// One procedure call of a transaction's code. The procedure name has
/// already been resolved to an id at admission; `args` excludes the name.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Procedure {
    pub id: ProcedureId,
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

/// Pipeline trace points, recorded with the machine and time that saw them.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnEvent {
    EnterServer,
    EnterForwarder,
    ExitForwarder,
    EnterSequencer,
    ExitSequencerInBatch,
    EnterOrderer,
    EnterSchedulerLm,
    Dispatched,
    EnterWorker,
    Commit,
    Abort,
    ReturnToServer,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug)]
pub struct TraceEvent {
    pub event: TxnEvent,
    pub machine: MachineId,
    pub time: i64,
}

/// Bookkeeping that travels with the transaction but is never set by the
/// client: the admitting machine, the forwarder's classification, and the
/// trace.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default)]
pub struct TxnInternal {
    /// Machine that admitted the transaction and owes the client a reply.
    pub coordinator: MachineId,

    /// Home region, for single-home transactions.
    pub home: Option<RegionId>,

    /// Sorted home regions of all keys.
    pub involved_regions: Vec<RegionId>,

    /// Sorted partitions of all keys.
    pub involved_partitions: Vec<PartitionId>,

    pub multi_home: bool,
    pub multi_partition: bool,

    /// Set on the copies a multi-home transaction leaves in each involved
    /// region's batch under the deadlock-resolving lock manager: the
    /// scheduler locks only the keys homed at this region when it sees
    /// this piece.
    pub lock_only_home: Option<RegionId>,

    pub events: Vec<TraceEvent>,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Unique cluster-wide: admission sequence number shifted over the
    /// admitting machine's id.
    pub id: TxnId,

    /// Deduplicated; a key requested for both read and write appears once,
    /// as a write.
    pub keys: Vec<KeyEntry>,

    pub code: Vec<Procedure>,

    pub status: TxnStatus,
    pub abort_reason: String,

    /// Present on remaster transactions; such transactions carry no code.
    pub new_master: Option<RegionId>,

    /// Earliest execution time in microseconds since the epoch; 0 means now.
    pub timestamp: i64,

    pub internal: TxnInternal,

    /// Results of execution, filled in by the worker.
    pub reads: Vec<(Key, Vec<u8>)>,
    pub writes: Vec<(Key, Vec<u8>)>,
    pub deletes: Vec<Key>,
}

impl Transaction {
    pub fn new(keys: Vec<(Key, KeyMode)>, code: Vec<Procedure>) -> Self {
        let mut deduped: Vec<KeyEntry> = Vec::with_capacity(keys.len());
        for (key, mode) in keys {
            if let Some(existing) = deduped.iter_mut().find(|e| e.key == key) {
                if mode == KeyMode::Write {
                    existing.mode = KeyMode::Write;
                }
            } else {
                deduped.push(KeyEntry { key, mode, metadata: None });
            }
        }
        Transaction {
            id: 0,
            keys: deduped,
            code,
            status: TxnStatus::Pending,
            abort_reason: String::new(),
            new_master: None,
            timestamp: 0,
            internal: TxnInternal::default(),
            reads: Vec::new(),
            writes: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn new_remaster(keys: Vec<Key>, new_master: RegionId) -> Self {
        let keys = keys.into_iter().map(|k| (k, KeyMode::Write)).collect();
        let mut txn = Transaction::new(keys, Vec::new());
        txn.new_master = Some(new_master);
        txn
    }

    pub fn is_remaster(&self) -> bool {
        self.new_master.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TxnStatus::Pending
    }

    pub fn key_entry(&self, key: &[u8]) -> Option<&KeyEntry> {
        self.keys.iter().find(|e| e.key == key)
    }

    /// Append a trace event. Events are never removed.
    pub fn record(&mut self, event: TxnEvent, machine: MachineId) {
        self.internal.events.push(TraceEvent {
            event,
            machine,
            time: now_micros(),
        });
    }

    /// Mark the transaction aborted. The first abort wins; a transaction
    /// that already reached a terminal status is left untouched.
    pub fn abort<S: Into<String>>(&mut self, reason: S) {
        if self.is_terminal() {
            return;
        }
        self.status = TxnStatus::Aborted;
        self.abort_reason = reason.into();
    }

    pub fn has_event(&self, event: TxnEvent) -> bool {
        self.internal.events.iter().any(|e| e.event == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_deduplicate_and_write_wins() {
        let txn = Transaction::new(
            vec![
                (b"a".to_vec(), KeyMode::Read),
                (b"b".to_vec(), KeyMode::Read),
                (b"a".to_vec(), KeyMode::Write),
            ],
            Vec::new(),
        );
        assert_eq!(txn.keys.len(), 2);
        assert_eq!(txn.key_entry(b"a").unwrap().mode, KeyMode::Write);
        assert_eq!(txn.key_entry(b"b").unwrap().mode, KeyMode::Read);
    }

    #[test]
    fn first_abort_wins() {
        let mut txn = Transaction::new(Vec::new(), Vec::new());
        txn.abort("first");
        txn.abort("second");
        assert_eq!(txn.status, TxnStatus::Aborted);
        assert_eq!(txn.abort_reason, "first");
    }

    #[test]
    fn remaster_has_no_code() {
        let txn = Transaction::new_remaster(vec![b"k".to_vec()], 1);
        assert!(txn.is_remaster());
        assert!(txn.code.is_empty());
        assert_eq!(txn.keys[0].mode, KeyMode::Write);
    }
}
