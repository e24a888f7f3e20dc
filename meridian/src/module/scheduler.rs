//! # Summary
//!
//! This module defines the `Scheduler`: the single owner of this
//! partition's lock table and per-transaction state. It receives the
//! deterministic stream from the orderer, issues lock requests, validates
//! mastership counters once locks are held, dispatches ready transactions
//! to the worker, routes remote reads between partitions, votes remaster
//! decisions through their Paxos group, and releases locks on completion.
//!
//! All cross-referencing state (holders, lock queues, read buffers) is
//! keyed by transaction id in arenas owned here; components never share
//! pointers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::{HashMap, HashSet};

use crate::config::{Config, LockManagerMode};
use crate::internal;
use crate::lock::LockManager;
use crate::message::{self, Envelope, MachineId, Message, ModuleId, Request, Response};
use crate::sender::Sender;
use crate::transaction::{
    Key, KeyMode, Metadata, PartitionId, RegionId, Transaction, TxnEvent, TxnId, TxnStatus,
};

/// Scheduler-local state of one active transaction. At most one holder
/// exists per transaction per partition.
struct TxnHolder {
    txn: Transaction,

    /// Lock-only pieces (by home region) still owed locks, for multi-home
    /// transactions under the deadlock-resolving manager.
    remaining_lock_pieces: HashSet<RegionId>,

    /// Pieces already processed, for duplicate detection.
    pieces_seen: HashSet<Option<RegionId>>,

    /// All issued lock requests are granted.
    locked: bool,

    dispatched: bool,
    num_dispatches: u32,
    aborting: bool,
    abort_propagated: bool,

    /// Remote reads that arrived before dispatch.
    buffered_reads: Vec<(PartitionId, Vec<(Key, Option<Vec<u8>>)>)>,
}

pub struct Scheduler {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,
    id: MachineId,
    partition: PartitionId,

    lock_manager: LockManager,
    holders: HashMap<TxnId, TxnHolder>,
    done: HashSet<TxnId>,

    /// Abort notices that outran their transaction.
    pre_aborted: HashSet<TxnId>,

    /// Remote reads that outran their transaction.
    early_reads: HashMap<TxnId, Vec<(PartitionId, Vec<(Key, Option<Vec<u8>>)>)>>,

    /// Mastership authority for keys of this partition. Updated only at a
    /// remaster's position in the stream, under its lock, so every replica
    /// applies the same change at the same point.
    metadata: HashMap<Key, Metadata>,

    /// Remaster transactions proposed and awaiting their commit.
    pending_remasters: HashSet<TxnId>,

    /// Remaster commits that arrived before this partition reached the
    /// transaction.
    committed_remasters: HashSet<TxnId>,

    num_committed: u64,
    num_aborted: u64,
}

impl Scheduler {
    pub fn new(rx: internal::Rx<Envelope>, sender: Sender) -> Self {
        let config = sender.config().clone();
        let id = sender.id();
        let partition = config.partition_of(id);
        let lock_manager = LockManager::new(config.lock_manager);
        let mut metadata = HashMap::new();
        for (key, master) in &config.metadata_overrides {
            metadata.insert(
                key.clone().into_bytes(),
                Metadata { master: *master, counter: 0 },
            );
        }
        Scheduler {
            rx,
            sender,
            config,
            id,
            partition,
            lock_manager,
            holders: HashMap::new(),
            done: HashSet::new(),
            pre_aborted: HashSet::new(),
            early_reads: HashMap::new(),
            metadata,
            pending_remasters: HashSet::new(),
            committed_remasters: HashSet::new(),
            num_committed: 0,
            num_aborted: 0,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::ForwardTxn(txn)) => self.respond_txn(*txn),
        | Message::Request(Request::RemoteReads { txn_id, partition, reads }) => {
            self.respond_remote_reads(txn_id, partition, reads);
        }
        | Message::Request(Request::TxnFinished(txn)) => self.respond_finished(*txn),
        | Message::Request(Request::AbortTxn { txn_id }) => self.respond_abort(txn_id),
        | Message::Request(Request::PaxosDeliver { value, .. }) => self.respond_remaster_commit(value),
        | Message::Request(Request::Stats { level, .. }) => {
            let stats = Envelope::response(
                self.id,
                Response::Stats { module: ModuleId::Scheduler, json: self.stats(level) },
            );
            self.sender.send(stats, from, message::SERVER);
        }
        | message => warn!("unexpected message at scheduler: {:?}", message),
        }
    }

    /// Indices of this partition's keys in the transaction's key list.
    fn local_keys(txn: &Transaction, config: &Config, partition: PartitionId) -> Vec<usize> {
        txn.keys
            .iter()
            .enumerate()
            .filter(|(_, e)| config.partition_of_key(&e.key) == partition)
            .map(|(i, _)| i)
            .collect()
    }

    /// One transaction (or one lock-only piece of one) arrived on the
    /// deterministic stream.
    fn respond_txn(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        if self.done.contains(&txn_id) {
            debug!("dropping duplicate txn {}", txn_id);
            return;
        }
        if !txn.internal.involved_partitions.contains(&self.partition) {
            warn!("txn {} does not involve partition {}; dropping", txn_id, self.partition);
            return;
        }
        if self.pre_aborted.remove(&txn_id) {
            let mut txn = txn;
            txn.abort("aborted by peer partition");
            txn.record(TxnEvent::Abort, self.id);
            self.done.insert(txn_id);
            self.report(&txn);
            return;
        }

        let piece = txn.internal.lock_only_home;
        let config = self.config.clone();
        let partition = self.partition;

        if !self.holders.contains_key(&txn_id) {
            let mut txn = txn.clone();
            txn.record(TxnEvent::EnterSchedulerLm, self.id);

            // Under DDR a multi-home transaction owes one piece of lock
            // requests per home region of its local keys.
            let mut remaining = HashSet::new();
            if config.lock_manager == LockManagerMode::Ddr && txn.internal.multi_home {
                for index in Self::local_keys(&txn, &config, partition) {
                    if let Some(metadata) = txn.keys[index].metadata {
                        remaining.insert(metadata.master);
                    }
                }
            }
            let buffered_reads = self.early_reads.remove(&txn_id).unwrap_or_default();
            self.holders.insert(txn_id, TxnHolder {
                txn,
                remaining_lock_pieces: remaining,
                pieces_seen: HashSet::new(),
                locked: false,
                dispatched: false,
                num_dispatches: 0,
                aborting: false,
                abort_propagated: false,
                buffered_reads,
            });
        }

        // This piece's lock requests.
        let mut keys: Vec<(Key, KeyMode)> = Vec::new();
        {
            let holder = self.holders.get_mut(&txn_id).expect("[INTERNAL ERROR]: missing holder");
            if !holder.pieces_seen.insert(piece) {
                debug!("dropping duplicate piece of txn {}", txn_id);
                return;
            }
            if holder.aborting {
                return;
            }
            for index in Self::local_keys(&holder.txn, &config, partition) {
                let entry = &holder.txn.keys[index];
                let wanted = match piece {
                | Some(home) => entry.metadata.map(|m| m.master) == Some(home),
                | None => true,
                };
                if wanted {
                    keys.push((entry.key.clone(), entry.mode));
                }
            }
            if let Some(home) = piece {
                holder.remaining_lock_pieces.remove(&home);
            }
        }

        if !keys.is_empty() {
            let result = self.lock_manager.acquire(txn_id, &keys);
            if let Some(holder) = self.holders.get_mut(&txn_id) {
                holder.locked = result.acquired;
            }
            for victim in &result.victims {
                self.abort_deadlock_victim(*victim);
            }
            for ready in result.ready {
                if let Some(holder) = self.holders.get_mut(&ready) {
                    holder.locked = true;
                }
                self.try_dispatch(ready);
            }
            if result.victims.contains(&txn_id) {
                return;
            }
        }
        self.try_dispatch(txn_id);
    }

    /// Dispatch once every owed lock request is issued and granted.
    fn try_dispatch(&mut self, txn_id: TxnId) {
        let config = self.config.clone();
        let partition = self.partition;

        // Mastership counters are checked under the lock: any remaster
        // ordered earlier has already applied, so every replica reaches the
        // same verdict.
        let mut stale = false;
        {
            let holder = match self.holders.get_mut(&txn_id) {
            | Some(holder) => holder,
            | None => return,
            };
            if holder.dispatched
                || holder.aborting
                || !holder.locked
                || !holder.remaining_lock_pieces.is_empty()
            {
                return;
            }
            for index in Self::local_keys(&holder.txn, &config, partition) {
                let entry = &holder.txn.keys[index];
                let stamped = entry.metadata.map(|m| m.counter).unwrap_or(0);
                let current = self.metadata.get(&entry.key).map(|m| m.counter).unwrap_or(0);
                if stamped != current {
                    stale = true;
                    break;
                }
            }
        }
        if stale {
            let id = self.id;
            let holder = self.holders.get_mut(&txn_id).expect("[INTERNAL ERROR]: missing holder");
            holder.aborting = true;
            holder.txn.abort("outdated metadata");
            holder.txn.record(TxnEvent::Abort, id);
            self.propagate_abort(txn_id);
            self.complete(txn_id, None);
            return;
        }

        let is_remaster = self.holders[&txn_id].txn.is_remaster();
        if is_remaster {
            if self.committed_remasters.remove(&txn_id) {
                self.apply_remaster(txn_id);
            } else {
                self.pending_remasters.insert(txn_id);
                let propose = Envelope::request(self.id, Request::PaxosPropose { value: txn_id });
                self.sender.send_local(propose, message::REMASTER_PAXOS);
            }
            return;
        }

        let id = self.id;
        let holder = self.holders.get_mut(&txn_id).expect("[INTERNAL ERROR]: missing holder");
        holder.dispatched = true;
        holder.num_dispatches += 1;
        holder.txn.record(TxnEvent::Dispatched, id);
        let dispatch = Envelope::request(id, Request::Dispatch(Box::new(holder.txn.clone())));
        let buffered = std::mem::take(&mut holder.buffered_reads);
        self.sender.send_local(dispatch, message::WORKER);
        for (partition, reads) in buffered {
            let reads = Envelope::request(id, Request::RemoteReads { txn_id, partition, reads });
            self.sender.send_local(reads, message::WORKER);
        }
    }

    fn respond_remote_reads(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        reads: Vec<(Key, Option<Vec<u8>>)>,
    ) {
        if self.done.contains(&txn_id) {
            return;
        }
        let id = self.id;
        match self.holders.get_mut(&txn_id) {
        | Some(holder) if holder.dispatched => {
            let forward = Envelope::request(id, Request::RemoteReads { txn_id, partition, reads });
            self.sender.send_local(forward, message::WORKER);
        }
        | Some(holder) => holder.buffered_reads.push((partition, reads)),
        | None => self.early_reads.entry(txn_id).or_default().push((partition, reads)),
        }
    }

    /// The worker finished executing a dispatched transaction.
    fn respond_finished(&mut self, mut txn: Transaction) {
        let txn_id = txn.id;
        let aborting = match self.holders.get(&txn_id) {
        | Some(holder) => holder.aborting,
        | None => return,
        };
        if aborting && txn.status != TxnStatus::Aborted {
            txn.abort("aborted by peer partition");
            txn.record(TxnEvent::Abort, self.id);
        }
        self.complete(txn_id, Some(txn));
    }

    /// Abort notice from a peer partition of the same (region, replica).
    fn respond_abort(&mut self, txn_id: TxnId) {
        if self.done.contains(&txn_id) {
            return;
        }
        let id = self.id;
        let dispatched = match self.holders.get_mut(&txn_id) {
        | Some(holder) => {
            holder.aborting = true;
            holder.dispatched
        }
        | None => {
            self.pre_aborted.insert(txn_id);
            return;
        }
        };
        if dispatched {
            // The worker drops its pending execution and reports back.
            let abort = Envelope::request(id, Request::AbortTxn { txn_id });
            self.sender.send_local(abort, message::WORKER);
        } else {
            let holder = self.holders.get_mut(&txn_id).expect("[INTERNAL ERROR]: missing holder");
            holder.txn.abort("aborted by peer partition");
            holder.txn.record(TxnEvent::Abort, id);
            self.complete(txn_id, None);
        }
    }

    /// A deadlock victim chosen by the lock manager. Its lock requests are
    /// already gone; it short-circuits to release.
    fn abort_deadlock_victim(&mut self, txn_id: TxnId) {
        let id = self.id;
        match self.holders.get_mut(&txn_id) {
        | Some(holder) => {
            holder.aborting = true;
            holder.txn.abort("aborted_by_deadlock_breaker");
            holder.txn.record(TxnEvent::Abort, id);
        }
        | None => return,
        }
        self.propagate_abort(txn_id);
        self.complete(txn_id, None);
    }

    /// Tell peer partitions of this (region, replica) to drop the
    /// transaction too. Replicas elsewhere reach the same decision on
    /// their own identical streams.
    fn propagate_abort(&mut self, txn_id: TxnId) {
        let id = self.id;
        let region = self.config.region_of(id);
        let replica = self.config.replica_of(id);
        let partition = self.partition;
        let config = self.config.clone();

        let peers: Vec<MachineId> = match self.holders.get_mut(&txn_id) {
        | Some(holder) => {
            if holder.abort_propagated || !holder.txn.internal.multi_partition {
                return;
            }
            holder.abort_propagated = true;
            holder
                .txn
                .internal
                .involved_partitions
                .iter()
                .filter(|p| **p != partition)
                .map(|p| config.machine_id(region, replica, *p))
                .collect()
        }
        | None => return,
        };
        let abort = Envelope::request(id, Request::AbortTxn { txn_id });
        self.sender.send_many(abort, &peers, message::SCHEDULER);
    }

    /// A remaster decision committed in its Paxos group.
    fn respond_remaster_commit(&mut self, txn_id: u64) {
        if self.pending_remasters.remove(&txn_id) {
            self.apply_remaster(txn_id);
        } else if !self.done.contains(&txn_id) {
            // The commit outran this partition's stream position; apply
            // when the transaction reaches its locks.
            self.committed_remasters.insert(txn_id);
        }
    }

    /// Apply a committed remaster to this partition's keys, under the
    /// transaction's still-held locks.
    fn apply_remaster(&mut self, txn_id: TxnId) {
        let id = self.id;
        let config = self.config.clone();
        let partition = self.partition;
        let mut changed = Vec::new();
        {
            let holder = match self.holders.get_mut(&txn_id) {
            | Some(holder) => holder,
            | None => return,
            };
            let new_master = holder.txn.new_master.expect("[INTERNAL ERROR]: remaster without target");
            for index in Self::local_keys(&holder.txn, &config, partition) {
                let key = holder.txn.keys[index].key.clone();
                let stamped = holder.txn.keys[index].metadata;
                let current = self.metadata.get(&key).copied().or(stamped).unwrap_or_default();
                if current.master == new_master {
                    holder.txn.abort("key already mastered at destination region");
                    continue;
                }
                let updated = Metadata { master: new_master, counter: current.counter + 1 };
                self.metadata.insert(key.clone(), updated);
                changed.push((key, updated));
            }
            if holder.txn.status != TxnStatus::Aborted {
                holder.txn.status = TxnStatus::Committed;
                holder.txn.record(TxnEvent::Commit, id);
            } else {
                holder.txn.record(TxnEvent::Abort, id);
            }
        }

        if !changed.is_empty() {
            let all: Vec<MachineId> = self.config.all_machines().collect();
            let remastered = Envelope::request(id, Request::Remastered { keys: changed });
            self.sender.send_many(remastered, &all, message::FORWARDER);
        }
        self.complete(txn_id, None);
    }

    /// Release locks, wake what they unblock, report toward the
    /// coordinator, and retire the holder.
    fn complete(&mut self, txn_id: TxnId, executed: Option<Transaction>) {
        let holder = match self.holders.remove(&txn_id) {
        | Some(holder) => holder,
        | None => return,
        };
        self.done.insert(txn_id);
        self.early_reads.remove(&txn_id);

        let txn = executed.unwrap_or(holder.txn);
        match txn.status {
        | TxnStatus::Aborted => self.num_aborted += 1,
        | _ => self.num_committed += 1,
        }

        let ready = self.lock_manager.release(txn_id);
        for id in ready {
            if let Some(holder) = self.holders.get_mut(&id) {
                holder.locked = true;
            }
            self.try_dispatch(id);
        }
        self.report(&txn);
    }

    /// Send this partition's result to the coordinator's server, from the
    /// coordinator's own (region, replica) row only.
    fn report(&mut self, txn: &Transaction) {
        let coordinator = txn.internal.coordinator;
        let my_row = (self.config.region_of(self.id), self.config.replica_of(self.id));
        let their_row = (self.config.region_of(coordinator), self.config.replica_of(coordinator));
        if my_row != their_row {
            return;
        }
        let result = Envelope::request(
            self.id,
            Request::TxnResult { txn: Box::new(txn.clone()), partition: self.partition },
        );
        self.sender.send(result, coordinator, message::SERVER);
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "active_txns": self.holders.len(),
            "num_locked_keys": self.lock_manager.num_locked_keys(),
            "num_waiting_txns": self.lock_manager.num_waiting(),
            "num_deadlocks_resolved": self.lock_manager.deadlocks_resolved(),
            "num_committed": self.num_committed,
            "num_aborted": self.num_aborted,
        });
        if level >= 1 {
            stats["txns"] = serde_json::Value::Array(
                self.holders
                    .values()
                    .map(|h| {
                        serde_json::json!({
                            "id": h.txn.id,
                            "locked": h.locked,
                            "dispatched": h.dispatched,
                            "num_dispatches": h.num_dispatches,
                            "aborting": h.aborting,
                            "multi_home": h.txn.internal.multi_home,
                            "multi_partition": h.txn.internal.multi_partition,
                        })
                    })
                    .collect(),
            );
        }
        if level >= 2 {
            stats["lock_manager"] = self.lock_manager.stats(level);
        }
        stats.to_string()
    }
}

impl Future for Scheduler {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        loop {
            match this.rx.poll(cx) {
            | Poll::Ready(Some(envelope)) => this.respond(envelope),
            | Poll::Ready(None) => return Poll::Ready(()),
            | Poll::Pending => return Poll::Pending,
            }
        }
    }
}
