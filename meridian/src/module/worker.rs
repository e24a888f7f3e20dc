//! # Summary
//!
//! This module defines the `Worker`, which executes dispatched transactions
//! against this partition's storage. It serves the local pre-image, trades
//! remote reads with the workers of peer partitions (routed through their
//! schedulers), runs the execution engine once the full pre-image is in
//! hand, and applies staged writes for locally-owned keys only when the
//! transaction committed. The worker is the only component that touches
//! storage values.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::{HashMap, HashSet};

use crate::config::Config;
use crate::execution::{Execution, ReadView};
use crate::internal;
use crate::message::{self, Envelope, MachineId, Message, Request};
use crate::sender::Sender;
use crate::storage::Storage;
use crate::transaction::{Key, PartitionId, Transaction, TxnEvent, TxnId, TxnStatus};

/// A dispatched transaction still waiting on peer partitions' reads.
struct PendingExec {
    txn: Transaction,
    needs: HashSet<PartitionId>,
    reads: Vec<(Key, Option<Vec<u8>>)>,
}

pub struct Worker {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,
    id: MachineId,
    partition: PartitionId,

    storage: Arc<dyn Storage>,
    execution: Box<dyn Execution>,

    pending: HashMap<TxnId, PendingExec>,
}

impl Worker {
    pub fn new(
        rx: internal::Rx<Envelope>,
        sender: Sender,
        storage: Arc<dyn Storage>,
        execution: Box<dyn Execution>,
    ) -> Self {
        let config = sender.config().clone();
        let id = sender.id();
        let partition = config.partition_of(id);
        Worker {
            rx,
            sender,
            config,
            id,
            partition,
            storage,
            execution,
            pending: HashMap::new(),
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        match envelope.message {
        | Message::Request(Request::Dispatch(txn)) => self.respond_dispatch(*txn),
        | Message::Request(Request::RemoteReads { txn_id, partition, reads }) => {
            self.respond_remote_reads(txn_id, partition, reads);
        }
        | Message::Request(Request::AbortTxn { txn_id }) => self.respond_abort(txn_id),
        | message => warn!("unexpected message at worker: {:?}", message),
        }
    }

    fn respond_dispatch(&mut self, mut txn: Transaction) {
        txn.record(TxnEvent::EnterWorker, self.id);

        // Serve the local pre-image.
        let mut reads: Vec<(Key, Option<Vec<u8>>)> = Vec::new();
        for entry in &txn.keys {
            if self.config.partition_of_key(&entry.key) == self.partition {
                reads.push((entry.key.clone(), self.storage.read(&entry.key)));
            }
        }

        if !txn.internal.multi_partition {
            self.execute(txn, reads);
            return;
        }

        // Trade reads with the peer partitions of this (region, replica).
        let region = self.config.region_of(self.id);
        let replica = self.config.replica_of(self.id);
        let peers: Vec<MachineId> = txn
            .internal
            .involved_partitions
            .iter()
            .filter(|p| **p != self.partition)
            .map(|p| self.config.machine_id(region, replica, *p))
            .collect();
        let exchange = Envelope::request(
            self.id,
            Request::RemoteReads { txn_id: txn.id, partition: self.partition, reads: reads.clone() },
        );
        self.sender.send_many(exchange, &peers, message::SCHEDULER);

        let needs: HashSet<PartitionId> = txn
            .internal
            .involved_partitions
            .iter()
            .filter(|p| **p != self.partition)
            .copied()
            .collect();
        let txn_id = txn.id;
        self.pending.insert(txn_id, PendingExec { txn, needs, reads });
    }

    fn respond_remote_reads(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        reads: Vec<(Key, Option<Vec<u8>>)>,
    ) {
        let done = match self.pending.get_mut(&txn_id) {
        | Some(pending) => {
            if pending.needs.remove(&partition) {
                pending.reads.extend(reads);
            }
            pending.needs.is_empty()
        }
        | None => return,
        };
        if done {
            let pending = self.pending.remove(&txn_id).expect("[INTERNAL ERROR]: pending vanished");
            self.execute(pending.txn, pending.reads);
        }
    }

    /// The scheduler withdrew a dispatched transaction; report it aborted
    /// without running it.
    fn respond_abort(&mut self, txn_id: TxnId) {
        if let Some(mut pending) = self.pending.remove(&txn_id) {
            pending.txn.abort("aborted by peer partition");
            pending.txn.record(TxnEvent::Abort, self.id);
            let finished = Envelope::request(self.id, Request::TxnFinished(Box::new(pending.txn)));
            self.sender.send_local(finished, message::SCHEDULER);
        }
    }

    /// Run the engine over the full pre-image and apply local effects.
    fn execute(&mut self, mut txn: Transaction, reads: Vec<(Key, Option<Vec<u8>>)>) {
        let view = ReadView::new(reads);
        self.execution.execute(&mut txn, &view);
        if txn.status == TxnStatus::Pending {
            txn.status = TxnStatus::Committed;
        }

        match txn.status {
        | TxnStatus::Committed => {
            for (key, value) in &txn.writes {
                if self.config.partition_of_key(key) == self.partition {
                    self.storage.write(key, value.clone());
                }
            }
            for key in &txn.deletes {
                if self.config.partition_of_key(key) == self.partition {
                    self.storage.delete(key);
                }
            }
            txn.record(TxnEvent::Commit, self.id);
        }
        | _ => txn.record(TxnEvent::Abort, self.id),
        }

        let finished = Envelope::request(self.id, Request::TxnFinished(Box::new(txn)));
        self.sender.send_local(finished, message::SCHEDULER);
    }
}

impl Future for Worker {
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
