//! # Summary
//!
//! This module defines the multi-home `Orderer`. Every machine runs one; it
//! consumes the shared log's committed values in slot order and turns them
//! into the canonical per-partition execution stream. Single-home batch
//! content and multi-home transactions arrive by multicast and wait in
//! buffers until their committed position comes up, so the emitted sequence
//! is bit-identical on every machine with the same log prefix.
//!
//! The log leader's orderer doubles as the multi-home coordinator: the
//! first copy of a multi-home transaction to arrive gets its observation
//! points captured (the latest committed batch per involved region), a slot
//! in the log, and a broadcast to every peer orderer.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::{HashMap, HashSet};

use crate::config::Config;
use crate::internal;
use crate::message::{
    self, decode_value, mh_txn_value, Batch, Envelope, LogValue, Message, ModuleId, Request,
    Response,
};
use crate::sender::Sender;
use crate::transaction::{PartitionId, RegionId, Transaction, TxnEvent, TxnId};

pub struct Orderer {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,
    partition: PartitionId,

    /// Whether this machine coordinates multi-home transactions.
    is_coordinator: bool,

    /// Committed log values not yet emitted, in slot order. The head
    /// blocks until its content is available.
    pending: VecDeque<u64>,

    /// Batch content buffers, keyed by region and reordered by sequence.
    batches: HashMap<RegionId, BTreeMap<u64, Batch>>,

    /// Highest batch sequence emitted per region.
    emitted_seq: HashMap<RegionId, u64>,

    /// Highest batch sequence committed per region; the coordinator's
    /// observation source.
    committed_seq: HashMap<RegionId, u64>,

    /// Multi-home content, keyed by transaction id.
    mh_txns: HashMap<TxnId, (Transaction, Vec<(RegionId, u64)>)>,

    /// Multi-home transactions the coordinator has already proposed.
    mh_seen: HashSet<TxnId>,

    num_emitted: u64,
}

impl Orderer {
    pub fn new(rx: internal::Rx<Envelope>, sender: Sender) -> Self {
        let config = sender.config().clone();
        let partition = config.partition_of(sender.id());
        let is_coordinator = config.mh_orderer() == sender.id();
        Orderer {
            rx,
            sender,
            config,
            partition,
            is_coordinator,
            pending: VecDeque::new(),
            batches: HashMap::new(),
            emitted_seq: HashMap::new(),
            committed_seq: HashMap::new(),
            mh_txns: HashMap::new(),
            mh_seen: HashSet::new(),
            num_emitted: 0,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::PaxosDeliver { value, .. }) => {
            if let LogValue::ShBatch(region, local_seq) = decode_value(value) {
                let committed = self.committed_seq.entry(region).or_insert(0);
                *committed = (*committed).max(local_seq);
            }
            self.pending.push_back(value);
            self.drain();
        }
        | Message::Request(Request::Batch(batch)) => {
            self.batches
                .entry(batch.region)
                .or_default()
                .insert(batch.local_seq, batch);
            self.drain();
        }
        | Message::Request(Request::ForwardTxn(txn)) => self.respond_mh_txn(*txn),
        | Message::Request(Request::MhTxnArrived { txn, observation_points }) => {
            self.mh_txns.entry(txn.id).or_insert((*txn, observation_points));
            self.drain();
        }
        | Message::Request(Request::Stats { level, .. }) => {
            let stats = Envelope::response(
                self.sender.id(),
                Response::Stats { module: ModuleId::MultiHomeOrderer, json: self.stats(level) },
            );
            self.sender.send(stats, from, message::SERVER);
        }
        | message => warn!("unexpected message at orderer: {:?}", message),
        }
    }

    /// A multi-home transaction reached its coordinator (directly from the
    /// forwarder or relayed by an involved sequencer; the first copy wins).
    fn respond_mh_txn(&mut self, txn: Transaction) {
        if !self.is_coordinator {
            // Misrouted; the coordinator is the only valid input queue.
            let forward = Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn)));
            self.sender.send(forward, self.config.mh_orderer(), message::MULTI_HOME_ORDERER);
            return;
        }
        if !self.mh_seen.insert(txn.id) {
            return;
        }

        // Capture where every involved region's log stood when this
        // transaction took its slot; all orderers will hold it until their
        // own queues pass these points.
        let observation_points: Vec<(RegionId, u64)> = txn
            .internal
            .involved_regions
            .iter()
            .map(|region| (*region, self.committed_seq.get(region).copied().unwrap_or(0)))
            .collect();

        let propose = Envelope::request(
            self.sender.id(),
            Request::PaxosPropose { value: mh_txn_value(txn.id) },
        );
        self.sender.send_local(propose, message::SEQUENCER_PAXOS);

        let arrived = Envelope::request(
            self.sender.id(),
            Request::MhTxnArrived { txn: Box::new(txn), observation_points },
        );
        let all: Vec<_> = self.config.all_machines().collect();
        self.sender.send_many(arrived, &all, message::MULTI_HOME_ORDERER);
    }

    /// Emit everything emittable from the head of the committed sequence.
    fn drain(&mut self) {
        while let Some(value) = self.pending.front().copied() {
            match decode_value(value) {
            | LogValue::ShBatch(region, local_seq) => {
                let batch = match self
                    .batches
                    .get_mut(&region)
                    .and_then(|queue| queue.remove(&local_seq))
                {
                | Some(batch) => batch,
                | None => return,
                };
                for txn in batch.txns {
                    self.emit(txn);
                }
                let emitted = self.emitted_seq.entry(region).or_insert(0);
                *emitted = (*emitted).max(local_seq);
            }
            | LogValue::MhTxn(txn_id) => {
                if !self.mh_ready(txn_id) {
                    return;
                }
                let (txn, _) = self.mh_txns.remove(&txn_id).expect("[INTERNAL ERROR]: ready MH txn vanished");
                self.emit(txn);
            }
            }
            self.pending.pop_front();
        }
    }

    /// A multi-home transaction emits once its content arrived and every
    /// involved region's queue has drained past its observation point.
    fn mh_ready(&self, txn_id: TxnId) -> bool {
        let (_, observation_points) = match self.mh_txns.get(&txn_id) {
        | Some(entry) => entry,
        | None => return false,
        };
        observation_points.iter().all(|(region, point)| {
            self.emitted_seq.get(region).copied().unwrap_or(0) >= *point
        })
    }

    /// Hand a transaction to the local scheduler if this partition is
    /// involved; every machine sees the full stream and keeps its share.
    fn emit(&mut self, mut txn: Transaction) {
        self.num_emitted += 1;
        if !txn.internal.involved_partitions.contains(&self.partition) {
            return;
        }
        txn.record(TxnEvent::EnterOrderer, self.sender.id());
        let forward = Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn)));
        self.sender.send_local(forward, message::SCHEDULER);
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "num_pending_slots": self.pending.len(),
            "num_buffered_batches": self.batches.values().map(BTreeMap::len).sum::<usize>(),
            "num_pending_mh_txns": self.mh_txns.len(),
            "num_emitted": self.num_emitted,
        });
        if level >= 1 {
            stats["emitted_seq"] = serde_json::Value::Array(
                self.emitted_seq
                    .iter()
                    .map(|(region, seq)| serde_json::json!([region, seq]))
                    .collect(),
            );
        }
        stats.to_string()
    }
}

impl Future for Orderer {
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
