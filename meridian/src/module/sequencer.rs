//! # Summary
//!
//! This module defines the `Sequencer`: one machine per region accumulates
//! that region's single-home transactions, seals them into numbered batches
//! on a timer tick, and proposes each batch id to the shared log Paxos. The
//! sequencer is itself a learner of the log group; it replicates a batch's
//! content to every machine's orderer only once it has seen its own batch id
//! commit, so content never travels ahead of its order.
//!
//! Transactions stamped with a future timestamp wait in a min-heap and
//! drain on the tick once the (skew-adjusted) local clock catches up.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::HashMap;

use crate::config::{Config, LockManagerMode};
use crate::internal;
use crate::message::{self, Batch, Envelope, Message, ModuleId, Request, Response};
use crate::module::clock::SkewTable;
use crate::sender::Sender;
use crate::transaction::{now_micros, RegionId, Transaction, TxnEvent, TxnId};

pub struct Sequencer {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,
    region: RegionId,

    /// Sequence number of the next batch. Strictly increasing.
    local_seq: u64,

    /// Transactions of the batch currently being accumulated.
    accumulator: Vec<Transaction>,

    /// Sealed batches keyed by log value, waiting for their commit.
    sealed: HashMap<u64, Batch>,

    /// Future transactions, keyed by release time.
    future: BinaryHeap<Reverse<(i64, TxnId)>>,
    future_txns: HashMap<TxnId, Transaction>,

    batch_tick: tokio::time::Interval,
    skew: Arc<SkewTable>,

    num_batches: u64,
}

impl Sequencer {
    pub fn new(rx: internal::Rx<Envelope>, sender: Sender, skew: Arc<SkewTable>) -> Self {
        let config = sender.config().clone();
        let region = config.region_of(sender.id());
        let batch_tick = tokio::time::interval(std::time::Duration::from_millis(
            config.batch_interval_ms.max(1),
        ));
        Sequencer {
            rx,
            sender,
            config,
            region,
            // Sequence numbers start at 1; 0 is the "nothing yet" watermark
            // in the orderer's bookkeeping.
            local_seq: 1,
            accumulator: Vec::new(),
            sealed: HashMap::new(),
            future: BinaryHeap::new(),
            future_txns: HashMap::new(),
            batch_tick,
            skew,
            num_batches: 0,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::ForwardTxn(mut txn)) => {
            txn.record(TxnEvent::EnterSequencer, self.sender.id());
            self.respond_txn(*txn);
        }
        | Message::Request(Request::PaxosDeliver { value, .. }) => self.respond_commit(value),
        | Message::Request(Request::Stats { level, .. }) => {
            let stats = Envelope::response(
                self.sender.id(),
                Response::Stats { module: ModuleId::Sequencer, json: self.stats(level) },
            );
            self.sender.send(stats, from, message::SERVER);
        }
        | message => warn!("unexpected message at sequencer: {:?}", message),
        }
    }

    fn respond_txn(&mut self, mut txn: Transaction) {
        if txn.internal.multi_home {
            if self.config.lock_manager == LockManagerMode::Ddr {
                // Leave a lock-only piece in this region's log; the
                // schedulers lock each region's keys as its piece arrives.
                txn.internal.lock_only_home = Some(self.region);
                self.accumulator.push(txn);
            } else {
                let forward = Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn)));
                self.sender.send(forward, self.config.mh_orderer(), message::MULTI_HOME_ORDERER);
            }
            return;
        }

        let release_at = txn.timestamp - self.skew.skew(txn.internal.coordinator);
        if release_at > now_micros() {
            trace!("holding future txn {} until {}", txn.id, release_at);
            self.future.push(Reverse((release_at, txn.id)));
            self.future_txns.insert(txn.id, txn);
        } else {
            self.accumulator.push(txn);
        }
    }

    /// Release due future transactions and seal the accumulator if it has
    /// anything in it. Empty ticks produce no batch.
    fn tick(&mut self) {
        let now = now_micros();
        while let Some(Reverse((release_at, txn_id))) = self.future.peek().copied() {
            if release_at > now {
                break;
            }
            self.future.pop();
            if let Some(txn) = self.future_txns.remove(&txn_id) {
                self.accumulator.push(txn);
            }
        }
        if self.accumulator.is_empty() {
            return;
        }

        let batch = Batch {
            region: self.region,
            local_seq: self.local_seq,
            txns: std::mem::take(&mut self.accumulator),
        };
        self.local_seq += 1;
        self.num_batches += 1;
        let value = batch.value();
        debug!("sealed batch {}/{} with {} txns", batch.region, batch.local_seq, batch.txns.len());
        self.sealed.insert(value, batch);
        let propose = Envelope::request(self.sender.id(), Request::PaxosPropose { value });
        self.sender.send_local(propose, message::SEQUENCER_PAXOS);
    }

    /// Our batch id committed: replicate its content everywhere, nearest
    /// peers first.
    fn respond_commit(&mut self, value: u64) {
        let mut batch = match self.sealed.remove(&value) {
        | Some(batch) => batch,
        | None => return,
        };
        for txn in &mut batch.txns {
            txn.record(TxnEvent::ExitSequencerInBatch, self.sender.id());
        }
        let mut destinations = self.config.machines_by_distance(self.sender.id());
        destinations.push(self.sender.id());
        let replicate = Envelope::request(self.sender.id(), Request::Batch(batch));
        self.sender.send_many(replicate, &destinations, message::MULTI_HOME_ORDERER);
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "batch_size": self.accumulator.len(),
            "num_future_txns": self.future_txns.len(),
            "num_batches": self.num_batches,
            "local_seq": self.local_seq,
        });
        if level >= 1 {
            stats["future_txns"] = serde_json::Value::Array(
                self.future
                    .iter()
                    .map(|entry| {
                        let (at, id) = entry.0;
                        serde_json::json!([at, id])
                    })
                    .collect(),
            );
        }
        stats.to_string()
    }
}

impl Future for Sequencer {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        while this.batch_tick.poll_tick(cx).is_ready() {
            this.tick();
        }
        loop {
            match this.rx.poll(cx) {
            | Poll::Ready(Some(envelope)) => this.respond(envelope),
            | Poll::Ready(None) => return Poll::Ready(()),
            | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_value, LogValue, MachineId, Message};
    use crate::transaction::KeyMode;

    fn harness() -> (internal::Tx<Envelope>, internal::Rx<Envelope>, internal::Rx<Envelope>) {
        let mut config = Config::localhost(1, 1, 1, 28000);
        config.batch_interval_ms = 1;
        let sender = Sender::new(MachineId(0), Arc::new(config));

        let (sequencer_rx, sequencer_tx) = internal::new();
        sender.register(message::SEQUENCER, sequencer_tx.clone());
        let (paxos_rx, paxos_tx) = internal::new();
        sender.register(message::SEQUENCER_PAXOS, paxos_tx);
        let (orderer_rx, orderer_tx) = internal::new();
        sender.register(message::MULTI_HOME_ORDERER, orderer_tx);

        let skew = Arc::new(SkewTable::new());
        tokio::spawn(Sequencer::new(sequencer_rx, sender, skew));
        (sequencer_tx, paxos_rx, orderer_rx)
    }

    async fn recv(rx: &mut internal::Rx<Envelope>) -> Request {
        let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("sequencer hung up");
        match envelope.message {
        | Message::Request(request) => request,
        | message => panic!("unexpected {:?}", message),
        }
    }

    fn sh_txn(id: u64) -> Transaction {
        let mut txn = Transaction::new(vec![(b"k".to_vec(), KeyMode::Write)], Vec::new());
        txn.id = id;
        txn.internal.involved_regions = vec![0];
        txn.internal.involved_partitions = vec![0];
        txn
    }

    #[tokio::test]
    async fn batches_propose_then_replicate_on_commit() {
        let (tx, mut paxos_rx, mut orderer_rx) = harness();
        tx.send(Envelope::request(
            MachineId(0),
            Request::ForwardTxn(Box::new(sh_txn(7))),
        ));

        let value = match recv(&mut paxos_rx).await {
        | Request::PaxosPropose { value } => value,
        | request => panic!("unexpected {:?}", request),
        };
        assert_eq!(decode_value(value), LogValue::ShBatch(0, 1));

        // Content is held back until the batch id commits.
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            orderer_rx.recv(),
        ).await;
        assert!(early.is_err(), "content must not outrun its commit");

        tx.send(Envelope::request(
            MachineId(0),
            Request::PaxosDeliver { slot: 0, value },
        ));
        match recv(&mut orderer_rx).await {
        | Request::Batch(batch) => {
            assert_eq!(batch.region, 0);
            assert_eq!(batch.local_seq, 1);
            assert_eq!(batch.txns.len(), 1);
            assert_eq!(batch.txns[0].id, 7);
            assert!(batch.txns[0].has_event(TxnEvent::ExitSequencerInBatch));
        }
        | request => panic!("unexpected {:?}", request),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_batch() {
        let (tx, mut paxos_rx, _orderer_rx) = harness();
        tx.send(Envelope::request(MachineId(0), Request::ForwardTxn(Box::new(sh_txn(1)))));
        let first = match recv(&mut paxos_rx).await {
        | Request::PaxosPropose { value } => value,
        | request => panic!("unexpected {:?}", request),
        };
        tx.send(Envelope::request(MachineId(0), Request::ForwardTxn(Box::new(sh_txn(2)))));
        let second = match recv(&mut paxos_rx).await {
        | Request::PaxosPropose { value } => value,
        | request => panic!("unexpected {:?}", request),
        };
        match (decode_value(first), decode_value(second)) {
        | (LogValue::ShBatch(0, a), LogValue::ShBatch(0, b)) => assert!(b > a),
        | other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn future_txns_wait_for_their_timestamp() {
        let (tx, mut paxos_rx, _orderer_rx) = harness();
        let mut txn = sh_txn(9);
        txn.timestamp = now_micros() + 200_000;
        tx.send(Envelope::request(MachineId(0), Request::ForwardTxn(Box::new(txn))));

        let early = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            paxos_rx.recv(),
        ).await;
        assert!(early.is_err(), "future txn must wait for its release time");

        // After the timestamp passes, the next tick seals it.
        match tokio::time::timeout(std::time::Duration::from_secs(5), paxos_rx.recv())
            .await
            .expect("future txn never released")
            .expect("sequencer hung up")
            .message
        {
        | Message::Request(Request::PaxosPropose { value }) => {
            assert_eq!(decode_value(value), LogValue::ShBatch(0, 1));
        }
        | message => panic!("unexpected {:?}", message),
        }
    }
}
