//! # Summary
//!
//! This module defines the `Forwarder`, which resolves the home region of
//! every key of an incoming transaction, stamps the observed metadata into
//! it, classifies it as single-home or multi-home, and routes it to the
//! right sequencers. Keys without any known mastership default to the local
//! region. Transactions touching a key with a remaster in flight wait in a
//! buffer until the decision commits, then resolve afresh.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::{HashMap, HashSet};

use crate::config::{Config, LockManagerMode};
use crate::internal;
use crate::message::{self, Envelope, Message, ModuleId, Request, Response};
use crate::sender::Sender;
use crate::storage::MetadataInitializer;
use crate::transaction::{Key, Metadata, Transaction, TxnEvent};

pub struct Forwarder {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,

    /// Computes mastership for keys never seen before; absent, the local
    /// region is assumed.
    initializer: Option<Box<dyn MetadataInitializer>>,

    /// Routing cache: initializer defaults plus committed remasters.
    metadata: HashMap<Key, Metadata>,

    /// Keys with a remaster decision in flight.
    in_remaster: HashSet<Key>,

    /// Transactions waiting for a remaster to commit.
    buffered: Vec<Transaction>,

    num_forwarded: u64,
}

impl Forwarder {
    pub fn new(
        rx: internal::Rx<Envelope>,
        sender: Sender,
        initializer: Option<Box<dyn MetadataInitializer>>,
    ) -> Self {
        let config = sender.config().clone();
        let mut metadata = HashMap::new();
        for (key, master) in &config.metadata_overrides {
            metadata.insert(
                key.clone().into_bytes(),
                Metadata { master: *master, counter: 0 },
            );
        }
        Forwarder {
            rx,
            sender,
            config,
            initializer,
            metadata,
            in_remaster: HashSet::new(),
            buffered: Vec::new(),
            num_forwarded: 0,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::ForwardTxn(mut txn)) => {
            txn.record(TxnEvent::EnterForwarder, self.sender.id());
            self.resolve(*txn);
        }
        | Message::Request(Request::Remastered { keys }) => self.respond_remastered(keys),
        | Message::Request(Request::Stats { level, .. }) => {
            let stats = Envelope::response(
                self.sender.id(),
                Response::Stats { module: ModuleId::Forwarder, json: self.stats(level) },
            );
            self.sender.send(stats, from, message::SERVER);
        }
        | message => warn!("unexpected message at forwarder: {:?}", message),
        }
    }

    /// Look up a key's mastership: cache, then initializer, then the local
    /// region as the bootstrap default.
    fn lookup(&self, key: &[u8]) -> Metadata {
        if let Some(metadata) = self.metadata.get(key) {
            return *metadata;
        }
        match &self.initializer {
        | Some(initializer) => initializer.compute(key),
        | None => Metadata {
            master: self.config.region_of(self.sender.id()),
            counter: 0,
        },
        }
    }

    fn resolve(&mut self, mut txn: Transaction) {
        if txn.keys.iter().any(|e| self.in_remaster.contains(&e.key)) {
            debug!("buffering txn {} behind an in-flight remaster", txn.id);
            self.buffered.push(txn);
            return;
        }

        let mut homes = BTreeSet::new();
        let mut partitions = BTreeSet::new();
        for entry in &mut txn.keys {
            let metadata = self.lookup(&entry.key);
            entry.metadata = Some(metadata);
            homes.insert(metadata.master);
            partitions.insert(self.config.partition_of_key(&entry.key));
        }

        txn.internal.involved_regions = homes.iter().copied().collect();
        txn.internal.involved_partitions = partitions.iter().copied().collect();
        txn.internal.multi_home = homes.len() > 1;
        txn.internal.multi_partition = partitions.len() > 1;
        txn.internal.home = if homes.len() == 1 { homes.iter().next().copied() } else { None };

        if txn.is_remaster() {
            for entry in &txn.keys {
                self.in_remaster.insert(entry.key.clone());
            }
        }

        txn.record(TxnEvent::ExitForwarder, self.sender.id());
        self.num_forwarded += 1;

        if !txn.internal.multi_home {
            let home = txn.internal.home.unwrap_or_else(|| self.config.region_of(self.sender.id()));
            let dest = self.config.sequencer_for(home);
            self.sender.send(
                Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn))),
                dest,
                message::SEQUENCER,
            );
            return;
        }

        // Multi-home: every involved region's sequencer gets a copy. Outside
        // of DDR mode the multi-home orderer additionally gets one directly;
        // the sequencers forward theirs too, and the orderer keeps the first.
        let regions = txn.internal.involved_regions.clone();
        for region in regions {
            let dest = self.config.sequencer_for(region);
            self.sender.send(
                Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn.clone()))),
                dest,
                message::SEQUENCER,
            );
        }
        if self.config.lock_manager != LockManagerMode::Ddr {
            self.sender.send(
                Envelope::request(self.sender.id(), Request::ForwardTxn(Box::new(txn))),
                self.config.mh_orderer(),
                message::MULTI_HOME_ORDERER,
            );
        }
    }

    /// Apply a committed remaster and re-resolve everything it unblocked.
    fn respond_remastered(&mut self, keys: Vec<(Key, Metadata)>) {
        for (key, metadata) in keys {
            let known = self.metadata.get(&key).map(|m| m.counter).unwrap_or(0);
            if metadata.counter > known || !self.metadata.contains_key(&key) {
                self.metadata.insert(key.clone(), metadata);
            }
            self.in_remaster.remove(&key);
        }
        for txn in std::mem::take(&mut self.buffered) {
            self.resolve(txn);
        }
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "num_pending_txns": self.buffered.len(),
            "num_cached_keys": self.metadata.len(),
            "num_forwarded": self.num_forwarded,
        });
        if level >= 1 {
            stats["pending_txns"] = serde_json::Value::Array(
                self.buffered.iter().map(|t| serde_json::json!(t.id)).collect(),
            );
        }
        stats.to_string()
    }
}

impl Future for Forwarder {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MachineId;
    use crate::transaction::KeyMode;

    /// A forwarder on a one-region grid whose sequencer and orderer
    /// channels are captured locally.
    fn harness(
        overrides: Vec<(String, u32)>,
        regions: u32,
    ) -> (internal::Tx<Envelope>, internal::Rx<Envelope>, internal::Rx<Envelope>, Sender) {
        let mut config = crate::config::Config::localhost(regions, 1, 1, 27000);
        config.metadata_overrides = overrides;
        let sender = Sender::new(MachineId(0), Arc::new(config));

        let (forwarder_rx, forwarder_tx) = internal::new();
        sender.register(message::FORWARDER, forwarder_tx.clone());
        let (sequencer_rx, sequencer_tx) = internal::new();
        sender.register(message::SEQUENCER, sequencer_tx);
        let (orderer_rx, orderer_tx) = internal::new();
        sender.register(message::MULTI_HOME_ORDERER, orderer_tx);

        tokio::spawn(Forwarder::new(forwarder_rx, sender.clone(), None));
        (forwarder_tx, sequencer_rx, orderer_rx, sender)
    }

    async fn next_txn(rx: &mut internal::Rx<Envelope>) -> Transaction {
        let envelope = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a forwarded txn")
            .expect("forwarder hung up");
        match envelope.message {
        | Message::Request(Request::ForwardTxn(txn)) => *txn,
        | message => panic!("unexpected {:?}", message),
        }
    }

    fn submit(tx: &internal::Tx<Envelope>, txn: Transaction) {
        tx.send(Envelope::request(MachineId(0), Request::ForwardTxn(Box::new(txn))));
    }

    #[tokio::test]
    async fn unknown_keys_default_to_the_local_region() {
        let (tx, mut sequencer_rx, _orderer_rx, _sender) = harness(Vec::new(), 1);
        let mut txn = Transaction::new(vec![(b"mystery".to_vec(), KeyMode::Read)], Vec::new());
        txn.id = 1;
        submit(&tx, txn);

        let forwarded = next_txn(&mut sequencer_rx).await;
        assert_eq!(forwarded.internal.home, Some(0));
        assert!(!forwarded.internal.multi_home);
        assert_eq!(forwarded.keys[0].metadata, Some(Metadata { master: 0, counter: 0 }));
        assert!(forwarded.has_event(TxnEvent::EnterForwarder));
        assert!(forwarded.has_event(TxnEvent::ExitForwarder));
    }

    #[tokio::test]
    async fn keys_spanning_regions_classify_as_multi_home() {
        let overrides = vec![("k1".to_string(), 0), ("k2".to_string(), 1)];
        let (tx, mut sequencer_rx, mut orderer_rx, _sender) = harness(overrides, 2);
        let mut txn = Transaction::new(
            vec![(b"k1".to_vec(), KeyMode::Write), (b"k2".to_vec(), KeyMode::Write)],
            Vec::new(),
        );
        txn.id = 2;
        submit(&tx, txn);

        // The local (region 0) sequencer copy and the orderer copy are both
        // observable; the region 1 copy leaves the machine.
        let sequenced = next_txn(&mut sequencer_rx).await;
        assert!(sequenced.internal.multi_home);
        assert_eq!(sequenced.internal.involved_regions, vec![0, 1]);

        let ordered = next_txn(&mut orderer_rx).await;
        assert_eq!(ordered.id, 2);
        assert!(ordered.internal.multi_home);
    }

    #[tokio::test]
    async fn txns_buffer_behind_an_in_flight_remaster() {
        let (tx, mut sequencer_rx, _orderer_rx, _sender) = harness(Vec::new(), 1);

        let mut remaster = Transaction::new_remaster(vec![b"k1".to_vec()], 0);
        remaster.id = 1;
        submit(&tx, remaster);
        assert_eq!(next_txn(&mut sequencer_rx).await.id, 1);

        // A follow-up touching the same key waits for the decision.
        let mut blocked = Transaction::new(vec![(b"k1".to_vec(), KeyMode::Write)], Vec::new());
        blocked.id = 2;
        submit(&tx, blocked);
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            sequencer_rx.recv(),
        ).await;
        assert!(waited.is_err(), "txn must buffer until the remaster commits");

        tx.send(Envelope::request(MachineId(0), Request::Remastered {
            keys: vec![(b"k1".to_vec(), Metadata { master: 0, counter: 1 })],
        }));
        let released = next_txn(&mut sequencer_rx).await;
        assert_eq!(released.id, 2);
        assert_eq!(released.keys[0].metadata, Some(Metadata { master: 0, counter: 1 }));
    }
}
