//! # Summary
//!
//! This module defines the `Server`: the component that owes clients their
//! replies. It admits transactions (assigning cluster-unique ids and
//! rejecting malformed ones at the edge), aggregates per-partition results
//! until every involved partition of its own (region, replica) reported,
//! answers stats queries by fanning an envelope to the module in question,
//! and flushes metrics counters on request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hashbrown::{HashMap, HashSet};

use crate::config::Config;
use crate::execution::validate_code;
use crate::internal;
use crate::message::{
    self, ApiResponse, Envelope, MachineId, Message, ModuleId, Request, Response,
};
use crate::sender::Sender;
use crate::transaction::{PartitionId, Transaction, TxnEvent, TxnId, TxnStatus};

/// A transaction admitted here and not yet fully answered.
struct PendingResponse {
    client: u64,

    /// Involved partitions, learned from the first result.
    expected: Option<HashSet<PartitionId>>,

    arrived: HashSet<PartitionId>,
    merged: Option<Transaction>,
}

pub struct Server {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    config: Arc<Config>,
    id: MachineId,

    /// Admission counter; ids are `seq << 16 | machine`.
    next_seq: u64,

    pending: HashMap<TxnId, PendingResponse>,

    /// Clients waiting on a stats reply, per queried module.
    stats_waiters: HashMap<ModuleId, Vec<u64>>,

    num_admitted: u64,
    num_completed: u64,
    num_aborted: u64,
}

impl Server {
    pub fn new(rx: internal::Rx<Envelope>, sender: Sender) -> Self {
        let config = sender.config().clone();
        let id = sender.id();
        Server {
            rx,
            sender,
            config,
            id,
            next_seq: 1,
            pending: HashMap::new(),
            stats_waiters: HashMap::new(),
            num_admitted: 0,
            num_completed: 0,
            num_aborted: 0,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::ClientTxn { client, txn }) => self.respond_client_txn(client, *txn),
        | Message::Request(Request::TxnResult { txn, partition }) => {
            self.respond_result(*txn, partition);
        }
        | Message::Request(Request::ClientStats { client, module, level }) => {
            self.respond_client_stats(client, module, level);
        }
        | Message::Request(Request::ClientMetrics { client, prefix }) => {
            self.respond_client_metrics(client, prefix);
        }
        | Message::Request(Request::Stats { level, .. }) => {
            let stats = Envelope::response(
                self.id,
                Response::Stats { module: ModuleId::Server, json: self.stats(level) },
            );
            self.sender.send(stats, from, message::SERVER);
        }
        | Message::Response(Response::Stats { module, json }) => {
            for client in self.stats_waiters.remove(&module).unwrap_or_default() {
                self.sender.send_client(client, ApiResponse::Stats { json: json.clone() });
            }
        }
        | message => warn!("unexpected message at server: {:?}", message),
        }
    }

    /// Admission: validate, stamp, and hand to the local forwarder. A
    /// malformed transaction is answered immediately and touches no state.
    fn respond_client_txn(&mut self, client: u64, mut txn: Transaction) {
        let invalid = if txn.keys.is_empty() {
            Some("transaction accesses no keys".to_string())
        } else if txn.is_remaster() && !txn.code.is_empty() {
            Some("remaster transaction carries code".to_string())
        } else if !txn.is_remaster() {
            validate_code(&txn.code).err()
        } else {
            None
        };
        if let Some(reason) = invalid {
            txn.abort(reason);
            txn.record(TxnEvent::Abort, self.id);
            self.sender.send_client(client, ApiResponse::Txn { txn: Box::new(txn) });
            return;
        }

        txn.id = (self.next_seq << 16) | self.id.0 as u64;
        self.next_seq += 1;
        txn.internal.coordinator = self.id;
        txn.record(TxnEvent::EnterServer, self.id);
        self.num_admitted += 1;

        self.pending.insert(txn.id, PendingResponse {
            client,
            expected: None,
            arrived: HashSet::new(),
            merged: None,
        });

        let forward = Envelope::request(self.id, Request::ForwardTxn(Box::new(txn)));
        self.sender.send_local(forward, message::FORWARDER);
    }

    /// One partition's result. The reply goes out once every involved
    /// partition of this (region, replica) has reported.
    fn respond_result(&mut self, txn: Transaction, partition: PartitionId) {
        let txn_id = txn.id;
        let complete = match self.pending.get_mut(&txn_id) {
        | Some(pending) => {
            if !pending.arrived.insert(partition) {
                return;
            }
            if pending.expected.is_none() {
                pending.expected =
                    Some(txn.internal.involved_partitions.iter().copied().collect());
            }
            match &mut pending.merged {
            | Some(merged) => merge(merged, txn),
            | None => pending.merged = Some(txn),
            }
            let expected = pending.expected.as_ref().expect("[INTERNAL ERROR]: no expected set");
            expected.iter().all(|p| pending.arrived.contains(p))
        }
        | None => {
            debug!("dropping result for unknown txn {}", txn_id);
            return;
        }
        };
        if !complete {
            return;
        }

        let pending = self.pending.remove(&txn_id).expect("[INTERNAL ERROR]: pending vanished");
        let mut txn = pending.merged.expect("[INTERNAL ERROR]: complete without result");
        txn.record(TxnEvent::ReturnToServer, self.id);
        self.num_completed += 1;
        if txn.status == TxnStatus::Aborted {
            self.num_aborted += 1;
        }
        self.sender.send_client(pending.client, ApiResponse::Txn { txn: Box::new(txn) });
    }

    fn respond_client_stats(&mut self, client: u64, module: ModuleId, level: u32) {
        if module == ModuleId::Server {
            let json = self.stats(level);
            self.sender.send_client(client, ApiResponse::Stats { json });
            return;
        }
        self.stats_waiters.entry(module).or_default().push(client);
        let query = Envelope::request(self.id, Request::Stats { module, level });
        self.sender.send_local(query, module.channel());
    }

    /// Flush the admission counters as JSON under the given prefix.
    fn respond_client_metrics(&mut self, client: u64, prefix: String) {
        let metrics = serde_json::json!({
            "txns_admitted": self.num_admitted,
            "txns_completed": self.num_completed,
            "txns_aborted": self.num_aborted,
        });
        let path = format!("{}metrics.json", prefix);
        if let Err(error) = std::fs::write(&path, metrics.to_string()) {
            warn!("failed to flush metrics to {}: {}", path, error);
        }
        self.sender.send_client(client, ApiResponse::Metrics);
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "txn_id_counter": self.next_seq,
            "num_pending_responses": self.pending.len(),
            "num_admitted": self.num_admitted,
            "num_completed": self.num_completed,
        });
        if level >= 1 {
            stats["pending_responses"] = serde_json::Value::Array(
                self.pending
                    .iter()
                    .map(|(txn_id, p)| serde_json::json!([txn_id, p.client]))
                    .collect(),
            );
        }
        stats.to_string()
    }
}

/// Fold one partition's result into the merged reply. Aborts win; result
/// sets and traces accumulate.
fn merge(into: &mut Transaction, part: Transaction) {
    if part.status == TxnStatus::Aborted && into.status != TxnStatus::Aborted {
        into.status = TxnStatus::Aborted;
        into.abort_reason = part.abort_reason.clone();
    }
    into.reads.extend(part.reads);
    into.writes.extend(part.writes);
    into.deletes.extend(part.deletes);
    into.internal.events.extend(part.internal.events);
}

impl Future for Server {
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
