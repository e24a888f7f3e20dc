//! # Summary
//!
//! This module defines the `ClockSynchronizer`, which periodically pings
//! peer machines and records an estimated clock skew per peer from the echo
//! and the measured round trip. The sequencer consults the table to decide
//! when a future-stamped transaction is due. Estimates are advisory;
//! correctness never depends on them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::RwLock;
use std::collections::HashMap as Map;

use crate::internal;
use crate::message::{self, Envelope, MachineId, Message, Request};
use crate::sender::Sender;
use crate::transaction::now_micros;

/// Estimated clock skew per peer, shared read-only with the sequencer.
#[derive(Default)]
pub struct SkewTable {
    offsets: RwLock<Map<MachineId, i64>>,
}

impl SkewTable {
    pub fn new() -> Self {
        SkewTable::default()
    }

    /// Estimated microseconds the peer's clock runs ahead of ours.
    pub fn skew(&self, peer: MachineId) -> i64 {
        self.offsets.read().get(&peer).copied().unwrap_or(0)
    }

    fn set(&self, peer: MachineId, skew: i64) {
        self.offsets.write().insert(peer, skew);
    }
}

pub struct ClockSynchronizer {
    rx: internal::Rx<Envelope>,
    sender: Sender,
    peers: Vec<MachineId>,
    tick: tokio::time::Interval,
    skew: Arc<SkewTable>,
}

impl ClockSynchronizer {
    pub fn new(rx: internal::Rx<Envelope>, sender: Sender, skew: Arc<SkewTable>) -> Self {
        let config = sender.config().clone();
        let period = std::time::Duration::from_millis(config.clock_interval_ms.max(1));
        // Jitter the first ping so co-started machines don't fire in phase.
        let jitter = std::time::Duration::from_millis(rand::random::<u64>() % (config.clock_interval_ms.max(1) / 2 + 1));
        let tick = tokio::time::interval_at(tokio::time::Instant::now() + period + jitter, period);
        let peers = config.all_machines().filter(|id| *id != sender.id()).collect();
        ClockSynchronizer { rx, sender, peers, tick, skew }
    }

    fn ping(&self) {
        let ping = Envelope::request(self.sender.id(), Request::ClockPing { time: now_micros() });
        self.sender.send_many(ping, &self.peers, message::CLOCK_SYNCHRONIZER);
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::ClockPing { time }) => {
            let pong = Envelope::request(
                self.sender.id(),
                Request::ClockPong { ping_time: time, peer_time: now_micros() },
            );
            self.sender.send(pong, from, message::CLOCK_SYNCHRONIZER);
        }
        | Message::Request(Request::ClockPong { ping_time, peer_time }) => {
            let now = now_micros();
            let rtt = now - ping_time;
            let skew = peer_time - (ping_time + rtt / 2);
            trace!("peer {} skew estimate {}us (rtt {}us)", from, skew, rtt);
            self.skew.set(from, skew);
        }
        | message => warn!("unexpected message at clock synchronizer: {:?}", message),
        }
    }
}

impl Future for ClockSynchronizer {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        while this.tick.poll_tick(cx).is_ready() {
            this.ping();
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
