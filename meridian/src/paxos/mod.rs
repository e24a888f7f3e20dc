//! # Summary
//!
//! This module implements simulated multi-Paxos: agreement on a totally
//! ordered sequence of opaque `u64` values among a static membership, with
//! the initially elected leader never changing. Two independent groups run
//! on every machine — one ordering the sequencer log, one committing
//! remaster decisions — each as a channel-addressed reactor.
//!
//! Committed values are handed upstream as local `PaxosDeliver` envelopes,
//! at most once per slot and always in slot order; commits that arrive out
//! of order wait in a buffer until the gap fills.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::config::PaxosMembers;
use crate::internal;
use crate::message::{Channel, Envelope, Message, Request, Response};
use crate::sender::Sender;

mod acceptor;
mod leader;

pub use self::acceptor::Acceptor;
pub use self::leader::Leader;

pub struct Paxos {
    /// Channel this group answers on (`SEQUENCER_PAXOS` or `REMASTER_PAXOS`).
    channel: Channel,

    rx: internal::Rx<Envelope>,
    sender: Sender,
    members: PaxosMembers,

    /// Every machine runs the leader logic; only the elected one opens
    /// instances, the rest forward proposals to it.
    leader: Leader,

    /// Present iff this machine is a voter of the group.
    acceptor: Option<Acceptor>,

    /// Whether this machine learns commits.
    is_learner: bool,

    /// Next slot to deliver upstream.
    next_deliver: u64,

    /// Committed values waiting for earlier slots.
    commits: BTreeMap<u64, u64>,

    /// Local channels that receive `PaxosDeliver` envelopes.
    user_channels: Vec<Channel>,
}

impl Paxos {
    pub fn new(
        channel: Channel,
        rx: internal::Rx<Envelope>,
        sender: Sender,
        members: PaxosMembers,
        user_channels: Vec<Channel>,
    ) -> Self {
        let me = sender.id();
        let leader = Leader::new(me, &members);
        let acceptor = if members.acceptors.contains(&me) {
            Some(Acceptor::new())
        } else {
            None
        };
        let is_learner = members.learners.contains(&me);
        Paxos {
            channel,
            rx,
            sender,
            members,
            leader,
            acceptor,
            is_learner,
            next_deliver: 0,
            commits: BTreeMap::new(),
            user_channels,
        }
    }

    fn respond(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
        | Message::Request(Request::PaxosPropose { value }) => {
            self.leader.respond_propose(value, &self.sender, self.channel, &self.members);
        }
        | Message::Request(Request::PaxosAccept { ballot, slot, value }) => {
            if let Some(acceptor) = &mut self.acceptor {
                acceptor.respond_accept(from, ballot, slot, value, &self.sender, self.channel);
            }
        }
        | Message::Request(Request::PaxosCommit { slot, value, leader }) => {
            self.respond_commit(slot, value, leader);
        }
        | Message::Response(Response::PaxosAcceptOk { ballot, slot }) => {
            self.leader.respond_accept_ok(ballot, slot, &self.sender, self.channel, &self.members);
        }
        | Message::Response(Response::PaxosCommitOk { slot }) => {
            self.leader.respond_commit_ok(slot);
        }
        | message => warn!("unexpected message on paxos channel {}: {:?}", self.channel, message),
        }
    }

    /// Acknowledge the commit and deliver it upstream in slot order.
    fn respond_commit(&mut self, slot: u64, value: u64, leader: crate::message::MachineId) {
        let ack = Envelope::response(self.sender.id(), Response::PaxosCommitOk { slot });
        self.sender.send(ack, leader, self.channel);

        if !self.is_learner || slot < self.next_deliver {
            return;
        }
        self.commits.entry(slot).or_insert(value);
        while let Some(value) = self.commits.remove(&self.next_deliver) {
            trace!("delivering slot {} value {:#x}", self.next_deliver, value);
            for channel in &self.user_channels {
                let deliver = Envelope::request(
                    self.sender.id(),
                    Request::PaxosDeliver { slot: self.next_deliver, value },
                );
                self.sender.send_local(deliver, *channel);
            }
            self.next_deliver += 1;
        }
    }
}

impl Future for Paxos {
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
    use std::sync::Arc;

    use crate::config::Config;
    use crate::message::{self, MachineId};

    fn single_machine_paxos() -> (Sender, internal::Rx<Envelope>) {
        let config = Arc::new(Config::localhost(1, 1, 1, 23000));
        let sender = Sender::new(MachineId(0), config);

        let (paxos_rx, paxos_tx) = internal::new();
        sender.register(message::SEQUENCER_PAXOS, paxos_tx);
        let (user_rx, user_tx) = internal::new();
        sender.register(message::MULTI_HOME_ORDERER, user_tx);

        let members = sender.config().log_members();
        let paxos = Paxos::new(
            message::SEQUENCER_PAXOS,
            paxos_rx,
            sender.clone(),
            members,
            vec![message::MULTI_HOME_ORDERER],
        );
        tokio::spawn(paxos);
        (sender, user_rx)
    }

    #[tokio::test]
    async fn proposals_commit_in_slot_order() {
        let (sender, mut user_rx) = single_machine_paxos();
        for value in [7u64, 9, 11] {
            let propose = Envelope::request(sender.id(), Request::PaxosPropose { value });
            sender.send_local(propose, message::SEQUENCER_PAXOS);
        }
        let mut delivered = Vec::new();
        for _ in 0..3 {
            match user_rx.recv().await.unwrap().message {
            | Message::Request(Request::PaxosDeliver { slot, value }) => delivered.push((slot, value)),
            | message => panic!("unexpected {:?}", message),
            }
        }
        assert_eq!(delivered, vec![(0, 7), (1, 9), (2, 11)]);
    }

    #[tokio::test]
    async fn duplicate_proposals_commit_once() {
        let (sender, mut user_rx) = single_machine_paxos();
        for _ in 0..3 {
            let propose = Envelope::request(sender.id(), Request::PaxosPropose { value: 42 });
            sender.send_local(propose, message::SEQUENCER_PAXOS);
        }
        let first = user_rx.recv().await.unwrap();
        match first.message {
        | Message::Request(Request::PaxosDeliver { slot: 0, value: 42 }) => (),
        | message => panic!("unexpected {:?}", message),
        }
        let followup = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            user_rx.recv(),
        ).await;
        assert!(followup.is_err(), "duplicate value must not commit twice");
    }
}
