//! # Summary
//!
//! This module defines the `Acceptor` half of a Paxos group: the
//! distributed memory. An acceptor acknowledges any accept request whose
//! ballot is at least the highest it has seen. With a fixed elected leader
//! there is no competing ballot in steady state, so the reject path is
//! never taken; the ballot check is what makes the safety argument local.

use crate::message::{Channel, Envelope, MachineId, Response};
use crate::sender::Sender;

pub struct Acceptor {
    /// Highest ballot seen.
    ballot: u32,
}

impl Acceptor {
    pub fn new() -> Self {
        Acceptor { ballot: 0 }
    }

    /// Acknowledge an accept request to its sending leader.
    pub fn respond_accept(
        &mut self,
        from: MachineId,
        ballot: u32,
        slot: u64,
        value: u64,
        sender: &Sender,
        channel: Channel,
    ) {
        if ballot < self.ballot {
            debug!("ignoring stale ballot {} for slot {}", ballot, slot);
            return;
        }
        self.ballot = ballot;
        trace!("accepting value {:#x} for slot {}", value, slot);
        let ok = Envelope::response(sender.id(), Response::PaxosAcceptOk { ballot, slot });
        sender.send(ok, from, channel);
    }
}
