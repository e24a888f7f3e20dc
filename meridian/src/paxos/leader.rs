//! # Summary
//!
//! This module defines the `Leader` half of a Paxos group: the elected
//! machine opens one instance per proposed value, gathers acceptor
//! acknowledgements to a quorum, announces commits to the learners, and
//! evicts instances once every learner acknowledged. Machines that are not
//! the elected leader forward proposals to it; the election never changes.

use std::collections::HashMap as Map;
use std::collections::HashSet as Set;

use crate::config::PaxosMembers;
use crate::message::{Channel, Envelope, MachineId, Request};
use crate::sender::Sender;

/// One consensus slot in flight at the leader.
struct Instance {
    value: u64,
    num_accepts: usize,
    num_commits: usize,
}

pub struct Leader {
    me: MachineId,

    /// Whether this machine is the initially elected leader.
    is_elected: bool,

    /// The elected leader; proposals from non-elected machines go here.
    elected: MachineId,

    /// Position of this machine among the acceptors, doubling as its ballot.
    ballot: u32,

    /// Next slot to open. Strictly monotone.
    next_slot: u64,

    instances: Map<u64, Instance>,

    /// Values already proposed, so re-proposals (e.g. the same remaster
    /// voted by several schedulers) collapse into one slot.
    proposed: Set<u64>,

    /// Total learners; instances evict once all have acknowledged.
    num_learners: usize,
}

impl Leader {
    pub fn new(me: MachineId, members: &PaxosMembers) -> Self {
        let position = members.acceptors.iter().position(|id| *id == me);
        Leader {
            me,
            is_elected: position == Some(0),
            elected: members.leader(),
            ballot: position.unwrap_or(0) as u32,
            next_slot: 0,
            instances: Map::new(),
            proposed: Set::new(),
            num_learners: members.learners.len(),
        }
    }

    /// Open a new instance for the value, or forward to the elected leader.
    pub fn respond_propose(
        &mut self,
        value: u64,
        sender: &Sender,
        channel: Channel,
        members: &PaxosMembers,
    ) {
        if !self.is_elected {
            let propose = Envelope::request(self.me, Request::PaxosPropose { value });
            sender.send(propose, self.elected, channel);
            return;
        }
        if !self.proposed.insert(value) {
            debug!("value {:#x} already proposed", value);
            return;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.instances.insert(slot, Instance { value, num_accepts: 0, num_commits: 0 });
        debug!("opening slot {} for value {:#x}", slot, value);
        let accept = Envelope::request(
            self.me,
            Request::PaxosAccept { ballot: self.ballot, slot, value },
        );
        sender.send_many(accept, &members.acceptors, channel);
    }

    /// Count an acceptor's acknowledgement; on quorum, announce the commit
    /// to every learner.
    pub fn respond_accept_ok(
        &mut self,
        ballot: u32,
        slot: u64,
        sender: &Sender,
        channel: Channel,
        members: &PaxosMembers,
    ) {
        if ballot != self.ballot {
            return;
        }
        let instance = match self.instances.get_mut(&slot) {
        | Some(instance) => instance,
        | None => return,
        };
        instance.num_accepts += 1;
        if instance.num_accepts == members.acceptors.len() / 2 + 1 {
            debug!("slot {} reached quorum", slot);
            let commit = Envelope::request(
                self.me,
                Request::PaxosCommit { slot, value: instance.value, leader: self.me },
            );
            sender.send_many(commit, &members.learners, channel);
        }
    }

    /// Count a learner's acknowledgement; evict the instance once every
    /// learner has one.
    pub fn respond_commit_ok(&mut self, slot: u64) {
        let done = match self.instances.get_mut(&slot) {
        | Some(instance) => {
            instance.num_commits += 1;
            instance.num_commits == self.num_learners
        }
        | None => false,
        };
        if done {
            self.instances.remove(&slot);
            trace!("slot {} fully acknowledged", slot);
        }
    }
}
