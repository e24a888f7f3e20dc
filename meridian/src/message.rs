//! # Summary
//!
//! This module defines the message vocabulary of the envelope bus: machine
//! and channel identifiers, the `Envelope` wrapper with its request/response
//! union, single-home batches, Paxos value encodings, and the client-facing
//! API types. Everything here serializes with bincode and must round-trip
//! to an equal value.

use serde_derive::{Deserialize, Serialize};

use crate::transaction::{Key, Metadata, PartitionId, RegionId, Transaction, TxnId};

/// Identifies one `(region, replica, partition)` machine of the grid.
/// The mapping to coordinates lives in `Config`; the id itself is stable
/// for the process lifetime.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId(pub u32);

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named inproc queue on a machine. Unique per process.
pub type Channel = u32;

pub const SERVER: Channel = 0;
pub const FORWARDER: Channel = 1;
pub const SEQUENCER: Channel = 2;
pub const MULTI_HOME_ORDERER: Channel = 3;
pub const SCHEDULER: Channel = 4;
pub const WORKER: Channel = 5;
pub const SEQUENCER_PAXOS: Channel = 6;
pub const REMASTER_PAXOS: Channel = 7;
pub const CLOCK_SYNCHRONIZER: Channel = 8;

/// Channels at or above this value map to the last broker port.
pub const MAX_CHANNEL: Channel = 9;

/// Modules addressable by a stats query.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModuleId {
    Server,
    Forwarder,
    Sequencer,
    MultiHomeOrderer,
    Scheduler,
}

impl ModuleId {
    pub fn channel(self) -> Channel {
        match self {
        | ModuleId::Server => SERVER,
        | ModuleId::Forwarder => FORWARDER,
        | ModuleId::Sequencer => SEQUENCER,
        | ModuleId::MultiHomeOrderer => MULTI_HOME_ORDERER,
        | ModuleId::Scheduler => SCHEDULER,
        }
    }
}

impl std::str::FromStr for ModuleId {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
        | "server" => Ok(ModuleId::Server),
        | "forwarder" => Ok(ModuleId::Forwarder),
        | "sequencer" => Ok(ModuleId::Sequencer),
        | "orderer" => Ok(ModuleId::MultiHomeOrderer),
        | "scheduler" => Ok(ModuleId::Scheduler),
        | _ => Err(()),
        }
    }
}

/// A sealed, ordered run of single-home transactions from one region's
/// sequencer. Immutable after sealing; `local_seq` strictly increases
/// per region.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Batch {
    pub region: RegionId,
    pub local_seq: u64,
    pub txns: Vec<Transaction>,
}

impl Batch {
    /// The Paxos value standing for this batch in the shared log.
    pub fn value(&self) -> u64 {
        sh_batch_value(self.region, self.local_seq)
    }
}

const MH_FLAG: u64 = 1 << 63;

/// Encode a single-home batch id as a log value. Top bit clear.
pub fn sh_batch_value(region: RegionId, local_seq: u64) -> u64 {
    debug_assert!(local_seq < (1u64 << 32));
    ((region as u64) << 32) | local_seq
}

/// Encode a multi-home transaction id as a log value. Top bit set.
pub fn mh_txn_value(txn_id: TxnId) -> u64 {
    debug_assert!((txn_id & MH_FLAG) == 0);
    MH_FLAG | txn_id
}

/// Decode a log value into either a batch id or a multi-home txn id.
pub fn decode_value(value: u64) -> LogValue {
    if (value & MH_FLAG) != 0 {
        LogValue::MhTxn(value & !MH_FLAG)
    } else {
        LogValue::ShBatch((value >> 32) as RegionId, value & 0xffff_ffff)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogValue {
    ShBatch(RegionId, u64),
    MhTxn(TxnId),
}

/// One message on the bus. Immutable after send.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: MachineId,
    pub message: Message,
}

impl Envelope {
    pub fn request(from: MachineId, request: Request) -> Self {
        Envelope { from, message: Message::Request(request) }
    }

    pub fn response(from: MachineId, response: Response) -> Self {
        Envelope { from, message: Message::Response(response) }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum Request {
    /// A transaction moving down the pipeline: server to forwarder,
    /// forwarder to sequencer, sequencer or forwarder to the multi-home
    /// orderer, orderer to scheduler.
    ForwardTxn(Box<Transaction>),

    /// A sealed batch replicated to every machine's orderer.
    Batch(Batch),

    /// The multi-home coordinator's broadcast: the transaction plus the
    /// per-region batch positions captured when it was proposed.
    MhTxnArrived {
        txn: Box<Transaction>,
        observation_points: Vec<(RegionId, u64)>,
    },

    PaxosPropose { value: u64 },
    PaxosAccept { ballot: u32, slot: u64, value: u64 },
    PaxosCommit { slot: u64, value: u64, leader: MachineId },

    /// In-order commit delivery from a Paxos group to its user channels.
    /// Local to a machine; never crosses the wire.
    PaxosDeliver { slot: u64, value: u64 },

    /// One partition's pre-image of its local keys, exchanged between
    /// schedulers of the same (region, replica) before execution.
    RemoteReads {
        txn_id: TxnId,
        partition: PartitionId,
        reads: Vec<(Key, Option<Vec<u8>>)>,
    },

    /// Abort propagation for a multi-partition transaction.
    AbortTxn { txn_id: TxnId },

    /// Scheduler to worker, once all locks are held. Local only.
    Dispatch(Box<Transaction>),

    /// Worker to scheduler, after execution. Local only.
    TxnFinished(Box<Transaction>),

    /// Scheduler to the coordinator's server: this partition's result.
    TxnResult { txn: Box<Transaction>, partition: PartitionId },

    /// A committed remaster decision, fanned out to every forwarder so
    /// caches converge and buffered transactions re-resolve.
    Remastered { keys: Vec<(Key, Metadata)> },

    Stats { module: ModuleId, level: u32 },

    ClockPing { time: i64 },
    ClockPong { ping_time: i64, peer_time: i64 },

    /// Client connection tasks to the local server module. Local only.
    ClientTxn { client: u64, txn: Box<Transaction> },
    ClientStats { client: u64, module: ModuleId, level: u32 },
    ClientMetrics { client: u64, prefix: String },
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum Response {
    PaxosAcceptOk { ballot: u32, slot: u64 },
    PaxosCommitOk { slot: u64 },
    Stats { module: ModuleId, json: String },
}

/// Requests accepted on the server's client port.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum ApiRequest {
    Txn { txn: Box<Transaction> },
    Stats { module: ModuleId, level: u32 },
    Metrics { prefix: String },
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum ApiResponse {
    Txn { txn: Box<Transaction> },
    Stats { json: String },
    Metrics,
}
