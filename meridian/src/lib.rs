//! Meridian is a geo-distributed, deterministic transaction processing
//! engine: per-region sequencers batch transactions into a Paxos-ordered
//! shared log, a deterministic orderer interleaves single-home batches with
//! multi-home transactions, and per-partition schedulers execute the
//! resulting stream with identical side effects on every replica.

#[macro_use] extern crate log;

pub mod config;
pub mod execution;
pub mod internal;
pub mod lock;
pub mod machine;
pub mod message;
pub mod module;
pub mod paxos;
pub mod sender;
pub mod socket;
pub mod storage;
pub mod transaction;

pub use crate::config::Config;
pub use crate::machine::{start, MachineHandle};
pub use crate::message::{ApiRequest, ApiResponse, MachineId, ModuleId};
pub use crate::transaction::{KeyMode, Transaction, TxnStatus};
