//! # Summary
//!
//! This module defines the execution contract: the procedure registry that
//! admission validates against, the read pre-image handed to an engine, and
//! the engines themselves. Execution is deterministic — the same transaction
//! over the same pre-image produces the same writes and status on every
//! replica — which is what lets every machine run the full stream.

use std::collections::HashMap as Map;

use serde_derive::{Deserialize, Serialize};

use crate::transaction::{Key, KeyMode, Procedure, Transaction};

mod key_value;
mod movr;

pub use self::key_value::KeyValueExecution;
pub use self::movr::MovrExecution;
pub use self::movr::{history_id, movr_key, MovrTable};

/// Every procedure the cluster knows how to run. The string switch of a
/// dynamic registry is collapsed into this enum at admission; unknown names
/// never make it past the server edge.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProcedureId {
    Get,
    Set,
    Del,
    Copy,
    Echo,
    ViewVehicles,
    UserSignup,
    AddVehicle,
    StartRide,
    UpdateLocation,
    EndRide,
}

impl ProcedureId {
    pub fn name(self) -> &'static str {
        match self {
        | ProcedureId::Get => "get",
        | ProcedureId::Set => "set",
        | ProcedureId::Del => "del",
        | ProcedureId::Copy => "copy",
        | ProcedureId::Echo => "echo",
        | ProcedureId::ViewVehicles => "view_vehicles",
        | ProcedureId::UserSignup => "user_signup",
        | ProcedureId::AddVehicle => "add_vehicle",
        | ProcedureId::StartRide => "start_ride",
        | ProcedureId::UpdateLocation => "update_location",
        | ProcedureId::EndRide => "end_ride",
        }
    }

    /// Expected argument count, excluding the procedure name itself; the
    /// flag marks variadic procedures, where the count is a minimum.
    fn arity(self) -> (usize, bool) {
        match self {
        | ProcedureId::Get => (1, false),
        | ProcedureId::Set => (2, false),
        | ProcedureId::Del => (1, false),
        | ProcedureId::Copy => (2, false),
        | ProcedureId::Echo => (1, false),
        | ProcedureId::ViewVehicles => (2, true),
        | ProcedureId::UserSignup => (5, false),
        | ProcedureId::AddVehicle => (9, false),
        | ProcedureId::StartRide => (9, false),
        | ProcedureId::UpdateLocation => (5, false),
        | ProcedureId::EndRide => (7, false),
        }
    }
}

impl std::str::FromStr for ProcedureId {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
        | "get" => Ok(ProcedureId::Get),
        | "set" => Ok(ProcedureId::Set),
        | "del" => Ok(ProcedureId::Del),
        | "copy" => Ok(ProcedureId::Copy),
        | "echo" => Ok(ProcedureId::Echo),
        | "view_vehicles" => Ok(ProcedureId::ViewVehicles),
        | "user_signup" => Ok(ProcedureId::UserSignup),
        | "add_vehicle" => Ok(ProcedureId::AddVehicle),
        | "start_ride" => Ok(ProcedureId::StartRide),
        | "update_location" => Ok(ProcedureId::UpdateLocation),
        | "end_ride" => Ok(ProcedureId::EndRide),
        | _ => Err(()),
        }
    }
}

/// Resolve raw `[name, args...]` procedure lists into validated code.
/// Rejection here means the transaction never enters the pipeline.
pub fn parse_code(raw: &[Vec<String>]) -> Result<Vec<Procedure>, String> {
    let mut code = Vec::with_capacity(raw.len());
    for proc in raw {
        let name = proc.first().ok_or("empty procedure")?;
        let id = name
            .parse::<ProcedureId>()
            .map_err(|()| format!("unknown procedure: {}", name))?;
        let args = proc[1..].to_vec();
        let (arity, variadic) = id.arity();
        let ok = if variadic { args.len() >= arity } else { args.len() == arity };
        if !ok {
            return Err(format!("{}: invalid number of arguments", name));
        }
        code.push(Procedure { id, args });
    }
    Ok(code)
}

/// Re-check argument counts of already-resolved code at the server edge.
/// A transaction failing here is aborted before it enters the pipeline.
pub fn validate_code(code: &[Procedure]) -> Result<(), String> {
    for proc in code {
        let (arity, variadic) = proc.id.arity();
        let ok = if variadic { proc.args.len() >= arity } else { proc.args.len() == arity };
        if !ok {
            return Err(format!("{}: invalid number of arguments", proc.id.name()));
        }
    }
    Ok(())
}

/// The pre-image of every key a transaction may read: this partition's
/// local reads plus the remote reads collected from peer partitions.
/// `None` records a key that does not exist yet.
pub struct ReadView {
    values: Map<Key, Option<Vec<u8>>>,
}

impl ReadView {
    pub fn new(reads: Vec<(Key, Option<Vec<u8>>)>) -> Self {
        ReadView { values: reads.into_iter().collect() }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.values.get(key).and_then(|v| v.as_deref())
    }
}

/// A deterministic execution engine. Engines stage results into the
/// transaction (`reads`, `writes`, `deletes`) and may abort it; they never
/// touch storage directly and never create transactions.
pub trait Execution: Send + Sync {
    fn execute(&self, txn: &mut Transaction, view: &ReadView);
}

/// Stage a write after checking it was declared. Shared by both engines.
fn stage_write(txn: &mut Transaction, key: Key, value: Vec<u8>) -> Result<(), String> {
    match txn.key_entry(&key).map(|e| e.mode) {
    | Some(KeyMode::Write) => {
        txn.writes.push((key, value));
        Ok(())
    }
    | _ => Err("write to undeclared key".to_string()),
    }
}

/// Check a read was declared before serving it from the view.
fn read_declared<'v>(
    txn: &Transaction,
    view: &'v ReadView,
    key: &[u8],
) -> Result<Option<&'v [u8]>, String> {
    match txn.key_entry(key) {
    | Some(_) => Ok(view.get(key)),
    | None => Err("read of undeclared key".to_string()),
    }
}
