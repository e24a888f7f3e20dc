//! # Summary
//!
//! This module implements the plain key-value execution engine: get, set,
//! del, copy, and echo over opaque byte values. It is the default engine
//! and the one the end-to-end tests drive.

use crate::transaction::Transaction;

use super::{read_declared, stage_write, Execution, ProcedureId, ReadView};

pub struct KeyValueExecution;

impl KeyValueExecution {
    pub fn new() -> Self {
        KeyValueExecution
    }

    fn run(&self, txn: &mut Transaction, view: &ReadView) -> Result<(), String> {
        let code = txn.code.clone();
        for proc in &code {
            let args = &proc.args;
            match proc.id {
            | ProcedureId::Get => {
                let key = args[0].as_bytes();
                let value = read_declared(txn, view, key)?.map(<[u8]>::to_vec).unwrap_or_default();
                txn.reads.push((key.to_vec(), value));
            }
            | ProcedureId::Set => {
                stage_write(txn, args[0].clone().into_bytes(), args[1].clone().into_bytes())?;
            }
            | ProcedureId::Del => {
                let key = args[0].clone().into_bytes();
                match txn.key_entry(&key).map(|e| e.mode) {
                | Some(crate::transaction::KeyMode::Write) => txn.deletes.push(key),
                | _ => return Err("delete of undeclared key".to_string()),
                }
            }
            | ProcedureId::Copy => {
                let src = args[0].as_bytes();
                let value = read_declared(txn, view, src)?
                    .map(<[u8]>::to_vec)
                    .ok_or("copy: source key not found")?;
                txn.reads.push((src.to_vec(), value.clone()));
                stage_write(txn, args[1].clone().into_bytes(), value)?;
            }
            | ProcedureId::Echo => {
                txn.reads.push((b"echo".to_vec(), args[0].clone().into_bytes()));
            }
            | other => return Err(format!("{}: not a key-value procedure", other.name())),
            }
        }
        Ok(())
    }
}

impl Execution for KeyValueExecution {
    fn execute(&self, txn: &mut Transaction, view: &ReadView) {
        if let Err(reason) = self.run(txn, view) {
            txn.abort(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::parse_code;
    use crate::transaction::{KeyMode, TxnStatus};

    fn txn(keys: Vec<(&[u8], KeyMode)>, code: Vec<Vec<&str>>) -> Transaction {
        let keys = keys.into_iter().map(|(k, m)| (k.to_vec(), m)).collect();
        let code = code
            .into_iter()
            .map(|p| p.into_iter().map(str::to_string).collect())
            .collect::<Vec<Vec<String>>>();
        Transaction::new(keys, parse_code(&code).unwrap())
    }

    #[test]
    fn get_returns_pre_image() {
        let mut txn = txn(
            vec![(b"k1", KeyMode::Read)],
            vec![vec!["get", "k1"]],
        );
        let view = ReadView::new(vec![(b"k1".to_vec(), Some(b"a".to_vec()))]);
        KeyValueExecution::new().execute(&mut txn, &view);
        assert_eq!(txn.status, TxnStatus::Pending);
        assert_eq!(txn.reads, vec![(b"k1".to_vec(), b"a".to_vec())]);
    }

    #[test]
    fn get_of_absent_key_reads_empty() {
        let mut txn = txn(vec![(b"k1", KeyMode::Read)], vec![vec!["get", "k1"]]);
        let view = ReadView::new(vec![(b"k1".to_vec(), None)]);
        KeyValueExecution::new().execute(&mut txn, &view);
        assert_eq!(txn.status, TxnStatus::Pending);
        assert_eq!(txn.reads, vec![(b"k1".to_vec(), Vec::new())]);
    }

    #[test]
    fn set_stages_write() {
        let mut txn = txn(
            vec![(b"k1", KeyMode::Write)],
            vec![vec!["set", "k1", "a"]],
        );
        let view = ReadView::new(vec![(b"k1".to_vec(), None)]);
        KeyValueExecution::new().execute(&mut txn, &view);
        assert_eq!(txn.writes, vec![(b"k1".to_vec(), b"a".to_vec())]);
    }

    #[test]
    fn undeclared_write_aborts() {
        let mut txn = txn(
            vec![(b"k1", KeyMode::Read)],
            vec![vec!["set", "k1", "a"]],
        );
        let view = ReadView::new(vec![(b"k1".to_vec(), None)]);
        KeyValueExecution::new().execute(&mut txn, &view);
        assert_eq!(txn.status, TxnStatus::Aborted);
        assert!(txn.abort_reason.contains("undeclared"));
    }

    #[test]
    fn copy_moves_value_between_keys() {
        let mut txn = txn(
            vec![(b"src", KeyMode::Read), (b"dst", KeyMode::Write)],
            vec![vec!["copy", "src", "dst"]],
        );
        let view = ReadView::new(vec![
            (b"src".to_vec(), Some(b"v".to_vec())),
            (b"dst".to_vec(), None),
        ]);
        KeyValueExecution::new().execute(&mut txn, &view);
        assert_eq!(txn.writes, vec![(b"dst".to_vec(), b"v".to_vec())]);
    }
}
