//! Crash recovery: rebuild state from the journal files.
//!
//! The scan classifies transactions (a begin without a matching commit is
//! an abort), collects the committed transactions' operations in lsn
//! order, and separates the changeset page images which are replayed
//! first to make the subsequent op replay idempotent.

use std::collections::HashMap;

use crate::journal::JournalEntry;
use crate::types::{DbName, Lsn, PageAddr, TxnId};

/// One operation of a committed transaction, ready for replay.
#[derive(Debug, Clone)]
pub struct RecoveredOp {
    pub txn_id: TxnId,
    pub lsn: Lsn,
    pub dbname: DbName,
    pub erase: bool,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    pub flags: u32,
    pub duplicate: u32,
}

/// Result of analyzing the journal.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// Page images to redo, in lsn order
    pub changesets: Vec<(Lsn, PageAddr, Vec<(PageAddr, Vec<u8>)>)>,
    /// Ops of committed transactions, in lsn order
    pub ops: Vec<RecoveredOp>,
    /// Transactions that never committed; their ops were discarded
    pub aborted: Vec<TxnId>,
    /// Seeds for the lsn and txn-id counters
    pub max_lsn: Lsn,
    pub max_txn_id: TxnId,
}

/// Classify the journal entries into a replay plan.
pub fn analyze(entries: &[JournalEntry]) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();

    // pass 1: transaction outcomes. Temporary (implicit) transactions
    // journal their ops without begin/commit entries and are committed by
    // construction; a begin entry without a commit means the txn aborted.
    let mut committed: HashMap<TxnId, bool> = HashMap::new();
    let mut has_begin: HashMap<TxnId, bool> = HashMap::new();
    for entry in entries {
        plan.max_lsn = plan.max_lsn.max(entry.lsn());
        match entry {
            JournalEntry::TxnBegin { txn_id, .. } => {
                plan.max_txn_id = plan.max_txn_id.max(*txn_id);
                has_begin.insert(*txn_id, true);
                committed.entry(*txn_id).or_insert(false);
            }
            JournalEntry::TxnCommit { txn_id, .. } => {
                committed.insert(*txn_id, true);
            }
            JournalEntry::TxnAbort { txn_id, .. } => {
                committed.insert(*txn_id, false);
            }
            JournalEntry::Insert { txn_id, .. } | JournalEntry::Erase { txn_id, .. } => {
                plan.max_txn_id = plan.max_txn_id.max(*txn_id);
                committed.entry(*txn_id).or_insert(false);
            }
            JournalEntry::Changeset { .. } => {}
        }
    }
    for (txn_id, done) in committed.iter_mut() {
        if !*done && !has_begin.contains_key(txn_id) {
            *done = true;
        }
    }

    // pass 2: collect
    for entry in entries {
        match entry {
            JournalEntry::Insert {
                txn_id,
                lsn,
                dbname,
                key,
                record,
                flags,
            } if committed.get(txn_id) == Some(&true) => {
                plan.ops.push(RecoveredOp {
                    txn_id: *txn_id,
                    lsn: *lsn,
                    dbname: *dbname,
                    erase: false,
                    key: key.clone(),
                    record: record.clone(),
                    flags: *flags,
                    duplicate: 0,
                });
            }
            JournalEntry::Erase {
                txn_id,
                lsn,
                dbname,
                key,
                flags,
                duplicate,
            } if committed.get(txn_id) == Some(&true) => {
                plan.ops.push(RecoveredOp {
                    txn_id: *txn_id,
                    lsn: *lsn,
                    dbname: *dbname,
                    erase: true,
                    key: key.clone(),
                    record: Vec::new(),
                    flags: *flags,
                    duplicate: *duplicate,
                });
            }
            JournalEntry::Changeset {
                lsn,
                last_blob_page,
                pages,
            } => {
                plan.changesets
                    .push((*lsn, *last_blob_page, pages.clone()));
            }
            _ => {}
        }
    }

    plan.aborted = committed
        .iter()
        .filter(|(_, done)| !**done)
        .map(|(id, _)| *id)
        .collect();
    plan.aborted.sort_unstable();
    plan.ops.sort_by_key(|op| op.lsn);
    plan.changesets.sort_by_key(|(lsn, _, _)| *lsn);

    if !plan.aborted.is_empty() {
        log::info!(
            "recovery discards {} uncommitted transaction(s)",
            plan.aborted.len()
        );
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncommitted_txn_is_discarded() {
        let entries = vec![
            JournalEntry::TxnBegin { txn_id: 1, lsn: 1 },
            JournalEntry::Insert {
                txn_id: 1,
                lsn: 2,
                dbname: 1,
                key: b"a".to_vec(),
                record: b"x".to_vec(),
                flags: 0,
            },
            JournalEntry::TxnCommit { txn_id: 1, lsn: 3 },
            JournalEntry::TxnBegin { txn_id: 2, lsn: 4 },
            JournalEntry::Insert {
                txn_id: 2,
                lsn: 5,
                dbname: 1,
                key: b"b".to_vec(),
                record: b"y".to_vec(),
                flags: 0,
            },
        ];
        let plan = analyze(&entries);
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].key, b"a");
        assert_eq!(plan.aborted, vec![2]);
        assert_eq!(plan.max_lsn, 5);
        assert_eq!(plan.max_txn_id, 2);
    }

    #[test]
    fn test_changesets_sorted_by_lsn() {
        let entries = vec![
            JournalEntry::Changeset {
                lsn: 9,
                last_blob_page: 0,
                pages: vec![(0x8000, vec![2u8; 4])],
            },
            JournalEntry::Changeset {
                lsn: 4,
                last_blob_page: 0,
                pages: vec![(0x4000, vec![1u8; 4])],
            },
        ];
        let plan = analyze(&entries);
        assert_eq!(plan.changesets[0].0, 4);
        assert_eq!(plan.changesets[1].0, 9);
    }

    #[test]
    fn test_erase_op_is_replayed() {
        let entries = vec![
            JournalEntry::TxnBegin { txn_id: 1, lsn: 1 },
            JournalEntry::Erase {
                txn_id: 1,
                lsn: 2,
                dbname: 3,
                key: b"k".to_vec(),
                flags: 0,
                duplicate: 0,
            },
            JournalEntry::TxnCommit { txn_id: 1, lsn: 3 },
        ];
        let plan = analyze(&entries);
        assert_eq!(plan.ops.len(), 1);
        assert!(plan.ops[0].erase);
        assert_eq!(plan.ops[0].dbname, 3);
    }
}
