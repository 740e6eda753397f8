//! Transactions: pending-operation bookkeeping, conflict detection and
//! the commit/abort/flush lifecycle.
//!
//! Operations are buffered in memory until their transaction is both
//! committed and flushed into the btree. The ops live in one arena owned
//! by the manager; each database's [`TxnIndex`](index::TxnIndex) holds
//! per-key chronological lists of op ids.

pub mod cursor;
pub mod index;

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{DbName, Lsn, TxnId};

use index::NodeId;

/// Arena id of a [`TxnOperation`].
pub type OpId = u64;

/// Kind of a buffered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Placeholder; never applied
    Nop,
    /// Plain insert (fails on duplicate)
    Insert,
    /// Insert with overwrite
    InsertOverwrite,
    /// Insert of a duplicate
    InsertDuplicate,
    /// Erase of a key or one duplicate
    Erase,
}

/// One buffered mutation inside a transaction.
#[derive(Debug, Clone)]
pub struct TxnOperation {
    pub txn_id: TxnId,
    pub dbname: DbName,
    /// Owning node in the database's transaction index
    pub node: NodeId,
    pub kind: OpKind,
    /// The flags the caller passed to insert/erase
    pub original_flags: u32,
    /// 1-based duplicate reference for cursor-driven ops; 0 = none
    pub referenced_duplicate: u32,
    pub lsn: Lsn,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    /// Set once the op was replayed into the btree
    pub is_flushed: bool,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

/// One transaction.
#[derive(Debug)]
pub struct TxnState {
    pub id: TxnId,
    pub status: TxnStatus,
    pub begin_lsn: Lsn,
    /// Chronological list of the txn's ops
    pub op_ids: Vec<OpId>,
    /// Committed and fully replayed into the btree
    pub is_flushed: bool,
    /// Implicit transaction wrapping a single non-transactional call;
    /// not journaled with begin/commit entries
    pub is_temporary: bool,
}

/// Owns all transactions and their operations.
#[derive(Default)]
pub struct TxnManager {
    /// Ordered by id, which is commit order
    txns: BTreeMap<TxnId, TxnState>,
    ops: HashMap<OpId, TxnOperation>,
    next_txn_id: TxnId,
    next_op_id: OpId,
}

impl TxnManager {
    pub fn new() -> Self {
        TxnManager {
            txns: BTreeMap::new(),
            ops: HashMap::new(),
            next_txn_id: 1,
            next_op_id: 1,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn begin(&mut self, begin_lsn: Lsn, is_temporary: bool) -> TxnId {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(
            id,
            TxnState {
                id,
                status: TxnStatus::Active,
                begin_lsn,
                op_ids: Vec::new(),
                is_flushed: false,
                is_temporary,
            },
        );
        id
    }

    pub fn txn(&self, id: TxnId) -> Result<&TxnState> {
        self.txns
            .get(&id)
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))
    }

    fn txn_mut(&mut self, id: TxnId) -> Result<&mut TxnState> {
        self.txns
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))
    }

    pub fn commit(&mut self, id: TxnId) -> Result<()> {
        let txn = self.txn_mut(id)?;
        if txn.status != TxnStatus::Active {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        txn.status = TxnStatus::Committed;
        Ok(())
    }

    /// Abort the transaction; returns its op ids so the caller can detach
    /// cursors and drop the ops from the per-database indexes.
    pub fn abort(&mut self, id: TxnId) -> Result<Vec<OpId>> {
        let txn = self.txn_mut(id)?;
        if txn.status != TxnStatus::Active {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        txn.status = TxnStatus::Aborted;
        Ok(txn.op_ids.clone())
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.txns
            .get(&id)
            .map(|t| t.status == TxnStatus::Active)
            .unwrap_or(false)
    }

    pub fn status(&self, id: TxnId) -> Option<TxnStatus> {
        self.txns.get(&id).map(|t| t.status)
    }

    pub fn has_active_txns(&self) -> bool {
        self.txns.values().any(|t| t.status == TxnStatus::Active)
    }

    /// Smallest begin-lsn of any still-active transaction; gates journal
    /// truncation.
    pub fn oldest_active_begin_lsn(&self) -> Option<Lsn> {
        self.txns
            .values()
            .filter(|t| t.status == TxnStatus::Active)
            .map(|t| t.begin_lsn)
            .min()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn append_op(
        &mut self,
        txn_id: TxnId,
        dbname: DbName,
        node: NodeId,
        kind: OpKind,
        original_flags: u32,
        referenced_duplicate: u32,
        lsn: Lsn,
        key: Vec<u8>,
        record: Vec<u8>,
    ) -> Result<OpId> {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        self.ops.insert(
            op_id,
            TxnOperation {
                txn_id,
                dbname,
                node,
                kind,
                original_flags,
                referenced_duplicate,
                lsn,
                key,
                record,
                is_flushed: false,
            },
        );
        self.txn_mut(txn_id)?.op_ids.push(op_id);
        Ok(op_id)
    }

    pub fn op(&self, id: OpId) -> &TxnOperation {
        &self.ops[&id]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut TxnOperation {
        self.ops.get_mut(&id).expect("op id is live")
    }

    pub fn try_op(&self, id: OpId) -> Option<&TxnOperation> {
        self.ops.get(&id)
    }

    // ------------------------------------------------------------------
    // Conflict detection and visibility
    // ------------------------------------------------------------------

    /// True if appending to a key whose chronological op list is
    /// `node_ops` would conflict: the newest non-aborted op belongs to a
    /// different, still-active transaction.
    pub fn conflicts(&self, node_ops: &[OpId], txn_id: TxnId) -> bool {
        for op_id in node_ops.iter().rev() {
            let op = &self.ops[op_id];
            match self.status(op.txn_id) {
                Some(TxnStatus::Aborted) => continue,
                Some(TxnStatus::Active) => return op.txn_id != txn_id,
                _ => return false,
            }
        }
        false
    }

    /// Read-your-writes: the newest op of `node_ops` visible to `txn_id`
    /// (own ops and committed ops). Returns the op and whether it erases
    /// the key.
    pub fn find_visible(&self, node_ops: &[OpId], txn_id: Option<TxnId>) -> Option<(OpId, bool)> {
        for op_id in node_ops.iter().rev() {
            let op = &self.ops[op_id];
            let visible = match self.status(op.txn_id) {
                Some(TxnStatus::Aborted) | None => false,
                Some(TxnStatus::Committed) => true,
                Some(TxnStatus::Active) => txn_id == Some(op.txn_id),
            };
            if !visible {
                continue;
            }
            return Some((*op_id, op.kind == OpKind::Erase));
        }
        None
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Committed but not yet flushed transactions, in id order.
    pub fn committed_unflushed(&self) -> Vec<TxnId> {
        self.txns
            .values()
            .filter(|t| t.status == TxnStatus::Committed && !t.is_flushed)
            .map(|t| t.id)
            .collect()
    }

    pub fn ops_of(&self, txn_id: TxnId) -> Vec<OpId> {
        self.txns
            .get(&txn_id)
            .map(|t| t.op_ids.clone())
            .unwrap_or_default()
    }

    pub fn mark_flushed(&mut self, txn_id: TxnId) -> Result<()> {
        self.txn_mut(txn_id)?.is_flushed = true;
        Ok(())
    }

    /// Drop transactions whose ops are no longer needed (flushed or
    /// aborted); returns the released operations so the caller can drop
    /// them from the per-database indexes and detach cursors.
    pub fn release_closed_txns(&mut self) -> Vec<(OpId, TxnOperation)> {
        let doomed: Vec<TxnId> = self
            .txns
            .values()
            .filter(|t| {
                (t.status == TxnStatus::Committed && t.is_flushed)
                    || t.status == TxnStatus::Aborted
            })
            .map(|t| t.id)
            .collect();
        let mut released = Vec::new();
        for id in doomed {
            if let Some(txn) = self.txns.remove(&id) {
                for op_id in txn.op_ids {
                    if let Some(op) = self.ops.remove(&op_id) {
                        released.push((op_id, op));
                    }
                }
            }
        }
        released
    }

    // ------------------------------------------------------------------
    // Recovery support
    // ------------------------------------------------------------------

    /// Reseed the id counters after recovery.
    pub fn reseed(&mut self, next_txn_id: TxnId) {
        self.next_txn_id = self.next_txn_id.max(next_txn_id);
    }

    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(mgr: &mut TxnManager, txn: TxnId, kind: OpKind, lsn: Lsn) -> OpId {
        mgr.append_op(txn, 1, 0, kind, 0, 0, lsn, b"k".to_vec(), b"v".to_vec())
            .unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(1, false);
        assert!(mgr.is_active(t1));
        mgr.commit(t1).unwrap();
        assert!(!mgr.is_active(t1));
        assert_eq!(mgr.status(t1), Some(TxnStatus::Committed));
        // double commit is rejected
        assert!(mgr.commit(t1).is_err());
    }

    #[test]
    fn test_conflict_detection() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(1, false);
        let t2 = mgr.begin(2, false);

        let op = append(&mut mgr, t1, OpKind::Insert, 10);
        let node_ops = vec![op];

        assert!(!mgr.conflicts(&node_ops, t1), "own active op");
        assert!(mgr.conflicts(&node_ops, t2), "other active txn");

        mgr.commit(t1).unwrap();
        assert!(!mgr.conflicts(&node_ops, t2), "committed txn no longer conflicts");
    }

    #[test]
    fn test_aborted_ops_are_skipped() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(1, false);
        let t2 = mgr.begin(2, false);
        let op1 = append(&mut mgr, t1, OpKind::Insert, 10);
        mgr.abort(t1).unwrap();

        assert!(!mgr.conflicts(&[op1], t2));
        assert_eq!(mgr.find_visible(&[op1], Some(t2)), None);
    }

    #[test]
    fn test_read_your_writes() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(1, false);
        let t2 = mgr.begin(2, false);
        let op1 = append(&mut mgr, t1, OpKind::Insert, 10);

        // own write is visible, foreign active write is not
        assert_eq!(mgr.find_visible(&[op1], Some(t1)), Some((op1, false)));
        assert_eq!(mgr.find_visible(&[op1], Some(t2)), None);
        assert_eq!(mgr.find_visible(&[op1], None), None);

        mgr.commit(t1).unwrap();
        assert_eq!(mgr.find_visible(&[op1], None), Some((op1, false)));

        // a newer erase hides the insert
        let op2 = append(&mut mgr, t2, OpKind::Erase, 11);
        assert_eq!(
            mgr.find_visible(&[op1, op2], Some(t2)),
            Some((op2, true))
        );
    }

    #[test]
    fn test_flush_and_release() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(1, false);
        append(&mut mgr, t1, OpKind::Insert, 10);
        mgr.commit(t1).unwrap();

        assert_eq!(mgr.committed_unflushed(), vec![t1]);
        mgr.mark_flushed(t1).unwrap();
        assert!(mgr.committed_unflushed().is_empty());

        let released = mgr.release_closed_txns();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1.txn_id, t1);
        assert!(mgr.txns.is_empty());
        assert!(mgr.ops.is_empty());
    }
}
