//! Database: a named key/value namespace inside an environment.
//!
//! With transactions enabled every mutation is buffered in the database's
//! transaction index and only reaches the btree when its transaction is
//! flushed; reads merge both sides. Without transactions the operations
//! go straight to the btree.

use std::sync::Arc;

use crate::cursor::{self, Cursor};
use crate::env::{
    abort_txn_locked, commit_txn_locked, duplicate_position, sync_root, EnvInner, EnvState, Txn,
};
use crate::error::{Error, ErrorCode, Result};
use crate::storage::changeset::Context;
use crate::txn::{OpId, OpKind};
use crate::types::{
    ApproxMatch, DbFlags, DbName, EnvFlags, FindFlags, InsertFlags, TxnId, MAX_KEY_SIZE,
    RECORD_SIZE_UNLIMITED,
};

/// Result of a lookup: the matched key, its record and the direction of
/// an approximate match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindResult {
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    pub approx: ApproxMatch,
}

/// One operation of a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOperation {
    Insert {
        key: Vec<u8>,
        record: Vec<u8>,
        flags: InsertFlags,
    },
    Erase {
        key: Vec<u8>,
    },
    Find {
        key: Vec<u8>,
    },
}

/// Outcome of one bulk operation.
#[derive(Debug, Clone)]
pub enum BulkResult {
    Ok,
    Found(FindResult),
    Failed(ErrorCode),
}

/// Handle to an open database.
pub struct Database {
    inner: Arc<EnvInner>,
    name: DbName,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

impl Database {
    pub(crate) fn new(inner: Arc<EnvInner>, name: DbName) -> Self {
        Database { inner, name }
    }

    pub fn name(&self) -> DbName {
        self.name
    }

    /// Insert or update `key`.
    pub fn insert(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        db_insert(
            &self.inner,
            &mut state,
            self.name,
            txn.map(|t| t.id),
            key,
            record,
            flags,
            0,
        )?;
        drop(state);
        self.inner.kick_purge();
        Ok(())
    }

    /// Exact lookup; returns the record.
    pub fn get(&self, txn: Option<&Txn>, key: &[u8]) -> Result<Vec<u8>> {
        Ok(self
            .find(txn, key, FindFlags::empty())?
            .record)
    }

    /// Lookup with optional approximate matching.
    pub fn find(&self, txn: Option<&Txn>, key: &[u8], flags: FindFlags) -> Result<FindResult> {
        let mut state = self.inner.locked_state()?;
        db_find(
            &self.inner,
            &mut state,
            self.name,
            txn.map(|t| t.id),
            key,
            flags,
        )
    }

    /// Erase `key` (all of its duplicates).
    pub fn erase(&self, txn: Option<&Txn>, key: &[u8]) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        db_erase(
            &self.inner,
            &mut state,
            self.name,
            txn.map(|t| t.id),
            key,
            0,
        )?;
        drop(state);
        self.inner.kick_purge();
        Ok(())
    }

    /// Number of keys (`distinct`) or of key/duplicate pairs.
    pub fn count(&self, txn: Option<&Txn>, distinct: bool) -> Result<u64> {
        let mut state = self.inner.locked_state()?;
        db_count(
            &self.inner,
            &mut state,
            self.name,
            txn.map(|t| t.id),
            distinct,
        )
    }

    /// Verify the btree invariants of this database.
    pub fn check_integrity(&self) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let db = db_state(&mut state, self.name)?;
        let mut ctx = Context::new(None);
        db.btree.check_integrity(&mut ctx)
    }

    /// Run a batch of operations back-to-back under one lock acquisition.
    pub fn bulk(&self, txn: Option<&Txn>, operations: &[BulkOperation]) -> Result<Vec<BulkResult>> {
        let mut state = self.inner.locked_state()?;
        let txn_id = txn.map(|t| t.id);
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            let outcome = match operation {
                BulkOperation::Insert { key, record, flags } => db_insert(
                    &self.inner,
                    &mut state,
                    self.name,
                    txn_id,
                    key,
                    record,
                    *flags,
                    0,
                )
                .map(|_| BulkResult::Ok),
                BulkOperation::Erase { key } => {
                    db_erase(&self.inner, &mut state, self.name, txn_id, key, 0)
                        .map(|_| BulkResult::Ok)
                }
                BulkOperation::Find { key } => db_find(
                    &self.inner,
                    &mut state,
                    self.name,
                    txn_id,
                    key,
                    FindFlags::empty(),
                )
                .map(BulkResult::Found),
            };
            results.push(match outcome {
                Ok(result) => result,
                Err(err) => BulkResult::Failed(err.code()),
            });
        }
        drop(state);
        self.inner.kick_purge();
        Ok(results)
    }

    /// Open a cursor over this database.
    pub fn cursor(&self, txn: Option<&Txn>) -> Result<Cursor> {
        let (registry, id) = {
            let state = self.inner.locked_state()?;
            let db = state
                .databases
                .get(&self.name)
                .ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
            let registry = db.cursors.clone();
            let id = registry.lock().create();
            (registry, id)
        };
        Ok(Cursor::new(
            self.inner.clone(),
            registry,
            self.name,
            id,
            txn.map(|t| t.id),
        ))
    }
}

// ----------------------------------------------------------------------
// Internals shared with the cursor
// ----------------------------------------------------------------------

pub(crate) fn db_state<'a>(
    state: &'a mut EnvState,
    name: DbName,
) -> Result<&'a mut crate::env::DbState> {
    state
        .databases
        .get_mut(&name)
        .ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))
}

/// Split borrow: the database plus the transaction manager.
pub(crate) fn db_and_txns<'a>(
    state: &'a mut EnvState,
    name: DbName,
) -> Result<(&'a mut crate::env::DbState, &'a crate::txn::TxnManager)> {
    let EnvState {
        databases, txns, ..
    } = state;
    let db = databases
        .get_mut(&name)
        .ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
    Ok((db, txns))
}

fn validate_insert(
    db: &crate::env::DbState,
    env_flags: EnvFlags,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    if env_flags.contains(EnvFlags::READ_ONLY) {
        return Err(Error::new(ErrorCode::WriteProtected));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::new(ErrorCode::InvKeySize));
    }
    if db.config.key_size != crate::types::KEY_SIZE_UNLIMITED
        && key.len() != db.config.key_size as usize
    {
        return Err(Error::new(ErrorCode::InvKeySize));
    }
    if db.config.record_size != RECORD_SIZE_UNLIMITED
        && record.len() != db.config.record_size as usize
    {
        return Err(Error::new(ErrorCode::InvRecordSize));
    }
    // a key whose stored entry cannot fit half an empty node would make
    // the split retry loop diverge
    if db.config.key_size == crate::types::KEY_SIZE_UNLIMITED {
        let stored = if key.len() > crate::storage::btree::keylist::EXTENDED_THRESHOLD {
            8
        } else {
            key.len()
        };
        let key_region = db.btree.layout().geometry(true).key_region;
        if 5 + stored > key_region / 2 {
            return Err(Error::new(ErrorCode::InvKeySize));
        }
    }
    let dup_flags = InsertFlags::DUPLICATE
        | InsertFlags::DUPLICATE_INSERT_FIRST
        | InsertFlags::DUPLICATE_INSERT_LAST
        | InsertFlags::DUPLICATE_INSERT_BEFORE
        | InsertFlags::DUPLICATE_INSERT_AFTER;
    if flags.intersects(dup_flags) && !db.config.flags.contains(DbFlags::ENABLE_DUPLICATES) {
        return Err(Error::new(ErrorCode::InvParameter));
    }
    if flags.contains(InsertFlags::OVERWRITE) && flags.contains(InsertFlags::DUPLICATE) {
        return Err(Error::new(ErrorCode::InvParameter));
    }
    Ok(())
}

/// Insert through the transaction layer or directly into the btree.
/// Returns the op id when the write was buffered in a transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn db_insert(
    inner: &EnvInner,
    state: &mut EnvState,
    name: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
    referenced_duplicate: u32,
) -> Result<Option<OpId>> {
    {
        let db = db_state(state, name)?;
        validate_insert(db, inner.config.flags, key, record, flags)?;
    }

    if !inner.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
        let db = db_state(state, name)?;
        let mut ctx = Context::new(None);
        let position = duplicate_position(flags, referenced_duplicate);
        if flags.contains(InsertFlags::OVERWRITE) && referenced_duplicate > 0 {
            db.btree.overwrite_duplicate(
                &mut ctx,
                key,
                referenced_duplicate as usize - 1,
                record,
            )?;
        } else {
            db.btree.insert(&mut ctx, key, record, flags, position)?;
        }
        sync_root(inner, &mut ctx, db)?;
        return Ok(None);
    }

    let (txn_id, temporary) = match txn {
        Some(id) => (id, false),
        None => {
            let lsn = state.next_lsn();
            (state.txns.begin(lsn, true), true)
        }
    };

    let result = txn_write(
        state,
        name,
        txn_id,
        key,
        Some(record),
        flags,
        referenced_duplicate,
    );
    finish_temporary(inner, state, txn_id, temporary, result)
}

/// Erase through the transaction layer or directly in the btree.
pub(crate) fn db_erase(
    inner: &EnvInner,
    state: &mut EnvState,
    name: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    referenced_duplicate: u32,
) -> Result<Option<OpId>> {
    if inner.config.flags.contains(EnvFlags::READ_ONLY) {
        return Err(Error::new(ErrorCode::WriteProtected));
    }

    if !inner.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
        let db = db_state(state, name)?;
        let mut ctx = Context::new(None);
        let dup = if referenced_duplicate > 0 {
            Some(referenced_duplicate as usize - 1)
        } else {
            None
        };
        db.btree.erase(&mut ctx, key, dup)?;
        sync_root(inner, &mut ctx, db)?;
        return Ok(None);
    }

    let (txn_id, temporary) = match txn {
        Some(id) => (id, false),
        None => {
            let lsn = state.next_lsn();
            (state.txns.begin(lsn, true), true)
        }
    };

    let result = txn_write(
        state,
        name,
        txn_id,
        key,
        None,
        InsertFlags::empty(),
        referenced_duplicate,
    );
    finish_temporary(inner, state, txn_id, temporary, result)
}

fn finish_temporary(
    inner: &EnvInner,
    state: &mut EnvState,
    txn_id: TxnId,
    temporary: bool,
    result: Result<OpId>,
) -> Result<Option<OpId>> {
    match result {
        Ok(op_id) => {
            if temporary {
                commit_txn_locked(inner, state, txn_id)?;
                Ok(None)
            } else {
                Ok(Some(op_id))
            }
        }
        Err(err) => {
            if temporary {
                let _ = abort_txn_locked(state, txn_id);
            }
            Err(err)
        }
    }
}

/// Append one buffered operation (`record = None` means erase).
#[allow(clippy::too_many_arguments)]
fn txn_write(
    state: &mut EnvState,
    name: DbName,
    txn_id: TxnId,
    key: &[u8],
    record: Option<&[u8]>,
    flags: InsertFlags,
    referenced_duplicate: u32,
) -> Result<OpId> {
    let state = &mut *state;
    let db = state
        .databases
        .get_mut(&name)
        .ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
    let txns = &mut state.txns;

    let node = db.txn_index.store(key);
    if txns.conflicts(db.txn_index.ops(node), txn_id) {
        return Err(Error::new(ErrorCode::TxnConflict));
    }

    // does the key exist, as seen by this transaction?
    let visible = txns.find_visible(db.txn_index.ops(node), Some(txn_id));
    let exists = match visible {
        Some((_, erased)) => !erased,
        None => {
            let mut ctx = Context::new(None);
            db.btree
                .find_position(&mut ctx, key, FindFlags::empty())?
                .is_some()
        }
    };

    let kind = match record {
        None => {
            if !exists {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            OpKind::Erase
        }
        Some(_) => {
            if exists
                && !flags.contains(InsertFlags::OVERWRITE)
                && !flags.contains(InsertFlags::DUPLICATE)
            {
                return Err(Error::new(ErrorCode::DuplicateKey));
            }
            if flags.contains(InsertFlags::DUPLICATE) {
                OpKind::InsertDuplicate
            } else if flags.contains(InsertFlags::OVERWRITE) {
                OpKind::InsertOverwrite
            } else {
                OpKind::Insert
            }
        }
    };

    state.lsn += 1;
    let op_id = txns.append_op(
        txn_id,
        name,
        node,
        kind,
        flags.bits(),
        referenced_duplicate,
        state.lsn,
        key.to_vec(),
        record.unwrap_or_default().to_vec(),
    )?;
    db.txn_index.push_op(node, op_id);
    Ok(op_id)
}

/// Transaction-aware lookup.
pub(crate) fn db_find(
    inner: &EnvInner,
    state: &mut EnvState,
    name: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    flags: FindFlags,
) -> Result<FindResult> {
    if !inner.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
        let db = db_state(state, name)?;
        let mut ctx = Context::new(None);
        return match db.btree.find(&mut ctx, key, flags)? {
            Some((key, record, approx)) => Ok(FindResult {
                key,
                record,
                approx,
            }),
            None => Err(Error::new(ErrorCode::KeyNotFound)),
        };
    }

    cursor::merged_find(state, name, txn, key, flags)
}

/// Transaction-aware count.
pub(crate) fn db_count(
    inner: &EnvInner,
    state: &mut EnvState,
    name: DbName,
    txn: Option<TxnId>,
    distinct: bool,
) -> Result<u64> {
    let transactional = inner.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS);
    {
        let db = db_state(state, name)?;
        if !transactional || db.txn_index.is_empty() {
            let mut ctx = Context::new(None);
            return db.btree.count(&mut ctx, distinct);
        }
    }
    cursor::merged_count(state, name, txn, distinct)
}
