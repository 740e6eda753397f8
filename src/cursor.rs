//! Cursor: a merged view over the btree and the transaction tree.
//!
//! For the current key the cursor keeps a duplicate cache: the effective
//! duplicate list after replaying the key's pending transaction ops over
//! the btree-side duplicates. Movement compares the next candidate key of
//! both backends under the database's comparator; erased keys are stepped
//! over in the direction of travel.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::db::{db_and_txns, db_erase, db_insert, db_state, FindResult};
use crate::env::{EnvInner, EnvState};
use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::cursor::{CursorId, CursorRegistryRef, DupCacheEntry};
use crate::storage::btree::node::Node;
use crate::storage::changeset::Context;
use crate::txn::{cursor as txn_cursor, OpKind, TxnManager};
use crate::types::{
    ApproxMatch, CursorFlags, DbName, FindFlags, InsertFlags, TxnId,
};

/// Direction of a merge move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// A database cursor. Holds a stable id into the database's cursor
/// registry; the engine-side state lives there so structural changes can
/// uncouple the cursor behind the user's back.
pub struct Cursor {
    inner: Arc<EnvInner>,
    registry: CursorRegistryRef,
    dbname: DbName,
    id: CursorId,
    txn: Option<TxnId>,
}

impl Cursor {
    pub(crate) fn new(
        inner: Arc<EnvInner>,
        registry: CursorRegistryRef,
        dbname: DbName,
        id: CursorId,
        txn: Option<TxnId>,
    ) -> Self {
        Cursor {
            inner,
            registry,
            dbname,
            id,
            txn,
        }
    }

    /// Position on `key`, exactly or approximately.
    pub fn find(&mut self, key: &[u8], flags: FindFlags) -> Result<FindResult> {
        let mut state = self.inner.locked_state()?;
        let result = merged_find(&mut state, self.dbname, self.txn, key, flags)?;
        position_on_key(
            &mut state,
            self.dbname,
            self.txn,
            self.id,
            &result.key,
            Direction::Up,
        )?;
        Ok(result)
    }

    /// Move the cursor (`FIRST`/`LAST`/`NEXT`/`PREVIOUS`, optionally
    /// `SKIP_DUPLICATES` / `ONLY_DUPLICATES`).
    pub fn move_to(&mut self, flags: CursorFlags) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;

        if flags.contains(CursorFlags::FIRST) {
            return self.seek_end(state, Direction::Up);
        }
        if flags.contains(CursorFlags::LAST) {
            return self.seek_end(state, Direction::Down);
        }

        let direction = if flags.contains(CursorFlags::PREVIOUS) {
            Direction::Down
        } else if flags.contains(CursorFlags::NEXT) {
            Direction::Up
        } else {
            return Err(Error::new(ErrorCode::InvParameter));
        };

        // duplicate stepping comes first unless skipped
        if !flags.contains(CursorFlags::SKIP_DUPLICATES) {
            let stepped = {
                let db = db_state(state, self.dbname)?;
                let mut registry = db.cursors.lock();
                let binding = registry
                    .get_mut(self.id)
                    .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
                match direction {
                    Direction::Up if binding.dup_pos + 1 < binding.dup_cache.len() => {
                        binding.dup_pos += 1;
                        true
                    }
                    Direction::Down if binding.dup_pos > 0 && !binding.dup_cache.is_empty() => {
                        binding.dup_pos -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if stepped {
                return Ok(());
            }
            if flags.contains(CursorFlags::ONLY_DUPLICATES) {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
        }

        let from = self.current_key(state)?;
        let mut current = match from {
            Some(key) => key,
            None => return self.seek_end(state, direction),
        };
        loop {
            let next = merged_step(state, self.dbname, self.txn, Some(&current), direction)?;
            let key = match next {
                Some(key) => key,
                None => {
                    nil_cursor(state, self.dbname, self.id, &self.inner)?;
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
            };
            if position_on_key(state, self.dbname, self.txn, self.id, &key, direction)? {
                return Ok(());
            }
            current = key;
        }
    }

    fn seek_end(&self, state: &mut EnvState, direction: Direction) -> Result<()> {
        let mut from = None;
        loop {
            let key = match merged_step(state, self.dbname, self.txn, from.as_deref(), direction)?
            {
                Some(key) => key,
                None => {
                    nil_cursor(state, self.dbname, self.id, &self.inner)?;
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
            };
            if position_on_key(state, self.dbname, self.txn, self.id, &key, direction)? {
                return Ok(());
            }
            from = Some(key);
        }
    }

    /// Key under the cursor.
    pub fn key(&self) -> Result<Vec<u8>> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        self.current_key(state)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))
    }

    /// Record under the cursor (the current duplicate).
    pub fn record(&self) -> Result<Vec<u8>> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        let key = self
            .current_key(state)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let (entry, _) = self.current_entry(state, &key)?;
        resolve_record(state, self.dbname, &key, &entry)
    }

    /// Size of the record under the cursor.
    pub fn record_size(&self) -> Result<u64> {
        Ok(self.record()?.len() as u64)
    }

    /// Number of duplicates of the current key.
    pub fn duplicate_count(&self) -> Result<u32> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        let key = self
            .current_key(state)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let (db, txns) = db_and_txns(state, self.dbname)?;
        let cache = consolidate(db, txns, self.txn, &key)?;
        Ok(cache.len() as u32)
    }

    /// Insert through the cursor; the cursor ends up on the new item.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;

        let referenced = if flags
            .intersects(InsertFlags::DUPLICATE_INSERT_BEFORE | InsertFlags::DUPLICATE_INSERT_AFTER)
        {
            let db = db_state(state, self.dbname)?;
            let registry = db.cursors.lock();
            registry
                .get(self.id)
                .map(|b| b.dup_pos as u32 + 1)
                .unwrap_or(0)
        } else {
            0
        };

        db_insert(
            &self.inner,
            state,
            self.dbname,
            self.txn,
            key,
            record,
            flags,
            referenced,
        )?;
        position_on_key(state, self.dbname, self.txn, self.id, key, Direction::Up)?;
        self.inner.kick_purge();
        Ok(())
    }

    /// Overwrite the record of the current duplicate.
    pub fn overwrite(&mut self, record: &[u8]) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        let key = self
            .current_key(state)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let (_, dup_pos) = self.current_entry(state, &key)?;

        db_insert(
            &self.inner,
            state,
            self.dbname,
            self.txn,
            &key,
            record,
            InsertFlags::OVERWRITE,
            dup_pos as u32 + 1,
        )?;
        position_on_key(state, self.dbname, self.txn, self.id, &key, Direction::Up)?;
        Ok(())
    }

    /// Erase the current duplicate (the whole key if it is the last one).
    pub fn erase(&mut self) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        let key = self
            .current_key(state)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;

        let (cache_len, dup_pos) = {
            let (db, txns) = db_and_txns(state, self.dbname)?;
            let cache = consolidate(db, txns, self.txn, &key)?;
            let registry = db.cursors.lock();
            let pos = registry.get(self.id).map(|b| b.dup_pos).unwrap_or(0);
            (cache.len(), pos)
        };
        if cache_len == 0 {
            return Err(Error::new(ErrorCode::CursorIsNil));
        }
        let referenced = if cache_len > 1 { dup_pos as u32 + 1 } else { 0 };

        db_erase(
            &self.inner,
            state,
            self.dbname,
            self.txn,
            &key,
            referenced,
        )?;
        nil_cursor(state, self.dbname, self.id, &self.inner)?;
        Ok(())
    }

    /// Close the cursor explicitly; equivalent to dropping it.
    pub fn close(self) {
        drop(self);
    }

    /// Clone the cursor, position included.
    pub fn try_clone(&self) -> Result<Cursor> {
        let _state = self.inner.locked_state()?;
        let id = self
            .registry
            .lock()
            .clone_binding(self.id, &self.inner.pm)
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        Ok(Cursor {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
            dbname: self.dbname,
            id,
            txn: self.txn,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn current_key(&self, state: &mut EnvState) -> Result<Option<Vec<u8>>> {
        use crate::storage::btree::cursor::BtreeCursorState;
        let (db, txns) = db_and_txns(state, self.dbname)?;

        let (btree_state, txn_op) = {
            let registry = db.cursors.lock();
            let binding = registry
                .get(self.id)
                .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
            (binding.btree.clone(), binding.txn_op)
        };
        match btree_state {
            BtreeCursorState::Uncoupled { key, .. } => Ok(Some(key)),
            BtreeCursorState::Coupled { .. } => {
                let mut ctx = Context::new(None);
                Ok(Some(db.btree.cursor_key(&mut ctx, self.id)?))
            }
            BtreeCursorState::Nil => match txn_op {
                Some(op) => Ok(txns.try_op(op).map(|o| o.key.clone())),
                None => Ok(None),
            },
        }
    }

    /// The duplicate-cache entry the cursor currently points at.
    fn current_entry(&self, state: &mut EnvState, key: &[u8]) -> Result<(DupCacheEntry, usize)> {
        let (db, txns) = db_and_txns(state, self.dbname)?;
        let cache = consolidate(db, txns, self.txn, key)?;
        if cache.is_empty() {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        let pos = {
            let registry = db.cursors.lock();
            registry
                .get(self.id)
                .map(|b| b.dup_pos)
                .unwrap_or(0)
                .min(cache.len() - 1)
        };
        Ok((cache[pos].clone(), pos))
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.registry.lock().close(self.id, &self.inner.pm);
    }
}

// ----------------------------------------------------------------------
// Merge machinery (shared with db.rs)
// ----------------------------------------------------------------------

/// Build the effective duplicate list for `key`: btree duplicates in
/// order, then the key's pending ops oldest-to-newest.
pub(crate) fn consolidate(
    db: &mut crate::env::DbState,
    txns: &TxnManager,
    txn: Option<TxnId>,
    key: &[u8],
) -> Result<Vec<DupCacheEntry>> {
    let mut cache: Vec<DupCacheEntry> = Vec::new();
    let mut ctx = Context::new(None);

    if let Some((page, slot, _)) = db.btree.find_position(&mut ctx, key, FindFlags::empty())? {
        let mut guard = page.lock();
        let node = Node::new(&mut guard, db.btree.layout());
        let count = node.dup_count(slot, &mut ctx, db.btree.blobs())?;
        for i in 0..count {
            cache.push(DupCacheEntry::Btree(i as u32));
        }
    }

    let node_id = match db.txn_index.get(key, FindFlags::empty()) {
        Some((id, ApproxMatch::Exact)) => id,
        _ => return Ok(cache),
    };

    for &op_id in db.txn_index.ops(node_id) {
        let op = txns.op(op_id);
        let visible = match txns.status(op.txn_id) {
            Some(crate::txn::TxnStatus::Committed) => true,
            Some(crate::txn::TxnStatus::Active) => txn == Some(op.txn_id),
            _ => false,
        };
        if !visible {
            continue;
        }
        let reference = op.referenced_duplicate as usize;
        match op.kind {
            OpKind::Nop => {}
            OpKind::Insert => {
                cache.clear();
                cache.push(DupCacheEntry::TxnOp(op_id));
            }
            OpKind::InsertOverwrite => {
                if reference == 0 {
                    cache.clear();
                    cache.push(DupCacheEntry::TxnOp(op_id));
                } else if reference - 1 < cache.len() {
                    cache[reference - 1] = DupCacheEntry::TxnOp(op_id);
                } else {
                    cache.push(DupCacheEntry::TxnOp(op_id));
                }
            }
            OpKind::InsertDuplicate => {
                let flags = InsertFlags::from_bits_truncate(op.original_flags);
                let at = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
                    0
                } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
                    reference.saturating_sub(1).min(cache.len())
                } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
                    reference.min(cache.len())
                } else {
                    cache.len()
                };
                cache.insert(at, DupCacheEntry::TxnOp(op_id));
            }
            OpKind::Erase => {
                if reference == 0 {
                    cache.clear();
                } else if reference - 1 < cache.len() {
                    cache.remove(reference - 1);
                }
            }
        }
    }
    Ok(cache)
}

/// Resolve a duplicate-cache entry to its record bytes.
fn resolve_record(
    state: &mut EnvState,
    dbname: DbName,
    key: &[u8],
    entry: &DupCacheEntry,
) -> Result<Vec<u8>> {
    let state = &mut *state;
    match entry {
        DupCacheEntry::TxnOp(op_id) => Ok(state.txns.op(*op_id).record.clone()),
        DupCacheEntry::Btree(index) => {
            let db = db_state(state, dbname)?;
            let mut ctx = Context::new(None);
            let (page, slot, exact) = db.btree.find_leaf(&mut ctx, key, true)?;
            if !exact {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            let mut guard = page.lock();
            let node = Node::new(&mut guard, db.btree.layout());
            node.record(slot, *index as usize, &mut ctx, db.btree.blobs())
        }
    }
}

/// Couple the cursor to `key` and rebuild its duplicate cache. Returns
/// false when the key has no visible duplicates (erased).
fn position_on_key(
    state: &mut EnvState,
    dbname: DbName,
    txn: Option<TxnId>,
    id: CursorId,
    key: &[u8],
    direction: Direction,
) -> Result<bool> {
    let state = &mut *state;
    let cache = {
        let (db, txns) = db_and_txns(state, dbname)?;
        consolidate(db, txns, txn, key)?
    };
    if cache.is_empty() {
        return Ok(false);
    }

    let (db, txns) = db_and_txns(state, dbname)?;
    let mut ctx = Context::new(None);
    db.btree.cursor_find(&mut ctx, id, key, FindFlags::empty())?;

    let txn_op = db
        .txn_index
        .get(key, FindFlags::empty())
        .filter(|(_, approx)| *approx == ApproxMatch::Exact)
        .and_then(|(node, _)| txns.find_visible(db.txn_index.ops(node), txn))
        .map(|(op, _)| op);

    let dup_pos = match direction {
        Direction::Up => 0,
        Direction::Down => cache.len() - 1,
    };
    let mut registry = db.cursors.lock();
    if let Some(binding) = registry.get_mut(id) {
        binding.txn_op = txn_op;
        binding.dup_cache = cache;
        binding.dup_pos = dup_pos;
    }
    Ok(true)
}

fn nil_cursor(
    state: &mut EnvState,
    dbname: DbName,
    id: CursorId,
    inner: &EnvInner,
) -> Result<()> {
    use crate::storage::btree::cursor::BtreeCursorState;
    let db = db_state(state, dbname)?;
    let mut registry = db.cursors.lock();
    registry.set_btree_state(id, &inner.pm, BtreeCursorState::Nil);
    if let Some(binding) = registry.get_mut(id) {
        binding.txn_op = None;
        binding.dup_cache.clear();
        binding.dup_pos = 0;
    }
    Ok(())
}

/// The next candidate key strictly beyond `from` (or the first/last key
/// when `from` is None), merged across both backends.
fn merged_step(
    state: &mut EnvState,
    dbname: DbName,
    txn: Option<TxnId>,
    from: Option<&[u8]>,
    direction: Direction,
) -> Result<Option<Vec<u8>>> {
    let (db, txns) = db_and_txns(state, dbname)?;
    let mut ctx = Context::new(None);

    let txn_candidate = match from {
        None => match direction {
            Direction::Up => txn_cursor::first(txns, &db.txn_index, txn),
            Direction::Down => txn_cursor::last(txns, &db.txn_index, txn),
        }
        .map(|p| db.txn_index.key(p.node).to_vec()),
        Some(key) => {
            let flags = match direction {
                Direction::Up => FindFlags::GT_MATCH,
                Direction::Down => FindFlags::LT_MATCH,
            };
            txn_cursor::find(txns, &db.txn_index, key, flags, txn)
                .map(|(p, _)| db.txn_index.key(p.node).to_vec())
        }
    };

    let btree_candidate = match from {
        None => match direction {
            Direction::Up => db.btree.first_key(&mut ctx)?,
            Direction::Down => db.btree.last_key(&mut ctx)?,
        },
        Some(key) => {
            let flags = match direction {
                Direction::Up => FindFlags::GT_MATCH,
                Direction::Down => FindFlags::LT_MATCH,
            };
            match db.btree.find_position(&mut ctx, key, flags)? {
                Some((page, slot, _)) => {
                    let mut guard = page.lock();
                    let node = Node::new(&mut guard, db.btree.layout());
                    Some(node.key(slot, &mut ctx, db.btree.blobs())?)
                }
                None => None,
            }
        }
    };

    Ok(match (txn_candidate, btree_candidate) {
        (None, None) => None,
        (Some(key), None) | (None, Some(key)) => Some(key),
        (Some(a), Some(b)) => {
            let ordering = db.btree.compare(&a, &b);
            let winner = match (direction, ordering) {
                (_, Ordering::Equal) => a,
                (Direction::Up, Ordering::Less) | (Direction::Down, Ordering::Greater) => a,
                _ => b,
            };
            Some(winner)
        }
    })
}

/// Transaction-aware find (used by `Database::find` and `Cursor::find`).
pub(crate) fn merged_find(
    state: &mut EnvState,
    dbname: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    flags: FindFlags,
) -> Result<FindResult> {
    // exact lookup: consolidate and answer
    if !flags.is_approximate() {
        let record = {
            let state = &mut *state;
            let entry = {
                let (db, txns) = db_and_txns(state, dbname)?;
                consolidate(db, txns, txn, key)?.first().cloned()
            };
            match entry {
                None => return Err(Error::new(ErrorCode::KeyNotFound)),
                Some(entry) => resolve_record(state, dbname, key, &entry)?,
            }
        };
        return Ok(FindResult {
            key: key.to_vec(),
            record,
            approx: ApproxMatch::Exact,
        });
    }

    // approximate: both backends position independently; the merge
    // comparator picks the winner, erased winners are stepped over
    let mut search_key = key.to_vec();
    let mut search_flags = flags;
    loop {
        let winner = {
            let state = &mut *state;
            let (db, txns) = db_and_txns(state, dbname)?;
            let mut ctx = Context::new(None);

            let txn_candidate = txn_cursor::find(txns, &db.txn_index, &search_key, search_flags, txn)
                .map(|(p, approx)| (db.txn_index.key(p.node).to_vec(), approx));
            let btree_candidate = match db.btree.find_position(&mut ctx, &search_key, search_flags)? {
                Some((page, slot, approx)) => {
                    let mut guard = page.lock();
                    let node = Node::new(&mut guard, db.btree.layout());
                    Some((node.key(slot, &mut ctx, db.btree.blobs())?, approx))
                }
                None => None,
            };
            merge_candidates(db, txn_candidate, btree_candidate)
        };

        let (winner_key, winner_approx) = match winner {
            Some(w) => w,
            None => return Err(Error::new(ErrorCode::KeyNotFound)),
        };

        let entry = {
            let state = &mut *state;
            let (db, txns) = db_and_txns(state, dbname)?;
            consolidate(db, txns, txn, &winner_key)?.first().cloned()
        };
        match entry {
            Some(entry) => {
                let record = resolve_record(state, dbname, &winner_key, &entry)?;
                let approx = if winner_key == key {
                    ApproxMatch::Exact
                } else {
                    winner_approx
                };
                return Ok(FindResult {
                    key: winner_key,
                    record,
                    approx,
                });
            }
            None => {
                // erased in a transaction: step once more, same direction
                search_flags = match winner_approx {
                    ApproxMatch::Lower => FindFlags::LT_MATCH,
                    ApproxMatch::Greater => FindFlags::GT_MATCH,
                    ApproxMatch::Exact => {
                        if flags.intersects(FindFlags::GEQ_MATCH | FindFlags::GT_MATCH) {
                            FindFlags::GT_MATCH
                        } else if flags.intersects(FindFlags::LEQ_MATCH | FindFlags::LT_MATCH) {
                            FindFlags::LT_MATCH
                        } else {
                            return Err(Error::new(ErrorCode::KeyNotFound));
                        }
                    }
                };
                search_key = winner_key;
            }
        }
    }
}

/// Pick the better of two approximate candidates: exact wins, then the
/// closer key in the match direction; near-matches prefer the greater
/// side.
fn merge_candidates(
    db: &crate::env::DbState,
    txn_candidate: Option<(Vec<u8>, ApproxMatch)>,
    btree_candidate: Option<(Vec<u8>, ApproxMatch)>,
) -> Option<(Vec<u8>, ApproxMatch)> {
    match (txn_candidate, btree_candidate) {
        (None, None) => None,
        (Some(c), None) | (None, Some(c)) => Some(c),
        (Some((tk, ta)), Some((bk, ba))) => {
            if db.btree.compare(&tk, &bk) == Ordering::Equal {
                return Some((tk, ta));
            }
            if ta == ApproxMatch::Exact {
                return Some((tk, ta));
            }
            if ba == ApproxMatch::Exact {
                return Some((bk, ba));
            }
            match (ta, ba) {
                (ApproxMatch::Greater, ApproxMatch::Greater) => {
                    // closest above
                    if db.btree.compare(&tk, &bk) == Ordering::Less {
                        Some((tk, ta))
                    } else {
                        Some((bk, ba))
                    }
                }
                (ApproxMatch::Lower, ApproxMatch::Lower) => {
                    // closest below
                    if db.btree.compare(&tk, &bk) == Ordering::Greater {
                        Some((tk, ta))
                    } else {
                        Some((bk, ba))
                    }
                }
                // mixed directions only happen for near-matches
                (ApproxMatch::Greater, _) => Some((tk, ta)),
                (_, ApproxMatch::Greater) => Some((bk, ba)),
                _ => Some((tk, ta)),
            }
        }
    }
}

/// Transaction-aware count: walk the merged view.
pub(crate) fn merged_count(
    state: &mut EnvState,
    dbname: DbName,
    txn: Option<TxnId>,
    distinct: bool,
) -> Result<u64> {
    let mut total = 0u64;
    let mut current: Option<Vec<u8>> = None;
    loop {
        let next = merged_step(state, dbname, txn, current.as_deref(), Direction::Up)?;
        let key = match next {
            Some(key) => key,
            None => return Ok(total),
        };
        {
            let state = &mut *state;
            let (db, txns) = db_and_txns(state, dbname)?;
            let cache = consolidate(db, txns, txn, &key)?;
            if !cache.is_empty() {
                total += if distinct { 1 } else { cache.len() as u64 };
            }
        }
        current = Some(key);
    }
}
