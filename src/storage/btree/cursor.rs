//! Btree cursor state and the per-database cursor registry.
//!
//! Cursors are values held by the user; the engine reaches them through
//! stable integer ids into a registry owned by the database. A coupled
//! cursor pins its page in the cache; uncoupling copies the current key
//! out so structural changes cannot invalidate the position.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::pager::PageManager;
use crate::types::PageAddr;

/// Stable cursor id inside a database's registry.
pub type CursorId = usize;

/// Position of a btree cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtreeCursorState {
    /// Not positioned
    Nil,
    /// Attached to a slot of a resident page
    Coupled {
        page: PageAddr,
        slot: usize,
        dup: usize,
    },
    /// Detached; the key was copied out and will be re-found on demand
    Uncoupled { key: Vec<u8>, dup: usize },
}

/// One entry of a cursor's duplicate cache: the effective duplicate list
/// for the current key after merging btree and transaction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DupCacheEntry {
    /// Index into the btree-side duplicate table
    Btree(u32),
    /// A pending transaction operation (op id)
    TxnOp(u64),
}

/// Engine-side state of one user cursor.
#[derive(Debug, Clone)]
pub struct CursorBinding {
    pub btree: BtreeCursorState,
    /// Transaction op this cursor is coupled to, if any
    pub txn_op: Option<u64>,
    /// Merged duplicate list for the current key
    pub dup_cache: Vec<DupCacheEntry>,
    /// Position inside the duplicate cache
    pub dup_pos: usize,
}

impl CursorBinding {
    fn new() -> Self {
        CursorBinding {
            btree: BtreeCursorState::Nil,
            txn_op: None,
            dup_cache: Vec::new(),
            dup_pos: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.btree == BtreeCursorState::Nil && self.txn_op.is_none()
    }
}

/// Registry of all cursors of one database.
#[derive(Default)]
pub struct CursorRegistry {
    entries: Vec<Option<CursorBinding>>,
}

/// Registry handle shared between the database, the btree and the
/// transaction layer.
pub type CursorRegistryRef = Arc<Mutex<CursorRegistry>>;

impl CursorRegistry {
    pub fn new() -> Self {
        CursorRegistry::default()
    }

    pub fn create(&mut self) -> CursorId {
        for (id, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(CursorBinding::new());
                return id;
            }
        }
        self.entries.push(Some(CursorBinding::new()));
        self.entries.len() - 1
    }

    /// Duplicate an existing binding into a fresh id; a coupled clone
    /// takes its own pin on the page.
    pub fn clone_binding(&mut self, id: CursorId, pm: &PageManager) -> Option<CursorId> {
        let binding = self.entries.get(id)?.clone()?;
        if let BtreeCursorState::Coupled { page, .. } = &binding.btree {
            if let Some(page_ref) = pm.try_fetch_cached(*page) {
                page_ref.lock().attach_cursor();
            }
        }
        let new_id = self.create();
        self.entries[new_id] = Some(binding);
        Some(new_id)
    }

    pub fn close(&mut self, id: CursorId, pm: &PageManager) {
        if let Some(Some(binding)) = self.entries.get_mut(id).map(Option::take) {
            release_pin(&binding.btree, pm);
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn get(&self, id: CursorId) -> Option<&CursorBinding> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CursorId) -> Option<&mut CursorBinding> {
        self.entries.get_mut(id).and_then(Option::as_mut)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CursorId, &mut CursorBinding)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(id, e)| e.as_mut().map(|b| (id, b)))
    }

    /// Set the btree position of `id`, keeping page pin counts straight.
    pub fn set_btree_state(&mut self, id: CursorId, pm: &PageManager, new: BtreeCursorState) {
        if let Some(binding) = self.get_mut(id) {
            let old = std::mem::replace(&mut binding.btree, new);
            // note: order matters when old and new share a page
            if let BtreeCursorState::Coupled { page, .. } = &binding.btree {
                if let Some(page_ref) = pm.try_fetch_cached(*page) {
                    page_ref.lock().attach_cursor();
                }
            }
            release_pin(&old, pm);
        }
    }

    /// Nil out every cursor coupled to the transaction op `op_id`.
    pub fn detach_from_op(&mut self, op_id: u64) {
        for (_, binding) in self.iter_mut() {
            if binding.txn_op == Some(op_id) {
                binding.txn_op = None;
                binding.dup_cache.clear();
                binding.dup_pos = 0;
            }
        }
    }
}

fn release_pin(state: &BtreeCursorState, pm: &PageManager) {
    if let BtreeCursorState::Coupled { page, .. } = state {
        // the page may already be gone if it was freed
        if let Some(page_ref) = pm.try_fetch_cached(*page) {
            page_ref.lock().detach_cursor();
        }
    }
}
