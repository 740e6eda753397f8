//! B+tree index with chained leaves.
//!
//! Internal nodes hold separator keys plus one left-child pointer per node
//! and one child pointer per slot; leaves hold keys and records and are
//! linked into a doubly-linked sibling chain.

pub mod cursor;
pub mod keylist;
pub mod node;
pub mod recordlist;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob::BlobManager;
use crate::storage::changeset::Context;
use crate::storage::page::{PageRef, PageType};
use crate::storage::pager::{AllocFlags, FetchFlags, PageManager};
use crate::types::{ApproxMatch, CompareFn, FindFlags, InsertFlags, PageAddr};

use cursor::{BtreeCursorState, CursorId, CursorRegistryRef};
use node::{BtreeLayout, Node};
use recordlist::{DupPosition, RecordListKind};

/// Inserts at the tail/head needed before the split heuristic kicks in.
const HINT_THRESHOLD: u32 = 8;

/// Structural-modification counters plus the append/prepend hints that
/// drive the split pivot choice.
#[derive(Debug, Default, Clone)]
pub struct BtreeStatistics {
    pub append_count: u32,
    pub prepend_count: u32,
    pub smo_split: u64,
    pub smo_merge: u64,
}

enum InsertEffect {
    Done,
    Split { sep: Vec<u8>, right: PageAddr },
}

/// The btree of one database.
pub struct BtreeIndex {
    layout: BtreeLayout,
    cmp: CompareFn,
    pm: Arc<PageManager>,
    blobs: BlobManager,
    cursors: CursorRegistryRef,
    pub root: PageAddr,
    pub stats: BtreeStatistics,
}

impl BtreeIndex {
    pub fn new(
        layout: BtreeLayout,
        cmp: CompareFn,
        pm: Arc<PageManager>,
        cursors: CursorRegistryRef,
        root: PageAddr,
    ) -> Self {
        let blobs = BlobManager::new(pm.clone());
        BtreeIndex {
            layout,
            cmp,
            pm,
            blobs,
            cursors,
            root,
            stats: BtreeStatistics::default(),
        }
    }

    pub fn layout(&self) -> &BtreeLayout {
        &self.layout
    }

    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        (self.cmp)(lhs, rhs)
    }

    pub fn blobs(&self) -> &BlobManager {
        &self.blobs
    }

    /// Allocate the empty root leaf of a fresh database.
    pub fn create(&mut self, ctx: &mut Context) -> Result<()> {
        let page = self
            .pm
            .alloc(ctx, PageType::Index, AllocFlags::CLEAR_WITH_ZERO)?;
        let mut guard = page.lock();
        Node::init(&mut guard, &self.layout, true);
        self.root = guard.address();
        Ok(())
    }

    fn fetch(&self, ctx: &mut Context, addr: PageAddr, read_only: bool) -> Result<PageRef> {
        let flags = if read_only {
            FetchFlags::READ_ONLY
        } else {
            FetchFlags::empty()
        };
        self.pm.fetch(ctx, addr, flags)
    }

    // ==================================================================
    // Search
    // ==================================================================

    /// Descend to the leaf that covers `key`; returns the leaf page plus
    /// `(lower_bound, exact)` inside it.
    pub fn find_leaf(
        &self,
        ctx: &mut Context,
        key: &[u8],
        read_only: bool,
    ) -> Result<(PageRef, usize, bool)> {
        let mut addr = self.root;
        loop {
            let page = self.fetch(ctx, addr, read_only)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if node.is_leaf() {
                let (lb, exact) = node.search(key, &self.cmp, ctx, &self.blobs)?;
                drop(guard);
                return Ok((page, lb, exact));
            }
            addr = node.child_for(key, &self.cmp, ctx, &self.blobs)?;
        }
    }

    /// Point lookup with optional approximate matching. Returns the actual
    /// key, the record and the match direction.
    pub fn find(
        &mut self,
        ctx: &mut Context,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<Option<(Vec<u8>, Vec<u8>, ApproxMatch)>> {
        let position = self.find_position(ctx, key, flags)?;
        match position {
            None => Ok(None),
            Some((page, slot, approx)) => {
                let mut guard = page.lock();
                let node = Node::new(&mut guard, &self.layout);
                let actual = node.key(slot, ctx, &self.blobs)?;
                let record = node.record(slot, 0, ctx, &self.blobs)?;
                Ok(Some((actual, record, approx)))
            }
        }
    }

    /// Resolve `key` + approximate-match flags into a concrete leaf slot.
    pub fn find_position(
        &self,
        ctx: &mut Context,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<Option<(PageRef, usize, ApproxMatch)>> {
        if self.root == 0 {
            return Ok(None);
        }
        let (page, lb, exact) = self.find_leaf(ctx, key, true)?;

        if exact {
            if flags.contains(FindFlags::LT_MATCH) {
                return Ok(self
                    .step_prev(ctx, &page, lb)?
                    .map(|(p, s)| (p, s, ApproxMatch::Lower)));
            }
            if flags.contains(FindFlags::GT_MATCH) {
                return Ok(self
                    .step_next(ctx, &page, lb)?
                    .map(|(p, s)| (p, s, ApproxMatch::Greater)));
            }
            return Ok(Some((page, lb, ApproxMatch::Exact)));
        }

        if !flags.is_approximate() {
            return Ok(None);
        }

        let wants_greater =
            flags.intersects(FindFlags::GT_MATCH | FindFlags::GEQ_MATCH);
        let wants_lower = flags.intersects(FindFlags::LT_MATCH | FindFlags::LEQ_MATCH);

        // `lb` is the first slot >= key: the GEQ candidate; LEQ is one
        // step back. NEAR prefers the greater side.
        if wants_greater {
            if let Some((p, s)) = self.candidate_at(ctx, &page, lb)? {
                return Ok(Some((p, s, ApproxMatch::Greater)));
            }
            if !wants_lower {
                return Ok(None);
            }
        }
        if wants_lower {
            if let Some((p, s)) = self.step_prev(ctx, &page, lb)? {
                return Ok(Some((p, s, ApproxMatch::Lower)));
            }
        }
        Ok(None)
    }

    /// `(page, lb)` as a valid slot, crossing to the right sibling when
    /// `lb` is one past the end.
    fn candidate_at(
        &self,
        ctx: &mut Context,
        page: &PageRef,
        lb: usize,
    ) -> Result<Option<(PageRef, usize)>> {
        let (length, right) = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            (node.length(), node.right_sibling())
        };
        if lb < length {
            return Ok(Some((page.clone(), lb)));
        }
        let mut next = right;
        while next != 0 {
            let sibling = self.fetch(ctx, next, true)?;
            let (len, r) = {
                let mut guard = sibling.lock();
                let node = Node::new(&mut guard, &self.layout);
                (node.length(), node.right_sibling())
            };
            if len > 0 {
                return Ok(Some((sibling, 0)));
            }
            next = r;
        }
        Ok(None)
    }

    /// The slot after `(page, slot)` in key order.
    fn step_next(
        &self,
        ctx: &mut Context,
        page: &PageRef,
        slot: usize,
    ) -> Result<Option<(PageRef, usize)>> {
        self.candidate_at(ctx, page, slot + 1)
    }

    /// The slot before `(page, lb)` in key order.
    fn step_prev(
        &self,
        ctx: &mut Context,
        page: &PageRef,
        lb: usize,
    ) -> Result<Option<(PageRef, usize)>> {
        if lb > 0 {
            return Ok(Some((page.clone(), lb - 1)));
        }
        let mut prev = {
            let mut guard = page.lock();
            Node::new(&mut guard, &self.layout).left_sibling()
        };
        while prev != 0 {
            let sibling = self.fetch(ctx, prev, true)?;
            let (len, l) = {
                let mut guard = sibling.lock();
                let node = Node::new(&mut guard, &self.layout);
                (node.length(), node.left_sibling())
            };
            if len > 0 {
                return Ok(Some((sibling, len - 1)));
            }
            prev = l;
        }
        Ok(None)
    }

    // ==================================================================
    // Insert
    // ==================================================================

    pub fn insert(
        &mut self,
        ctx: &mut Context,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_position: Option<DupPosition>,
    ) -> Result<()> {
        let effect = self.insert_at(ctx, self.root, key, record, flags, dup_position)?;
        if let InsertEffect::Split { sep, right } = effect {
            self.grow_root(ctx, sep, right)?;
        }
        Ok(())
    }

    fn grow_root(&mut self, ctx: &mut Context, sep: Vec<u8>, right: PageAddr) -> Result<()> {
        let page = self
            .pm
            .alloc(ctx, PageType::Index, AllocFlags::CLEAR_WITH_ZERO)?;
        let mut guard = page.lock();
        let mut node = Node::init(&mut guard, &self.layout, false);
        node.set_left_child(self.root);
        node.insert_slot(0, &sep, ctx, &self.blobs)?;
        node.set_child(0, right);
        self.root = guard.address();
        Ok(())
    }

    fn insert_at(
        &mut self,
        ctx: &mut Context,
        addr: PageAddr,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_position: Option<DupPosition>,
    ) -> Result<InsertEffect> {
        let page = self.fetch(ctx, addr, false)?;
        let is_leaf = {
            let mut guard = page.lock();
            Node::new(&mut guard, &self.layout).is_leaf()
        };

        if is_leaf {
            return self.insert_into_leaf(ctx, addr, key, record, flags, dup_position);
        }

        let child = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            node.child_for(key, &self.cmp, ctx, &self.blobs)?
        };

        let effect = self.insert_at(ctx, child, key, record, flags, dup_position)?;
        let (sep, right) = match effect {
            InsertEffect::Done => return Ok(InsertEffect::Done),
            InsertEffect::Split { sep, right } => (sep, right),
        };

        self.insert_separator(ctx, addr, sep, right)
    }

    /// Add a separator produced by a child split into the internal node at
    /// `addr`, splitting it in turn if necessary.
    fn insert_separator(
        &mut self,
        ctx: &mut Context,
        addr: PageAddr,
        sep: Vec<u8>,
        right: PageAddr,
    ) -> Result<InsertEffect> {
        let page = self.fetch(ctx, addr, false)?;
        let needs_split = {
            let mut guard = page.lock();
            Node::new(&mut guard, &self.layout).requires_split(&sep)
        };

        if !needs_split {
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            let (lb, exact) = node.search(&sep, &self.cmp, ctx, &self.blobs)?;
            debug_assert!(!exact);
            node.insert_slot(lb, &sep, ctx, &self.blobs)?;
            node.set_child(lb, right);
            return Ok(InsertEffect::Done);
        }

        let (parent_sep, new_right) = self.split_node(ctx, addr)?;
        let target = if self.compare(&sep, &parent_sep) == Ordering::Less {
            addr
        } else {
            new_right
        };
        {
            let target_page = self.fetch(ctx, target, false)?;
            let mut guard = target_page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            let (lb, _) = node.search(&sep, &self.cmp, ctx, &self.blobs)?;
            node.insert_slot(lb, &sep, ctx, &self.blobs)?;
            node.set_child(lb, right);
        }
        Ok(InsertEffect::Split {
            sep: parent_sep,
            right: new_right,
        })
    }

    fn insert_into_leaf(
        &mut self,
        ctx: &mut Context,
        addr: PageAddr,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_position: Option<DupPosition>,
    ) -> Result<InsertEffect> {
        let page = self.fetch(ctx, addr, false)?;

        // existing key?
        let (lb, exact) = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            node.search(key, &self.cmp, ctx, &self.blobs)?
        };

        if exact {
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            if flags.contains(InsertFlags::DUPLICATE) {
                if node.geo.rec_kind != RecordListKind::Duplicate {
                    return Err(Error::new(ErrorCode::InvParameter));
                }
                let position = dup_position.unwrap_or(DupPosition::Last);
                node.dup_insert(lb, position, record, ctx, &self.blobs)?;
            } else if flags.contains(InsertFlags::OVERWRITE) {
                node.set_record(lb, record, ctx, &self.blobs)?;
            } else {
                return Err(Error::new(ErrorCode::DuplicateKey));
            }
            return Ok(InsertEffect::Done);
        }

        let needs_split = {
            let mut guard = page.lock();
            Node::new(&mut guard, &self.layout).requires_split(key)
        };

        if !needs_split {
            self.update_hints(ctx, &page, lb)?;
            self.uncouple_all_cursors(ctx, addr, lb)?;
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            node.insert_slot(lb, key, ctx, &self.blobs)?;
            node.set_record(lb, record, ctx, &self.blobs)?;
            return Ok(InsertEffect::Done);
        }

        let (sep, right) = self.split_node(ctx, addr)?;
        let target = if self.compare(key, &sep) == Ordering::Less {
            addr
        } else {
            right
        };
        // the halves have room now; a single retry cannot split again
        match self.insert_into_leaf(ctx, target, key, record, flags, dup_position)? {
            InsertEffect::Done => Ok(InsertEffect::Split { sep, right }),
            InsertEffect::Split { .. } => Err(Error::new(ErrorCode::LimitsReached)),
        }
    }

    fn update_hints(&mut self, _ctx: &mut Context, page: &PageRef, slot: usize) -> Result<()> {
        let mut guard = page.lock();
        let node = Node::new(&mut guard, &self.layout);
        if node.right_sibling() == 0 && slot == node.length() {
            self.stats.append_count += 1;
            self.stats.prepend_count = 0;
        } else if node.left_sibling() == 0 && slot == 0 {
            self.stats.prepend_count += 1;
            self.stats.append_count = 0;
        } else {
            self.stats.append_count = 0;
            self.stats.prepend_count = 0;
        }
        Ok(())
    }

    // ==================================================================
    // Split
    // ==================================================================

    /// Split the node at `addr`; returns the separator key for the parent
    /// and the new right sibling's address.
    fn split_node(&mut self, ctx: &mut Context, addr: PageAddr) -> Result<(Vec<u8>, PageAddr)> {
        let left_page = self.fetch(ctx, addr, false)?;
        let right_page = self
            .pm
            .alloc(ctx, PageType::Index, AllocFlags::CLEAR_WITH_ZERO)?;

        let length = {
            let mut guard = left_page.lock();
            Node::new(&mut guard, &self.layout).length()
        };
        let pivot = self.split_pivot(length);

        self.uncouple_all_cursors(ctx, addr, pivot)?;

        let mut left_guard = left_page.lock();
        let mut right_guard = right_page.lock();
        let mut left = Node::new(&mut left_guard, &self.layout);
        let is_leaf = left.is_leaf();
        let mut right = Node::init(&mut right_guard, &self.layout, is_leaf);
        let right_addr = right.address();

        let sep;
        if is_leaf {
            for slot in pivot..length {
                let (k, r) = left.take_raw(slot);
                right.append_raw(&k, &r)?;
            }
            while left.length() > pivot {
                let last = left.length() - 1;
                left.remove_raw(last);
            }
            sep = right.key(0, ctx, &self.blobs)?;

            // splice the new node into the leaf chain
            let old_right = left.right_sibling();
            right.set_right_sibling(old_right);
            right.set_left_sibling(addr);
            left.set_right_sibling(right_addr);
            drop(left_guard);
            drop(right_guard);
            if old_right != 0 {
                let next = self.fetch(ctx, old_right, false)?;
                let mut guard = next.lock();
                Node::new(&mut guard, &self.layout).set_left_sibling(right_addr);
            }
        } else {
            sep = left.key(pivot, ctx, &self.blobs)?;
            right.set_left_child(left.child(pivot));
            for slot in pivot + 1..length {
                let (k, r) = left.take_raw(slot);
                right.append_raw(&k, &r)?;
            }
            while left.length() > pivot + 1 {
                let last = left.length() - 1;
                left.remove_raw(last);
            }
            // the pivot key moves up; release its slot (and key blob)
            left.erase_slot(pivot, ctx, &self.blobs)?;
        }

        self.stats.smo_split += 1;
        log::trace!("split node {:#x}, new right sibling {:#x}", addr, right_addr);
        Ok((sep, right_addr))
    }

    fn split_pivot(&self, length: usize) -> usize {
        let pivot = if self.stats.append_count > HINT_THRESHOLD {
            length.saturating_sub(1)
        } else if self.stats.prepend_count > HINT_THRESHOLD {
            1
        } else {
            length / 2
        };
        // the separator is read from slot `pivot`; keep it in range
        pivot.min(length.saturating_sub(1))
    }

    /// Overwrite one duplicate of `key` in place.
    pub fn overwrite_duplicate(
        &mut self,
        ctx: &mut Context,
        key: &[u8],
        dup_index: usize,
        record: &[u8],
    ) -> Result<()> {
        let (page, slot, exact) = self.find_leaf(ctx, key, false)?;
        if !exact {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        let mut guard = page.lock();
        let mut node = Node::new(&mut guard, &self.layout);
        if node.geo.rec_kind == RecordListKind::Duplicate {
            node.dup_set(slot, dup_index, record, ctx, &self.blobs)
        } else {
            node.set_record(slot, record, ctx, &self.blobs)
        }
    }

    /// Smallest key of the tree.
    pub fn first_key(&self, ctx: &mut Context) -> Result<Option<Vec<u8>>> {
        let mut addr = self.leftmost_leaf(ctx)?;
        while addr != 0 {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if node.length() > 0 {
                return Ok(Some(node.key(0, ctx, &self.blobs)?));
            }
            addr = node.right_sibling();
        }
        Ok(None)
    }

    /// Largest key of the tree.
    pub fn last_key(&self, ctx: &mut Context) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut addr = self.root;
        loop {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if !node.is_leaf() {
                let len = node.length();
                addr = if len == 0 {
                    node.left_child()
                } else {
                    node.child(len - 1)
                };
                continue;
            }
            let (len, left) = (node.length(), node.left_sibling());
            if len > 0 {
                return Ok(Some(node.key(len - 1, ctx, &self.blobs)?));
            }
            if left == 0 {
                return Ok(None);
            }
            addr = left;
        }
    }

    // ==================================================================
    // Erase
    // ==================================================================

    /// Erase `key`; with `dup_index` only that duplicate is removed.
    pub fn erase(
        &mut self,
        ctx: &mut Context,
        key: &[u8],
        dup_index: Option<usize>,
    ) -> Result<()> {
        self.erase_at(ctx, self.root, key, dup_index)?;
        self.collapse_root(ctx)
    }

    fn erase_at(
        &mut self,
        ctx: &mut Context,
        addr: PageAddr,
        key: &[u8],
        dup_index: Option<usize>,
    ) -> Result<()> {
        let page = self.fetch(ctx, addr, false)?;
        let (is_leaf, child_slot, child_addr) = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if node.is_leaf() {
                (true, None, 0)
            } else {
                let (lb, exact) = node.search(key, &self.cmp, ctx, &self.blobs)?;
                let slot = if exact {
                    Some(lb)
                } else if lb == 0 {
                    None
                } else {
                    Some(lb - 1)
                };
                let child = match slot {
                    Some(s) => node.child(s),
                    None => node.left_child(),
                };
                (false, Some(slot), child)
            }
        };

        if is_leaf {
            return self.erase_in_leaf(ctx, addr, key, dup_index);
        }

        self.erase_at(ctx, child_addr, key, dup_index)?;
        self.maybe_merge(ctx, addr, child_slot.unwrap(), child_addr)
    }

    fn erase_in_leaf(
        &mut self,
        ctx: &mut Context,
        addr: PageAddr,
        key: &[u8],
        dup_index: Option<usize>,
    ) -> Result<()> {
        let page = self.fetch(ctx, addr, false)?;
        let (slot, exact) = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            node.search(key, &self.cmp, ctx, &self.blobs)?
        };
        if !exact {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }

        // removing one duplicate of several leaves the slot in place
        if let Some(dup) = dup_index {
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            if node.geo.rec_kind == RecordListKind::Duplicate {
                let count = node.dup_count(slot, ctx, &self.blobs)?;
                if dup >= count {
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
                if count > 1 {
                    node.dup_erase(slot, dup, ctx, &self.blobs)?;
                    return Ok(());
                }
            }
        }

        self.uncouple_all_cursors(ctx, addr, slot)?;
        let mut guard = page.lock();
        let mut node = Node::new(&mut guard, &self.layout);
        node.erase_slot(slot, ctx, &self.blobs)?;
        Ok(())
    }

    /// After an erase below `parent`, merge the child at `child_slot`
    /// (`None` = left child) with a sibling if it underflowed.
    fn maybe_merge(
        &mut self,
        ctx: &mut Context,
        parent_addr: PageAddr,
        child_slot: Option<usize>,
        child_addr: PageAddr,
    ) -> Result<()> {
        let child_page = self.fetch(ctx, child_addr, true)?;
        let (child_len, child_capacity) = {
            let mut guard = child_page.lock();
            let node = Node::new(&mut guard, &self.layout);
            (node.length(), node.geo.capacity)
        };
        if child_len >= child_capacity / 3 {
            return Ok(());
        }

        let parent_page = self.fetch(ctx, parent_addr, false)?;
        let parent_len = {
            let mut guard = parent_page.lock();
            Node::new(&mut guard, &self.layout).length()
        };
        if parent_len == 0 {
            return Ok(());
        }

        // pick the neighbour under the same parent: prefer the right one
        let (left_addr, right_addr, sep_slot) = {
            let mut guard = parent_page.lock();
            let node = Node::new(&mut guard, &self.layout);
            match child_slot {
                None => (child_addr, node.child(0), 0),
                Some(i) if i + 1 < parent_len => (child_addr, node.child(i + 1), i + 1),
                Some(i) => {
                    let left = if i == 0 {
                        node.left_child()
                    } else {
                        node.child(i - 1)
                    };
                    (left, child_addr, i)
                }
            }
        };

        if !self.merge_fits(ctx, left_addr, right_addr)? {
            return Ok(());
        }
        self.merge_nodes(ctx, parent_addr, left_addr, right_addr, sep_slot)
    }

    fn merge_fits(
        &self,
        ctx: &mut Context,
        left_addr: PageAddr,
        right_addr: PageAddr,
    ) -> Result<bool> {
        let left_page = self.fetch(ctx, left_addr, true)?;
        let right_page = self.fetch(ctx, right_addr, true)?;
        let mut left_guard = left_page.lock();
        let mut right_guard = right_page.lock();
        let left = Node::new(&mut left_guard, &self.layout);
        let right = Node::new(&mut right_guard, &self.layout);

        // +1 slot for the separator pulled down into internal nodes
        let extra = if left.is_leaf() { 0 } else { 1 };
        if left.length() + right.length() + extra > left.geo.capacity {
            return Ok(false);
        }
        // the directory entries count towards used bytes already
        Ok(left.key_free_bytes() > right.key_used_bytes() + extra * 64)
    }

    fn merge_nodes(
        &mut self,
        ctx: &mut Context,
        parent_addr: PageAddr,
        left_addr: PageAddr,
        right_addr: PageAddr,
        sep_slot: usize,
    ) -> Result<()> {
        self.uncouple_all_cursors(ctx, left_addr, 0)?;
        self.uncouple_all_cursors(ctx, right_addr, 0)?;

        let parent_page = self.fetch(ctx, parent_addr, false)?;
        let sep_key = {
            let mut guard = parent_page.lock();
            let node = Node::new(&mut guard, &self.layout);
            node.key(sep_slot, ctx, &self.blobs)?
        };

        let left_page = self.fetch(ctx, left_addr, false)?;
        let right_page = self.fetch(ctx, right_addr, false)?;
        {
            let mut left_guard = left_page.lock();
            let mut right_guard = right_page.lock();
            let mut left = Node::new(&mut left_guard, &self.layout);
            let right = Node::new(&mut right_guard, &self.layout);
            let is_leaf = left.is_leaf();

            if !is_leaf {
                // pull the separator down, child = right's left child
                let at = left.length();
                left.insert_slot(at, &sep_key, ctx, &self.blobs)?;
                left.set_child(at, right.left_child());
            }
            for slot in 0..right.length() {
                let (k, r) = right.take_raw(slot);
                left.append_raw(&k, &r)?;
            }

            if is_leaf {
                let next = right.right_sibling();
                left.set_right_sibling(next);
                drop(right_guard);
                drop(left_guard);
                if next != 0 {
                    let next_page = self.fetch(ctx, next, false)?;
                    let mut guard = next_page.lock();
                    Node::new(&mut guard, &self.layout).set_left_sibling(left_addr);
                }
            }
        }

        {
            let mut guard = parent_page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            node.erase_slot(sep_slot, ctx, &self.blobs)?;
        }

        self.pm.del(ctx, right_addr, 1);
        self.stats.smo_merge += 1;
        log::trace!("merged node {:#x} into {:#x}", right_addr, left_addr);
        Ok(())
    }

    /// An empty internal root hands its only child up as the new root.
    fn collapse_root(&mut self, ctx: &mut Context) -> Result<()> {
        loop {
            let page = self.fetch(ctx, self.root, true)?;
            let (is_leaf, length, left_child) = {
                let mut guard = page.lock();
                let node = Node::new(&mut guard, &self.layout);
                (node.is_leaf(), node.length(), node.left_child())
            };
            if is_leaf || length > 0 {
                return Ok(());
            }
            self.uncouple_all_cursors(ctx, self.root, 0)?;
            let old_root = self.root;
            self.root = left_child;
            self.pm.del(ctx, old_root, 1);
        }
    }

    // ==================================================================
    // Cursor support
    // ==================================================================

    /// Uncouple every cursor coupled to `page_addr` at a slot >= `start`.
    pub fn uncouple_all_cursors(
        &self,
        ctx: &mut Context,
        page_addr: PageAddr,
        start: usize,
    ) -> Result<()> {
        let affected: Vec<(CursorId, usize, usize)> = {
            let mut registry = self.cursors.lock();
            registry
                .iter_mut()
                .filter_map(|(id, binding)| match binding.btree {
                    BtreeCursorState::Coupled { page, slot, dup }
                        if page == page_addr && slot >= start =>
                    {
                        Some((id, slot, dup))
                    }
                    _ => None,
                })
                .collect()
        };
        if affected.is_empty() {
            return Ok(());
        }

        let page = self.fetch(ctx, page_addr, true)?;
        let mut keys = Vec::with_capacity(affected.len());
        {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            for &(id, slot, dup) in &affected {
                keys.push((id, node.key(slot, ctx, &self.blobs)?, dup));
            }
        }

        let mut registry = self.cursors.lock();
        for (id, key, dup) in keys {
            registry.set_btree_state(id, &self.pm, BtreeCursorState::Uncoupled { key, dup });
        }
        Ok(())
    }

    /// Position the cursor on `key` (with approximate matching); returns
    /// the match direction, or None if nothing matched.
    pub fn cursor_find(
        &mut self,
        ctx: &mut Context,
        id: CursorId,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<Option<ApproxMatch>> {
        match self.find_position(ctx, key, flags)? {
            None => {
                self.cursors.lock().set_btree_state(id, &self.pm, BtreeCursorState::Nil);
                Ok(None)
            }
            Some((page, slot, approx)) => {
                let addr = page.lock().address();
                self.couple(id, addr, slot, 0);
                Ok(Some(approx))
            }
        }
    }

    fn couple(&self, id: CursorId, page: PageAddr, slot: usize, dup: usize) {
        self.cursors.lock().set_btree_state(
            id,
            &self.pm,
            BtreeCursorState::Coupled { page, slot, dup },
        );
    }

    /// Move to the first key; false when the tree is empty.
    pub fn cursor_first(&mut self, ctx: &mut Context, id: CursorId) -> Result<bool> {
        let mut addr = self.root;
        if addr == 0 {
            return Ok(false);
        }
        loop {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if !node.is_leaf() {
                addr = node.left_child();
                continue;
            }
            let (len, right) = (node.length(), node.right_sibling());
            drop(guard);
            if len > 0 {
                self.couple(id, addr, 0, 0);
                return Ok(true);
            }
            if right == 0 {
                return Ok(false);
            }
            addr = right;
        }
    }

    /// Move to the last key; false when the tree is empty.
    pub fn cursor_last(&mut self, ctx: &mut Context, id: CursorId) -> Result<bool> {
        let mut addr = self.root;
        if addr == 0 {
            return Ok(false);
        }
        loop {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if !node.is_leaf() {
                let len = node.length();
                addr = if len == 0 {
                    node.left_child()
                } else {
                    node.child(len - 1)
                };
                continue;
            }
            let (len, left) = (node.length(), node.left_sibling());
            drop(guard);
            if len > 0 {
                self.couple(id, addr, len - 1, 0);
                return Ok(true);
            }
            if left == 0 {
                return Ok(false);
            }
            addr = left;
        }
    }

    /// Re-resolve the cursor to a concrete `(page, slot)`; Nil stays put.
    fn resolve(
        &mut self,
        ctx: &mut Context,
        id: CursorId,
    ) -> Result<Option<(PageAddr, usize, bool)>> {
        let state = match self.cursors.lock().get(id) {
            Some(binding) => binding.btree.clone(),
            None => return Err(Error::new(ErrorCode::CursorIsNil)),
        };
        match state {
            BtreeCursorState::Nil => Ok(None),
            BtreeCursorState::Coupled { page, slot, .. } => Ok(Some((page, slot, true))),
            BtreeCursorState::Uncoupled { key, dup } => {
                let (page, lb, exact) = self.find_leaf(ctx, &key, true)?;
                let addr = page.lock().address();
                drop(page);
                self.couple(id, addr, lb, dup);
                Ok(Some((addr, lb, exact)))
            }
        }
    }

    /// Step to the next key in order; false when exhausted.
    pub fn cursor_next_key(&mut self, ctx: &mut Context, id: CursorId) -> Result<bool> {
        let (addr, slot, was_exact) = match self.resolve(ctx, id)? {
            Some(position) => position,
            None => return self.cursor_first(ctx, id),
        };
        let page = self.fetch(ctx, addr, true)?;
        // an uncoupled cursor whose key was erased already points at the
        // next larger key
        if !was_exact {
            let valid = {
                let mut guard = page.lock();
                slot < Node::new(&mut guard, &self.layout).length()
            };
            if valid {
                self.couple(id, addr, slot, 0);
                return Ok(true);
            }
        }
        match self.step_next(ctx, &page, slot)? {
            Some((next_page, next_slot)) => {
                let next_addr = next_page.lock().address();
                self.couple(id, next_addr, next_slot, 0);
                Ok(true)
            }
            None => {
                self.cursors.lock().set_btree_state(id, &self.pm, BtreeCursorState::Nil);
                Ok(false)
            }
        }
    }

    /// Step to the previous key in order; false when exhausted.
    pub fn cursor_prev_key(&mut self, ctx: &mut Context, id: CursorId) -> Result<bool> {
        let (addr, slot, _) = match self.resolve(ctx, id)? {
            Some(position) => position,
            None => return self.cursor_last(ctx, id),
        };
        let page = self.fetch(ctx, addr, true)?;
        match self.step_prev(ctx, &page, slot)? {
            Some((prev_page, prev_slot)) => {
                let prev_addr = prev_page.lock().address();
                self.couple(id, prev_addr, prev_slot, 0);
                Ok(true)
            }
            None => {
                self.cursors.lock().set_btree_state(id, &self.pm, BtreeCursorState::Nil);
                Ok(false)
            }
        }
    }

    /// Key under the cursor.
    pub fn cursor_key(&mut self, ctx: &mut Context, id: CursorId) -> Result<Vec<u8>> {
        let (addr, slot, exact) = self
            .resolve(ctx, id)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let page = self.fetch(ctx, addr, true)?;
        let mut guard = page.lock();
        let node = Node::new(&mut guard, &self.layout);
        if !exact || slot >= node.length() {
            return Err(Error::new(ErrorCode::CursorIsNil));
        }
        node.key(slot, ctx, &self.blobs)
    }

    /// Record under the cursor (`dup` selects the duplicate).
    pub fn cursor_record(
        &mut self,
        ctx: &mut Context,
        id: CursorId,
        dup: usize,
    ) -> Result<Vec<u8>> {
        let (addr, slot, exact) = self
            .resolve(ctx, id)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let page = self.fetch(ctx, addr, true)?;
        let mut guard = page.lock();
        let node = Node::new(&mut guard, &self.layout);
        if !exact || slot >= node.length() {
            return Err(Error::new(ErrorCode::CursorIsNil));
        }
        node.record(slot, dup, ctx, &self.blobs)
    }

    /// Duplicate count under the cursor.
    pub fn cursor_dup_count(&mut self, ctx: &mut Context, id: CursorId) -> Result<usize> {
        let (addr, slot, exact) = self
            .resolve(ctx, id)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let page = self.fetch(ctx, addr, true)?;
        let mut guard = page.lock();
        let node = Node::new(&mut guard, &self.layout);
        if !exact || slot >= node.length() {
            return Err(Error::new(ErrorCode::CursorIsNil));
        }
        node.dup_count(slot, ctx, &self.blobs)
    }

    /// Record size under the cursor.
    pub fn cursor_record_size(
        &mut self,
        ctx: &mut Context,
        id: CursorId,
        dup: usize,
    ) -> Result<u32> {
        let (addr, slot, exact) = self
            .resolve(ctx, id)?
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        let page = self.fetch(ctx, addr, true)?;
        let mut guard = page.lock();
        let node = Node::new(&mut guard, &self.layout);
        if !exact || slot >= node.length() {
            return Err(Error::new(ErrorCode::CursorIsNil));
        }
        node.record_size(slot, dup, ctx, &self.blobs)
    }

    // ==================================================================
    // Count / integrity / teardown
    // ==================================================================

    /// Number of keys; with `distinct` duplicates count once.
    pub fn count(&mut self, ctx: &mut Context, distinct: bool) -> Result<u64> {
        let mut addr = self.leftmost_leaf(ctx)?;
        let mut total = 0u64;
        while addr != 0 {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if distinct || node.geo.rec_kind != RecordListKind::Duplicate {
                total += node.length() as u64;
            } else {
                for slot in 0..node.length() {
                    total += node.dup_count(slot, ctx, &self.blobs)? as u64;
                }
            }
            addr = node.right_sibling();
        }
        Ok(total)
    }

    fn leftmost_leaf(&self, ctx: &mut Context) -> Result<PageAddr> {
        let mut addr = self.root;
        if addr == 0 {
            return Ok(0);
        }
        loop {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if node.is_leaf() {
                return Ok(addr);
            }
            addr = node.left_child();
        }
    }

    /// Verify the structural invariants of the whole tree.
    pub fn check_integrity(&mut self, ctx: &mut Context) -> Result<()> {
        if self.root == 0 {
            return Ok(());
        }
        let mut seen = HashSet::new();
        let mut leaf_depth = None;
        self.check_node(ctx, self.root, None, None, 0, &mut leaf_depth, &mut seen)?;
        self.check_leaf_chain(ctx)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        ctx: &mut Context,
        addr: PageAddr,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        seen: &mut HashSet<PageAddr>,
    ) -> Result<()> {
        if !seen.insert(addr) {
            return integrity_error(addr, "page is referenced twice");
        }
        if self.pm.is_free(addr) {
            return integrity_error(addr, "page is on the freelist");
        }

        let page = self.fetch(ctx, addr, true)?;
        let mut guard = page.lock();
        if guard.page_type()? != PageType::Index {
            return integrity_error(addr, "not an index page");
        }
        let node = Node::new(&mut guard, &self.layout);
        let length = node.length();

        let mut previous: Option<Vec<u8>> = None;
        for slot in 0..length {
            let key = node.key(slot, ctx, &self.blobs)?;
            if let Some(prev) = &previous {
                if self.compare(prev, &key) != Ordering::Less {
                    return integrity_error(addr, "keys are not strictly ordered");
                }
            }
            if let Some(low) = lower {
                if self.compare(&key, low) == Ordering::Less {
                    return integrity_error(addr, "key below the subtree bound");
                }
            }
            if let Some(high) = upper {
                if self.compare(&key, high) != Ordering::Less {
                    return integrity_error(addr, "key above the subtree bound");
                }
            }
            previous = Some(key);
        }

        if node.is_leaf() {
            match leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if *expected != depth => {
                    return integrity_error(addr, "leaves at different depths");
                }
                _ => {}
            }
            return Ok(());
        }

        // internal: collect children and their bounds, then recurse
        let mut children = Vec::with_capacity(length + 1);
        {
            let first_key = if length > 0 {
                Some(node.key(0, ctx, &self.blobs)?)
            } else {
                None
            };
            children.push((
                node.left_child(),
                lower.map(|k| k.to_vec()),
                first_key,
            ));
            for slot in 0..length {
                let low = node.key(slot, ctx, &self.blobs)?;
                let high = if slot + 1 < length {
                    Some(node.key(slot + 1, ctx, &self.blobs)?)
                } else {
                    upper.map(|k| k.to_vec())
                };
                children.push((node.child(slot), Some(low), high));
            }
        }
        drop(guard);

        for (child, low, high) in children {
            if child == 0 {
                return integrity_error(addr, "null child pointer");
            }
            self.check_node(
                ctx,
                child,
                low.as_deref(),
                high.as_deref(),
                depth + 1,
                leaf_depth,
                seen,
            )?;
        }
        Ok(())
    }

    fn check_leaf_chain(&mut self, ctx: &mut Context) -> Result<()> {
        let mut addr = self.leftmost_leaf(ctx)?;
        let mut previous_addr = 0;
        let mut previous_last: Option<Vec<u8>> = None;
        while addr != 0 {
            let page = self.fetch(ctx, addr, true)?;
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            if !node.is_leaf() {
                return integrity_error(addr, "non-leaf in the leaf chain");
            }
            if node.left_sibling() != previous_addr {
                return integrity_error(addr, "broken left sibling link");
            }
            if node.length() > 0 {
                let first = node.key(0, ctx, &self.blobs)?;
                if let Some(last) = &previous_last {
                    if self.compare(last, &first) != Ordering::Less {
                        return integrity_error(addr, "sibling keys out of order");
                    }
                }
                previous_last = Some(node.key(node.length() - 1, ctx, &self.blobs)?);
            }
            previous_addr = addr;
            addr = node.right_sibling();
        }
        Ok(())
    }

    /// Free every page and blob of the tree; used by `erase_db`.
    pub fn drop_tree(&mut self, ctx: &mut Context) -> Result<()> {
        if self.root == 0 {
            return Ok(());
        }
        self.free_subtree(ctx, self.root)?;
        self.root = 0;
        Ok(())
    }

    fn free_subtree(&mut self, ctx: &mut Context, addr: PageAddr) -> Result<()> {
        let page = self.fetch(ctx, addr, false)?;
        let (is_leaf, length) = {
            let mut guard = page.lock();
            let node = Node::new(&mut guard, &self.layout);
            (node.is_leaf(), node.length())
        };

        if is_leaf {
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            while node.length() > 0 {
                let last = node.length() - 1;
                node.erase_slot(last, ctx, &self.blobs)?;
            }
        } else {
            let children = {
                let mut guard = page.lock();
                let node = Node::new(&mut guard, &self.layout);
                let mut c = vec![node.left_child()];
                for slot in 0..length {
                    c.push(node.child(slot));
                }
                c
            };
            for child in children {
                self.free_subtree(ctx, child)?;
            }
            // release separator key blobs
            let mut guard = page.lock();
            let mut node = Node::new(&mut guard, &self.layout);
            while node.length() > 0 {
                let last = node.length() - 1;
                node.erase_slot(last, ctx, &self.blobs)?;
            }
        }

        self.uncouple_all_cursors(ctx, addr, 0)?;
        drop(page);
        self.pm.del(ctx, addr, 1);
        Ok(())
    }
}

fn integrity_error(addr: PageAddr, what: &str) -> Result<()> {
    log::error!("integrity check failed on page {:#x}: {}", addr, what);
    Err(Error::with_message(
        ErrorCode::IntegrityViolated,
        format!("page {:#x}: {}", addr, what),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{Device, InMemoryDevice};
    use crate::storage::pager::PagerConfig;
    use crate::types::{comparator_for, KeyType};
    use cursor::CursorRegistry;
    use keylist::KeyListKind;
    use parking_lot::Mutex;

    fn index() -> (BtreeIndex, CursorRegistryRef) {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(dev)));
        let pm = Arc::new(PageManager::new(
            PagerConfig {
                page_size: 1024,
                cache_capacity: 1024,
                cache_unlimited: true,
                crc_enabled: false,
            },
            device,
        ));
        let cursors: CursorRegistryRef = Arc::new(Mutex::new(CursorRegistry::new()));
        let layout = BtreeLayout {
            key_kind: KeyListKind::Variable,
            leaf_records: RecordListKind::Default,
            page_size: 1024,
        };
        let cmp = comparator_for(KeyType::Binary, None).unwrap();
        let mut btree = BtreeIndex::new(layout, cmp, pm, cursors.clone(), 0);
        let mut ctx = Context::new(None);
        btree.create(&mut ctx).unwrap();
        (btree, cursors)
    }

    fn key_of(i: u32) -> Vec<u8> {
        format!("{:05}", i).into_bytes()
    }

    #[test]
    fn test_insert_find_across_splits() {
        let (mut btree, _cursors) = index();
        let mut ctx = Context::new(None);

        for i in 0..1000u32 {
            btree
                .insert(&mut ctx, &key_of(i), &key_of(i), InsertFlags::empty(), None)
                .unwrap();
        }
        assert!(btree.stats.smo_split > 0, "1000 keys cannot fit one node");

        for i in (0..1000u32).step_by(37) {
            let (key, record, approx) = btree
                .find(&mut ctx, &key_of(i), FindFlags::empty())
                .unwrap()
                .expect("key is present");
            assert_eq!(key, key_of(i));
            assert_eq!(record, key_of(i));
            assert_eq!(approx, ApproxMatch::Exact);
        }
        assert_eq!(btree.count(&mut ctx, true).unwrap(), 1000);
        btree.check_integrity(&mut ctx).unwrap();
    }

    #[test]
    fn test_erase_merges_back_to_a_leaf() {
        let (mut btree, _cursors) = index();
        let mut ctx = Context::new(None);

        for i in 0..500u32 {
            btree
                .insert(&mut ctx, &key_of(i), b"v", InsertFlags::empty(), None)
                .unwrap();
        }
        for i in 0..500u32 {
            btree.erase(&mut ctx, &key_of(i), None).unwrap();
        }
        assert_eq!(btree.count(&mut ctx, true).unwrap(), 0);
        assert!(btree.stats.smo_merge > 0, "shrinking must merge nodes");

        // the root collapsed back into a single (empty) leaf
        let page = btree.fetch(&mut ctx, btree.root, true).unwrap();
        let mut guard = page.lock();
        assert!(Node::new(&mut guard, &btree.layout).is_leaf());
        drop(guard);
        btree.check_integrity(&mut ctx).unwrap();
    }

    #[test]
    fn test_btree_cursor_walk() {
        let (mut btree, cursors) = index();
        let mut ctx = Context::new(None);

        for i in 0..300u32 {
            btree
                .insert(&mut ctx, &key_of(i), &key_of(i), InsertFlags::empty(), None)
                .unwrap();
        }

        let id = cursors.lock().create();
        assert!(btree.cursor_first(&mut ctx, id).unwrap());
        let mut seen = 0u32;
        loop {
            assert_eq!(btree.cursor_key(&mut ctx, id).unwrap(), key_of(seen));
            assert_eq!(btree.cursor_record(&mut ctx, id, 0).unwrap(), key_of(seen));
            assert_eq!(btree.cursor_dup_count(&mut ctx, id).unwrap(), 1);
            assert_eq!(
                btree.cursor_record_size(&mut ctx, id, 0).unwrap(),
                key_of(seen).len() as u32
            );
            seen += 1;
            if !btree.cursor_next_key(&mut ctx, id).unwrap() {
                break;
            }
        }
        assert_eq!(seen, 300);

        // and back again
        assert!(btree.cursor_last(&mut ctx, id).unwrap());
        let mut reverse = 300u32;
        loop {
            reverse -= 1;
            assert_eq!(btree.cursor_key(&mut ctx, id).unwrap(), key_of(reverse));
            if !btree.cursor_prev_key(&mut ctx, id).unwrap() {
                break;
            }
        }
        assert_eq!(reverse, 0);
    }

    #[test]
    fn test_cursor_uncouples_on_structural_change() {
        let (mut btree, cursors) = index();
        let mut ctx = Context::new(None);

        btree
            .insert(&mut ctx, b"anchor", b"v", InsertFlags::empty(), None)
            .unwrap();
        let id = cursors.lock().create();
        btree
            .cursor_find(&mut ctx, id, b"anchor", FindFlags::empty())
            .unwrap();

        for i in 0..500u32 {
            btree
                .insert(&mut ctx, &key_of(i), b"filler", InsertFlags::empty(), None)
                .unwrap();
        }

        // the splits uncoupled the cursor; it still resolves to its key
        assert_eq!(btree.cursor_key(&mut ctx, id).unwrap(), b"anchor");
        cursors.lock().close(id, &btree.pm);
    }

    #[test]
    fn test_drop_tree_releases_pages() {
        let (mut btree, _cursors) = index();
        let mut ctx = Context::new(None);

        for i in 0..300u32 {
            btree
                .insert(&mut ctx, &key_of(i), &vec![7u8; 100], InsertFlags::empty(), None)
                .unwrap();
        }
        let root = btree.root;
        ctx.changeset.clear();
        btree.drop_tree(&mut ctx).unwrap();
        assert_eq!(btree.root, 0);
        assert!(btree.pm.is_free(root), "the old root went back to the freelist");
    }

    #[test]
    fn test_find_approx_directions() {
        let (mut btree, _cursors) = index();
        let mut ctx = Context::new(None);
        for key in [b"b", b"d", b"f"] {
            btree
                .insert(&mut ctx, key, b"v", InsertFlags::empty(), None)
                .unwrap();
        }

        let (key, _, approx) = btree
            .find(&mut ctx, b"c", FindFlags::GEQ_MATCH)
            .unwrap()
            .unwrap();
        assert_eq!((key.as_slice(), approx), (b"d".as_slice(), ApproxMatch::Greater));

        let (key, _, approx) = btree
            .find(&mut ctx, b"c", FindFlags::LEQ_MATCH)
            .unwrap()
            .unwrap();
        assert_eq!((key.as_slice(), approx), (b"b".as_slice(), ApproxMatch::Lower));

        assert!(btree.find(&mut ctx, b"a", FindFlags::LT_MATCH).unwrap().is_none());
        assert!(btree.find(&mut ctx, b"g", FindFlags::GT_MATCH).unwrap().is_none());
    }
}
