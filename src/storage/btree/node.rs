//! Btree node: a page interpreted as leaf or internal node.
//!
//! Node payload layout (after the persisted page header):
//!   0.. 4  flags        u32 (bit 0: leaf)
//!   4.. 8  length       u32 (used slots)
//!   8..16  left sibling  u64
//!  16..24  right sibling u64
//!  24..32  left child    u64 (internal nodes)
//!  32..    key region + record region

use std::cmp::Ordering;

use crate::error::Result;
use crate::storage::blob::BlobManager;
use crate::storage::btree::keylist::{self, KeyListKind};
use crate::storage::btree::recordlist::{self, RecordListKind};
use crate::storage::changeset::Context;
use crate::storage::page::{Page, PAGE_HEADER_SIZE};
use crate::types::{CompareFn, PageAddr};

pub const NODE_HEADER_SIZE: usize = 32;

/// Node flag: this node is a leaf.
pub const NODE_FLAG_LEAF: u32 = 0x01;

/// Assumed bytes per variable-size key when sizing a node's regions.
const VAR_KEY_ESTIMATE: usize = 32;

/// Static per-database layout facts; geometry is derived per node from
/// its leaf flag.
#[derive(Debug, Clone)]
pub struct BtreeLayout {
    pub key_kind: KeyListKind,
    pub leaf_records: RecordListKind,
    pub page_size: u32,
}

/// Concrete geometry of one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeGeometry {
    pub rec_kind: RecordListKind,
    /// Maximum number of slots
    pub capacity: usize,
    /// Bytes of the key region
    pub key_region: usize,
}

impl BtreeLayout {
    fn area_len(&self) -> usize {
        self.page_size as usize - PAGE_HEADER_SIZE - NODE_HEADER_SIZE
    }

    pub fn geometry(&self, is_leaf: bool) -> NodeGeometry {
        let rec_kind = if is_leaf {
            self.leaf_records
        } else {
            RecordListKind::Internal
        };
        let rec_width = rec_kind.width();
        let area = self.area_len();
        match self.key_kind.stride() {
            Some(ksz) => {
                let capacity = area / (ksz + rec_width);
                NodeGeometry {
                    rec_kind,
                    capacity,
                    key_region: capacity * ksz,
                }
            }
            None => {
                let capacity = area / (VAR_KEY_ESTIMATE + rec_width);
                // the slot directory stores u16 offsets
                let key_region = (area - capacity * rec_width).min(u16::MAX as usize);
                NodeGeometry {
                    rec_kind,
                    capacity,
                    key_region,
                }
            }
        }
    }
}

/// Mutable view of a page as a btree node.
pub struct Node<'a> {
    page: &'a mut Page,
    pub key_kind: KeyListKind,
    pub geo: NodeGeometry,
}

impl<'a> Node<'a> {
    pub fn new(page: &'a mut Page, layout: &BtreeLayout) -> Self {
        let is_leaf = node_flags(page) & NODE_FLAG_LEAF != 0;
        let geo = layout.geometry(is_leaf);
        Node {
            page,
            key_kind: layout.key_kind,
            geo,
        }
    }

    /// Initialize a fresh page as an empty node.
    pub fn init(page: &'a mut Page, layout: &BtreeLayout, is_leaf: bool) -> Self {
        let payload = page.payload_mut();
        payload[..NODE_HEADER_SIZE].fill(0);
        if is_leaf {
            payload[0..4].copy_from_slice(&NODE_FLAG_LEAF.to_le_bytes());
        }
        page.set_dirty(true);
        Node::new(page, layout)
    }

    pub fn address(&self) -> PageAddr {
        self.page.address()
    }

    pub fn mark_dirty(&mut self) {
        self.page.set_dirty(true);
    }

    // ------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------

    pub fn is_leaf(&self) -> bool {
        node_flags(self.page) & NODE_FLAG_LEAF != 0
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes(self.hdr()[4..8].try_into().unwrap()) as usize
    }

    pub fn set_length(&mut self, length: usize) {
        self.hdr_mut()[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    }

    pub fn left_sibling(&self) -> PageAddr {
        u64::from_le_bytes(self.hdr()[8..16].try_into().unwrap())
    }

    pub fn set_left_sibling(&mut self, addr: PageAddr) {
        self.hdr_mut()[8..16].copy_from_slice(&addr.to_le_bytes());
    }

    pub fn right_sibling(&self) -> PageAddr {
        u64::from_le_bytes(self.hdr()[16..24].try_into().unwrap())
    }

    pub fn set_right_sibling(&mut self, addr: PageAddr) {
        self.hdr_mut()[16..24].copy_from_slice(&addr.to_le_bytes());
    }

    pub fn left_child(&self) -> PageAddr {
        u64::from_le_bytes(self.hdr()[24..32].try_into().unwrap())
    }

    pub fn set_left_child(&mut self, addr: PageAddr) {
        self.hdr_mut()[24..32].copy_from_slice(&addr.to_le_bytes());
    }

    fn hdr(&self) -> &[u8] {
        &self.page.payload()[..NODE_HEADER_SIZE]
    }

    fn hdr_mut(&mut self) -> &mut [u8] {
        self.page.set_dirty(true);
        &mut self.page.payload_mut()[..NODE_HEADER_SIZE]
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    fn key_region(&self) -> &[u8] {
        &self.page.payload()[NODE_HEADER_SIZE..NODE_HEADER_SIZE + self.geo.key_region]
    }

    fn key_region_mut(&mut self) -> &mut [u8] {
        let start = NODE_HEADER_SIZE;
        &mut self.page.payload_mut()[start..start + self.geo.key_region]
    }

    fn rec_region(&self) -> &[u8] {
        let start = NODE_HEADER_SIZE + self.geo.key_region;
        let len = self.geo.capacity * self.geo.rec_kind.width();
        &self.page.payload()[start..start + len]
    }

    fn rec_region_mut(&mut self) -> &mut [u8] {
        let start = NODE_HEADER_SIZE + self.geo.key_region;
        let len = self.geo.capacity * self.geo.rec_kind.width();
        &mut self.page.payload_mut()[start..start + len]
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    pub fn key(&self, slot: usize, ctx: &mut Context, blobs: &BlobManager) -> Result<Vec<u8>> {
        keylist::key_at(
            self.key_kind,
            self.key_region(),
            self.length(),
            slot,
            ctx,
            blobs,
        )
    }

    /// Binary search; returns `(lower_bound, exact)` where `lower_bound`
    /// is the first slot whose key is >= `key`.
    pub fn search(
        &self,
        key: &[u8],
        cmp: &CompareFn,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<(usize, bool)> {
        let mut lo = 0usize;
        let mut hi = self.length();
        let mut exact = false;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = self.key(mid, ctx, blobs)?;
            match cmp(&mid_key, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => {
                    exact = true;
                    lo = mid;
                    break;
                }
            }
        }
        Ok((lo, exact))
    }

    /// Child page for a descent towards `key`.
    pub fn child_for(
        &self,
        key: &[u8],
        cmp: &CompareFn,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<PageAddr> {
        debug_assert!(!self.is_leaf());
        let (lb, exact) = self.search(key, cmp, ctx, blobs)?;
        if exact {
            Ok(self.child(lb))
        } else if lb == 0 {
            Ok(self.left_child())
        } else {
            Ok(self.child(lb - 1))
        }
    }

    /// Free bytes in the key region, counting heap holes.
    pub fn key_free_bytes(&self) -> usize {
        keylist::free_bytes(self.key_kind, self.key_region(), self.length())
    }

    /// Bytes of the key region in use.
    pub fn key_used_bytes(&self) -> usize {
        keylist::used_bytes(self.key_kind, self.key_region(), self.length())
    }

    /// True if inserting `key` does not fit this node.
    pub fn requires_split(&self, key: &[u8]) -> bool {
        if self.length() >= self.geo.capacity {
            return true;
        }
        keylist::requires_split(self.key_kind, self.key_region(), self.length(), key)
    }

    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    /// Insert `key` with an empty record entry at `slot`.
    pub fn insert_slot(
        &mut self,
        slot: usize,
        key: &[u8],
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<()> {
        let length = self.length();
        let kind = self.key_kind;
        let result =
            keylist::insert_key(kind, self.key_region_mut(), length, slot, key, ctx, blobs)?;
        debug_assert_eq!(result, keylist::KeyInsert::Ok, "caller checks requires_split");
        let rec_kind = self.geo.rec_kind;
        recordlist::insert_entry(rec_kind, self.rec_region_mut(), length, slot);
        self.set_length(length + 1);
        Ok(())
    }

    /// Remove `slot`, releasing key and record blobs.
    pub fn erase_slot(
        &mut self,
        slot: usize,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<()> {
        let length = self.length();
        let rec_kind = self.geo.rec_kind;
        recordlist::free_record(rec_kind, self.rec_region_mut(), slot, ctx, blobs)?;
        recordlist::erase_entry(rec_kind, self.rec_region_mut(), length, slot);
        let kind = self.key_kind;
        keylist::erase_key(kind, self.key_region_mut(), length, slot, ctx, blobs)?;
        self.set_length(length - 1);
        Ok(())
    }

    /// Raw slot payload `(key entry, record entry)`, for moves.
    pub fn take_raw(&self, slot: usize) -> (Vec<u8>, Vec<u8>) {
        (
            keylist::raw_entry(self.key_kind, self.key_region(), slot),
            recordlist::raw_entry(self.geo.rec_kind, self.rec_region(), slot),
        )
    }

    /// Append a raw slot previously read with [`take_raw`].
    pub fn append_raw(&mut self, key_entry: &[u8], rec_entry: &[u8]) -> Result<()> {
        let length = self.length();
        let kind = self.key_kind;
        keylist::insert_raw(kind, self.key_region_mut(), length, length, key_entry)?;
        let rec_kind = self.geo.rec_kind;
        recordlist::insert_entry(rec_kind, self.rec_region_mut(), length, length);
        recordlist::put_raw_entry(rec_kind, self.rec_region_mut(), length, rec_entry);
        self.set_length(length + 1);
        Ok(())
    }

    /// Remove `slot` without touching blobs (the raw entry moved away).
    pub fn remove_raw(&mut self, slot: usize) {
        let length = self.length();
        let kind = self.key_kind;
        keylist::erase_raw(kind, self.key_region_mut(), length, slot);
        let rec_kind = self.geo.rec_kind;
        recordlist::erase_entry(rec_kind, self.rec_region_mut(), length, slot);
        self.set_length(length - 1);
    }

    // ------------------------------------------------------------------
    // Records / children
    // ------------------------------------------------------------------

    pub fn child(&self, slot: usize) -> PageAddr {
        recordlist::child_at(self.rec_region(), slot)
    }

    pub fn set_child(&mut self, slot: usize, child: PageAddr) {
        self.mark_dirty();
        recordlist::set_child(self.rec_region_mut(), slot, child)
    }

    pub fn record(
        &self,
        slot: usize,
        dup_index: usize,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<Vec<u8>> {
        recordlist::record(self.geo.rec_kind, self.rec_region(), slot, dup_index, ctx, blobs)
    }

    pub fn record_size(
        &self,
        slot: usize,
        dup_index: usize,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<u32> {
        recordlist::record_size(self.geo.rec_kind, self.rec_region(), slot, dup_index, ctx, blobs)
    }

    pub fn set_record(
        &mut self,
        slot: usize,
        data: &[u8],
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<()> {
        self.mark_dirty();
        let rec_kind = self.geo.rec_kind;
        recordlist::set_record(rec_kind, self.rec_region_mut(), slot, data, ctx, blobs)
    }

    pub fn dup_count(
        &self,
        slot: usize,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<usize> {
        match self.geo.rec_kind {
            RecordListKind::Duplicate => {
                recordlist::dup_count(self.rec_region(), slot, ctx, blobs)
            }
            _ => Ok(1),
        }
    }

    pub fn dup_insert(
        &mut self,
        slot: usize,
        position: recordlist::DupPosition,
        data: &[u8],
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<usize> {
        self.mark_dirty();
        recordlist::dup_insert(self.rec_region_mut(), slot, position, data, ctx, blobs)
    }

    pub fn dup_erase(
        &mut self,
        slot: usize,
        dup_index: usize,
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<usize> {
        self.mark_dirty();
        recordlist::dup_erase(self.rec_region_mut(), slot, dup_index, ctx, blobs)
    }

    pub fn dup_set(
        &mut self,
        slot: usize,
        dup_index: usize,
        data: &[u8],
        ctx: &mut Context,
        blobs: &BlobManager,
    ) -> Result<()> {
        self.mark_dirty();
        recordlist::dup_set(self.rec_region_mut(), slot, dup_index, data, ctx, blobs)
    }
}

fn node_flags(page: &Page) -> u32 {
    u32::from_le_bytes(page.payload()[0..4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{Device, InMemoryDevice};
    use crate::storage::pager::{PageManager, PagerConfig};
    use crate::types::{comparator_for, KeyType};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fixture() -> (BlobManager, BtreeLayout) {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(dev)));
        let blobs = BlobManager::new(Arc::new(PageManager::new(
            PagerConfig {
                page_size: 1024,
                cache_capacity: 64,
                cache_unlimited: false,
                crc_enabled: false,
            },
            device,
        )));
        let layout = BtreeLayout {
            key_kind: KeyListKind::Variable,
            leaf_records: RecordListKind::Default,
            page_size: 1024,
        };
        (blobs, layout)
    }

    #[test]
    fn test_init_and_search() {
        let (blobs, layout) = fixture();
        let mut ctx = Context::new(None);
        let cmp = comparator_for(KeyType::Binary, None).unwrap();
        let mut page = Page::new(0x400, 1024);
        let mut node = Node::init(&mut page, &layout, true);

        assert!(node.is_leaf());
        assert_eq!(node.length(), 0);

        for (i, key) in [b"bb", b"dd", b"ff"].iter().enumerate() {
            node.insert_slot(i, *key, &mut ctx, &blobs).unwrap();
        }

        assert_eq!(node.search(b"dd", &cmp, &mut ctx, &blobs).unwrap(), (1, true));
        assert_eq!(node.search(b"cc", &cmp, &mut ctx, &blobs).unwrap(), (1, false));
        assert_eq!(node.search(b"aa", &cmp, &mut ctx, &blobs).unwrap(), (0, false));
        assert_eq!(node.search(b"zz", &cmp, &mut ctx, &blobs).unwrap(), (3, false));
    }

    #[test]
    fn test_records_roundtrip() {
        let (blobs, layout) = fixture();
        let mut ctx = Context::new(None);
        let mut page = Page::new(0x400, 1024);
        let mut node = Node::init(&mut page, &layout, true);

        node.insert_slot(0, b"key", &mut ctx, &blobs).unwrap();
        node.set_record(0, b"value", &mut ctx, &blobs).unwrap();
        assert_eq!(node.record(0, 0, &mut ctx, &blobs).unwrap(), b"value");
        assert_eq!(node.record_size(0, 0, &mut ctx, &blobs).unwrap(), 5);
    }

    #[test]
    fn test_raw_move_between_nodes() {
        let (blobs, layout) = fixture();
        let mut ctx = Context::new(None);
        let mut left_page = Page::new(0x400, 1024);
        let mut right_page = Page::new(0x800, 1024);
        let mut left = Node::init(&mut left_page, &layout, true);

        for (i, key) in [b"aa", b"bb", b"cc", b"dd"].iter().enumerate() {
            left.insert_slot(i, *key, &mut ctx, &blobs).unwrap();
            left.set_record(i, key.as_slice(), &mut ctx, &blobs).unwrap();
        }

        let mut right = Node::init(&mut right_page, &layout, true);
        // move slots 2.. to the right node
        for slot in 2..left.length() {
            let (k, r) = left.take_raw(slot);
            right.append_raw(&k, &r).unwrap();
        }
        while left.length() > 2 {
            let last = left.length() - 1;
            left.remove_raw(last);
        }

        assert_eq!(left.length(), 2);
        assert_eq!(right.length(), 2);
        assert_eq!(right.key(0, &mut ctx, &blobs).unwrap(), b"cc");
        assert_eq!(right.record(1, 0, &mut ctx, &blobs).unwrap(), b"dd");
    }

    #[test]
    fn test_internal_children_and_descent() {
        let (blobs, layout) = fixture();
        let mut ctx = Context::new(None);
        let cmp = comparator_for(KeyType::Binary, None).unwrap();
        let mut page = Page::new(0x400, 1024);
        let mut node = Node::init(&mut page, &layout, false);

        node.set_left_child(0x1000);
        node.insert_slot(0, b"mm", &mut ctx, &blobs).unwrap();
        node.set_child(0, 0x2000);

        assert_eq!(node.child_for(b"aa", &cmp, &mut ctx, &blobs).unwrap(), 0x1000);
        assert_eq!(node.child_for(b"mm", &cmp, &mut ctx, &blobs).unwrap(), 0x2000);
        assert_eq!(node.child_for(b"zz", &cmp, &mut ctx, &blobs).unwrap(), 0x2000);
    }
}
