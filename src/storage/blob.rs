//! Blob manager: out-of-line storage for records and duplicate tables.
//!
//! A blob id is the absolute device offset of the blob header. Small blobs
//! share blob pages through a 32-slot per-page freelist; blobs larger than
//! one page occupy a run of adjacent pages whose first page carries the
//! page header and `num_pages`.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::changeset::Context;
use crate::storage::page::{PageRef, PageType, PAGE_HEADER_SIZE};
use crate::storage::pager::{FetchFlags, PageManager};
use crate::types::{BlobId, PageAddr};

/// Slots in the per-page freelist.
const FREELIST_SLOTS: usize = 32;

/// Blob page header: num_pages (4) + free_bytes (4) + 32 offset/size pairs.
const BLOB_PAGE_HEADER_SIZE: usize = 8 + FREELIST_SLOTS * 8;

/// Blob header: size (4) + allocated (4) + flags (4) + reserved (4).
const BLOB_HEADER_SIZE: usize = 16;

/// A byte range of a record, for targeted partial overwrites.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

pub struct BlobManager {
    pm: Arc<PageManager>,
}

impl BlobManager {
    pub fn new(pm: Arc<PageManager>) -> Self {
        BlobManager { pm }
    }

    fn page_size(&self) -> u64 {
        self.pm.page_size() as u64
    }

    /// Bytes of blob space in a blob page.
    fn area_capacity(&self) -> usize {
        self.pm.usable_page_size() - BLOB_PAGE_HEADER_SIZE
    }

    /// Absolute offset of area byte 0 of the blob page at `page_addr`.
    fn area_base(&self, page_addr: PageAddr) -> u64 {
        page_addr + PAGE_HEADER_SIZE as u64 + BLOB_PAGE_HEADER_SIZE as u64
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Store `record` as a blob; returns its id.
    pub fn allocate(&self, ctx: &mut Context, record: &[u8]) -> Result<BlobId> {
        if record.len() > u32::MAX as usize {
            return Err(Error::new(ErrorCode::InvRecordSize));
        }
        let total = BLOB_HEADER_SIZE + record.len();

        if total <= self.area_capacity() {
            self.allocate_small(ctx, record)
        } else {
            self.allocate_large(ctx, record)
        }
    }

    /// Read the full blob payload.
    pub fn read(&self, ctx: &mut Context, blob_id: BlobId) -> Result<Vec<u8>> {
        let (size, _allocated) = self.read_header(ctx, blob_id)?;
        let mut out = vec![0u8; size as usize];
        self.rw_blob(ctx, blob_id, BLOB_HEADER_SIZE as u64, &mut out, false)?;
        Ok(out)
    }

    /// Size of the blob payload in bytes.
    pub fn blob_size(&self, ctx: &mut Context, blob_id: BlobId) -> Result<u32> {
        Ok(self.read_header(ctx, blob_id)?.0)
    }

    /// Replace the blob contents; in place when the new payload fits the
    /// existing allocation, otherwise erase + allocate.
    pub fn overwrite(&self, ctx: &mut Context, old_id: BlobId, record: &[u8]) -> Result<BlobId> {
        let (_, allocated) = self.read_header(ctx, old_id)?;
        if record.len() <= allocated as usize {
            self.write_header(ctx, old_id, record.len() as u32, allocated)?;
            let mut buf = record.to_vec();
            self.rw_blob(ctx, old_id, BLOB_HEADER_SIZE as u64, &mut buf, true)?;
            Ok(old_id)
        } else {
            self.erase(ctx, old_id)?;
            self.allocate(ctx, record)
        }
    }

    /// Patch only the given regions of the blob; used to update duplicate
    /// tables without rewriting the full payload. Falls back to a full
    /// overwrite when the new payload no longer fits in place.
    pub fn overwrite_regions(
        &self,
        ctx: &mut Context,
        old_id: BlobId,
        record: &[u8],
        regions: &[Region],
    ) -> Result<BlobId> {
        let (_, allocated) = self.read_header(ctx, old_id)?;
        if record.len() > allocated as usize {
            self.erase(ctx, old_id)?;
            return self.allocate(ctx, record);
        }

        self.write_header(ctx, old_id, record.len() as u32, allocated)?;
        for region in regions {
            let end = region.offset + region.len;
            if end > record.len() {
                return Err(Error::new(ErrorCode::InvParameter));
            }
            let mut buf = record[region.offset..end].to_vec();
            self.rw_blob(
                ctx,
                old_id,
                (BLOB_HEADER_SIZE + region.offset) as u64,
                &mut buf,
                true,
            )?;
        }
        Ok(old_id)
    }

    /// Release the blob. Single-page blobs return their span to the page's
    /// freelist; a fully free page goes back to the pager.
    pub fn erase(&self, ctx: &mut Context, blob_id: BlobId) -> Result<()> {
        let page_addr = self.page_addr_of(blob_id);
        let page = self.pm.fetch(ctx, page_addr, FetchFlags::empty())?;

        let num_pages = {
            let guard = page.lock();
            page_header_num_pages(guard.payload())
        };

        if num_pages > 1 {
            drop(page);
            self.pm.del(ctx, page_addr, num_pages as u64);
            return Ok(());
        }

        let (_, allocated) = self.read_header(ctx, blob_id)?;
        let span = BLOB_HEADER_SIZE as u32 + allocated;
        let area_offset = (blob_id - self.area_base(page_addr)) as u32;

        let free_bytes = {
            let mut guard = page.lock();
            let payload = guard.payload_mut();
            freelist_put(payload, area_offset, span);
            let free = page_header_free_bytes(payload) + span;
            set_page_header_free_bytes(payload, free);
            guard.set_dirty(true);
            free
        };

        if free_bytes as usize >= self.area_capacity() {
            drop(page);
            self.pm.del(ctx, page_addr, 1);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Small blobs
    // ------------------------------------------------------------------

    fn allocate_small(&self, ctx: &mut Context, record: &[u8]) -> Result<BlobId> {
        let needed = (BLOB_HEADER_SIZE + record.len()) as u32;

        // try the page blobs were last appended to
        let mut target: Option<(PageRef, u32)> = None;
        let last = self.pm.last_blob_page();
        if last != 0 {
            let page = self.pm.fetch(ctx, last, FetchFlags::empty())?;
            let slot = {
                let guard = page.lock();
                freelist_take(guard.payload(), needed)
            };
            if let Some(offset) = slot {
                target = Some((page, offset));
            }
        }

        let (page, area_offset) = match target {
            Some(hit) => hit,
            None => {
                let page = self.new_blob_page(ctx)?;
                let offset = {
                    let guard = page.lock();
                    freelist_take(guard.payload(), needed)
                }
                .ok_or_else(|| Error::new(ErrorCode::InternalError))?;
                (page, offset)
            }
        };

        let page_addr = {
            let mut guard = page.lock();
            let payload = guard.payload_mut();
            freelist_commit(payload, area_offset, needed);
            let free = page_header_free_bytes(payload) - needed;
            set_page_header_free_bytes(payload, free);
            guard.set_dirty(true);
            guard.address()
        };

        let blob_id = self.area_base(page_addr) + area_offset as u64;
        self.write_header(ctx, blob_id, record.len() as u32, record.len() as u32)?;
        let mut buf = record.to_vec();
        self.rw_blob(ctx, blob_id, BLOB_HEADER_SIZE as u64, &mut buf, true)?;
        Ok(blob_id)
    }

    fn new_blob_page(&self, ctx: &mut Context) -> Result<PageRef> {
        let page = self.pm.alloc(
            ctx,
            PageType::Blob,
            crate::storage::pager::AllocFlags::CLEAR_WITH_ZERO,
        )?;
        let addr = {
            let mut guard = page.lock();
            let capacity = self.area_capacity() as u32;
            let payload = guard.payload_mut();
            set_page_header_num_pages(payload, 1);
            set_page_header_free_bytes(payload, capacity);
            freelist_init(payload, capacity);
            guard.set_dirty(true);
            guard.address()
        };
        self.pm.set_last_blob_page(addr);
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Large blobs
    // ------------------------------------------------------------------

    fn allocate_large(&self, ctx: &mut Context, record: &[u8]) -> Result<BlobId> {
        let total = BLOB_HEADER_SIZE + record.len();
        let first_capacity = self.area_capacity();
        let rest = total - first_capacity;
        let num_pages = 1 + rest.div_ceil(self.page_size() as usize);

        let pages = self.pm.alloc_multiple_blob_pages(ctx, num_pages)?;
        let page_addr = {
            let mut guard = pages[0].lock();
            let payload = guard.payload_mut();
            set_page_header_num_pages(payload, num_pages as u32);
            set_page_header_free_bytes(payload, 0);
            freelist_init(payload, 0);
            guard.set_dirty(true);
            guard.address()
        };

        let blob_id = self.area_base(page_addr);
        self.write_header(ctx, blob_id, record.len() as u32, record.len() as u32)?;
        let mut buf = record.to_vec();
        self.rw_blob(ctx, blob_id, BLOB_HEADER_SIZE as u64, &mut buf, true)?;
        Ok(blob_id)
    }

    // ------------------------------------------------------------------
    // Raw spans
    // ------------------------------------------------------------------

    fn page_addr_of(&self, abs: u64) -> PageAddr {
        abs - abs % self.page_size()
    }

    /// Read or write `buf` at `delta` bytes past the blob header. The
    /// blob header itself always lives in the leading page.
    fn rw_blob(
        &self,
        ctx: &mut Context,
        blob_id: BlobId,
        delta: u64,
        buf: &mut [u8],
        write: bool,
    ) -> Result<()> {
        self.rw_span_from(ctx, self.page_addr_of(blob_id), blob_id + delta, buf, write)
    }

    /// Read or write `buf` at the absolute device offset `abs`, crossing
    /// from the leading blob page at `lead_addr` into raw continuation
    /// pages as needed.
    fn rw_span_from(
        &self,
        ctx: &mut Context,
        lead_addr: PageAddr,
        abs: u64,
        buf: &mut [u8],
        write: bool,
    ) -> Result<()> {
        let ps = self.page_size();
        let mut pos = abs;
        let mut done = 0usize;
        while done < buf.len() {
            let page_addr = self.page_addr_of(pos);
            let flags = if page_addr == lead_addr {
                if write {
                    FetchFlags::empty()
                } else {
                    FetchFlags::READ_ONLY
                }
            } else if write {
                FetchFlags::NO_HEADER
            } else {
                FetchFlags::NO_HEADER | FetchFlags::READ_ONLY
            };
            let page = self.pm.fetch(ctx, page_addr, flags)?;
            let mut guard = page.lock();
            if page_addr != lead_addr {
                guard.set_without_header(true);
            }

            let in_page = (pos - page_addr) as usize;
            let chunk = (ps as usize - in_page).min(buf.len() - done);
            if write {
                guard.raw_data_mut()[in_page..in_page + chunk]
                    .copy_from_slice(&buf[done..done + chunk]);
                guard.set_dirty(true);
            } else {
                buf[done..done + chunk]
                    .copy_from_slice(&guard.raw_data()[in_page..in_page + chunk]);
            }
            drop(guard);
            if write && page_addr != lead_addr {
                ctx.changeset.put(&page);
            }

            pos += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    fn read_header(&self, ctx: &mut Context, blob_id: BlobId) -> Result<(u32, u32)> {
        let mut buf = [0u8; 8];
        self.rw_blob(ctx, blob_id, 0, &mut buf, false)?;
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let allocated = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok((size, allocated))
    }

    fn write_header(
        &self,
        ctx: &mut Context,
        blob_id: BlobId,
        size: u32,
        allocated: u32,
    ) -> Result<()> {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        buf[0..4].copy_from_slice(&size.to_le_bytes());
        buf[4..8].copy_from_slice(&allocated.to_le_bytes());
        self.rw_blob(ctx, blob_id, 0, &mut buf, true)
    }
}

// ----------------------------------------------------------------------
// Blob page header helpers (operate on a blob page's payload)
// ----------------------------------------------------------------------

fn page_header_num_pages(payload: &[u8]) -> u32 {
    u32::from_le_bytes(payload[0..4].try_into().unwrap())
}

fn set_page_header_num_pages(payload: &mut [u8], num_pages: u32) {
    payload[0..4].copy_from_slice(&num_pages.to_le_bytes());
}

fn page_header_free_bytes(payload: &[u8]) -> u32 {
    u32::from_le_bytes(payload[4..8].try_into().unwrap())
}

fn set_page_header_free_bytes(payload: &mut [u8], free_bytes: u32) {
    payload[4..8].copy_from_slice(&free_bytes.to_le_bytes());
}

fn slot_range(slot: usize) -> std::ops::Range<usize> {
    let base = 8 + slot * 8;
    base..base + 8
}

fn slot_get(payload: &[u8], slot: usize) -> (u32, u32) {
    let raw = &payload[slot_range(slot)];
    (
        u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        u32::from_le_bytes(raw[4..8].try_into().unwrap()),
    )
}

fn slot_set(payload: &mut [u8], slot: usize, offset: u32, size: u32) {
    let range = slot_range(slot);
    payload[range.start..range.start + 4].copy_from_slice(&offset.to_le_bytes());
    payload[range.start + 4..range.end].copy_from_slice(&size.to_le_bytes());
}

/// Initialize the freelist with one slot covering the whole area.
fn freelist_init(payload: &mut [u8], capacity: u32) {
    for slot in 0..FREELIST_SLOTS {
        slot_set(payload, slot, 0, 0);
    }
    if capacity > 0 {
        slot_set(payload, 0, 0, capacity);
    }
}

/// Find the smallest slot that fits `needed` bytes; returns its offset.
fn freelist_take(payload: &[u8], needed: u32) -> Option<u32> {
    let mut best: Option<(usize, u32, u32)> = None;
    for slot in 0..FREELIST_SLOTS {
        let (offset, size) = slot_get(payload, slot);
        if size >= needed && best.map_or(true, |(_, _, s)| size < s) {
            best = Some((slot, offset, size));
        }
    }
    best.map(|(_, offset, _)| offset)
}

/// Consume `needed` bytes from the slot starting at `offset`.
fn freelist_commit(payload: &mut [u8], offset: u32, needed: u32) {
    for slot in 0..FREELIST_SLOTS {
        let (slot_offset, size) = slot_get(payload, slot);
        if slot_offset == offset && size >= needed {
            if size == needed {
                slot_set(payload, slot, 0, 0);
            } else {
                slot_set(payload, slot, offset + needed, size - needed);
            }
            return;
        }
    }
    debug_assert!(false, "freelist_commit: slot vanished");
}

/// Return a span to the freelist. If every slot is taken the span is only
/// reflected in `free_bytes`; the space is reclaimed when the page empties.
fn freelist_put(payload: &mut [u8], offset: u32, size: u32) {
    // try to merge with an adjacent slot first
    for slot in 0..FREELIST_SLOTS {
        let (slot_offset, slot_size) = slot_get(payload, slot);
        if slot_size == 0 {
            continue;
        }
        if slot_offset + slot_size == offset {
            slot_set(payload, slot, slot_offset, slot_size + size);
            return;
        }
        if offset + size == slot_offset {
            slot_set(payload, slot, offset, slot_size + size);
            return;
        }
    }
    for slot in 0..FREELIST_SLOTS {
        let (_, slot_size) = slot_get(payload, slot);
        if slot_size == 0 {
            slot_set(payload, slot, offset, size);
            return;
        }
    }
}
