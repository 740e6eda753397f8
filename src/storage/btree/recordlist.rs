//! Record list strategies: the record half of a btree node.
//!
//! All strategies use fixed-width per-slot entries so that slot shifts are
//! plain memmoves:
//!
//! * `Internal` — 8-byte child page address (internal nodes).
//! * `InlineFixed` — records of a fixed declared size, stored inline.
//! * `Default` — 9-byte entries `{flags, payload[8]}`. Records up to 8
//!   bytes are inlined in the payload; larger ones live in a blob whose id
//!   fills the payload.
//! * `Duplicate` — a per-slot duplicate table: a count byte plus up to
//!   four inline 9-byte entries; larger tables spill into a duplicate
//!   blob patched in place via region overwrites.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob::{BlobManager, Region};
use crate::storage::changeset::Context;
use crate::types::{BlobId, PageAddr};

/// Inline duplicate table capacity; larger tables spill to a blob.
pub const INLINE_DUP_CAP: usize = 4;

/// Width of one record sub-entry.
const SUB_ENTRY_SIZE: usize = 9;

/// Width of a duplicate slot: count byte + inline table.
const DUP_ENTRY_SIZE: usize = 1 + INLINE_DUP_CAP * SUB_ENTRY_SIZE;

/// Marks a duplicate slot whose table lives in a blob.
const DUP_FLAG_SPILLED: u8 = 0x80;

// Sub-entry flags
const REC_EMPTY: u8 = 0x04;
const REC_TINY: u8 = 0x01;
const REC_SMALL: u8 = 0x02;
const REC_BLOB: u8 = 0x08;

/// Record list strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordListKind {
    /// Child page addresses (internal nodes)
    Internal,
    /// Fixed-size records stored inline
    InlineFixed(u32),
    /// Variable-size records, inlined up to 8 bytes, else blob-backed
    Default,
    /// Duplicate tables (ENABLE_DUPLICATES databases)
    Duplicate,
}

impl RecordListKind {
    /// Per-slot entry width in bytes.
    pub fn width(&self) -> usize {
        match self {
            RecordListKind::Internal => 8,
            RecordListKind::InlineFixed(size) => *size as usize,
            RecordListKind::Default => SUB_ENTRY_SIZE,
            RecordListKind::Duplicate => DUP_ENTRY_SIZE,
        }
    }
}

/// Where to place a new duplicate inside a key's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPosition {
    First,
    Last,
    Before(usize),
    After(usize),
}

// ----------------------------------------------------------------------
// Slot plumbing
// ----------------------------------------------------------------------

fn entry_range(kind: RecordListKind, slot: usize) -> std::ops::Range<usize> {
    let w = kind.width();
    slot * w..(slot + 1) * w
}

/// Open a zeroed entry at `slot`, shifting later entries right.
pub fn insert_entry(kind: RecordListKind, region: &mut [u8], length: usize, slot: usize) {
    let w = kind.width();
    region.copy_within(slot * w..length * w, (slot + 1) * w);
    region[slot * w..(slot + 1) * w].fill(0);
}

/// Remove the entry at `slot`, shifting later entries left. The caller
/// must have released the entry's blobs first (see [`free_record`]).
pub fn erase_entry(kind: RecordListKind, region: &mut [u8], length: usize, slot: usize) {
    let w = kind.width();
    region.copy_within((slot + 1) * w..length * w, slot * w);
}

/// Raw entry bytes, for moving slots between nodes.
pub fn raw_entry(kind: RecordListKind, region: &[u8], slot: usize) -> Vec<u8> {
    region[entry_range(kind, slot)].to_vec()
}

/// Write a raw entry previously read with [`raw_entry`].
pub fn put_raw_entry(kind: RecordListKind, region: &mut [u8], slot: usize, entry: &[u8]) {
    region[entry_range(kind, slot)].copy_from_slice(entry);
}

// ----------------------------------------------------------------------
// Internal nodes
// ----------------------------------------------------------------------

pub fn child_at(region: &[u8], slot: usize) -> PageAddr {
    let range = entry_range(RecordListKind::Internal, slot);
    u64::from_le_bytes(region[range].try_into().unwrap())
}

pub fn set_child(region: &mut [u8], slot: usize, child: PageAddr) {
    let range = entry_range(RecordListKind::Internal, slot);
    region[range].copy_from_slice(&child.to_le_bytes());
}

// ----------------------------------------------------------------------
// Leaf records
// ----------------------------------------------------------------------

/// Read the record of `slot` (`dup_index` selects the duplicate).
pub fn record(
    kind: RecordListKind,
    region: &[u8],
    slot: usize,
    dup_index: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<Vec<u8>> {
    match kind {
        RecordListKind::Internal => Err(Error::new(ErrorCode::InternalError)),
        RecordListKind::InlineFixed(_) => Ok(region[entry_range(kind, slot)].to_vec()),
        RecordListKind::Default => {
            let sub: [u8; SUB_ENTRY_SIZE] =
                region[entry_range(kind, slot)].try_into().unwrap();
            read_sub(&sub, ctx, blobs)
        }
        RecordListKind::Duplicate => {
            let table = dup_table(region, slot, ctx, blobs)?;
            let sub = table
                .get(dup_index)
                .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
            read_sub(sub, ctx, blobs)
        }
    }
}

/// Size of the record of `slot` in bytes.
pub fn record_size(
    kind: RecordListKind,
    region: &[u8],
    slot: usize,
    dup_index: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<u32> {
    match kind {
        RecordListKind::Internal => Err(Error::new(ErrorCode::InternalError)),
        RecordListKind::InlineFixed(size) => Ok(size),
        RecordListKind::Default => {
            let sub: [u8; SUB_ENTRY_SIZE] =
                region[entry_range(kind, slot)].try_into().unwrap();
            sub_size(&sub, ctx, blobs)
        }
        RecordListKind::Duplicate => {
            let table = dup_table(region, slot, ctx, blobs)?;
            let sub = table
                .get(dup_index)
                .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
            sub_size(sub, ctx, blobs)
        }
    }
}

/// Overwrite the record of `slot`, reusing its blob where possible.
pub fn set_record(
    kind: RecordListKind,
    region: &mut [u8],
    slot: usize,
    data: &[u8],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<()> {
    match kind {
        RecordListKind::Internal => Err(Error::new(ErrorCode::InternalError)),
        RecordListKind::InlineFixed(size) => {
            if data.len() != size as usize {
                return Err(Error::new(ErrorCode::InvRecordSize));
            }
            region[entry_range(kind, slot)].copy_from_slice(data);
            Ok(())
        }
        RecordListKind::Default => {
            let range = entry_range(kind, slot);
            let old: [u8; SUB_ENTRY_SIZE] = region[range.clone()].try_into().unwrap();
            let new = overwrite_sub(&old, data, ctx, blobs)?;
            region[range].copy_from_slice(&new);
            Ok(())
        }
        RecordListKind::Duplicate => {
            // replacing the whole duplicate list with one record
            free_record(kind, region, slot, ctx, blobs)?;
            let sub = encode_sub(data, ctx, blobs)?;
            let range = entry_range(kind, slot);
            region[range.clone()].fill(0);
            region[range.start] = 1;
            region[range.start + 1..range.start + 1 + SUB_ENTRY_SIZE].copy_from_slice(&sub);
            Ok(())
        }
    }
}

/// Release every blob owned by the entry at `slot`.
pub fn free_record(
    kind: RecordListKind,
    region: &mut [u8],
    slot: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<()> {
    match kind {
        RecordListKind::Internal | RecordListKind::InlineFixed(_) => Ok(()),
        RecordListKind::Default => {
            let sub: [u8; SUB_ENTRY_SIZE] =
                region[entry_range(kind, slot)].try_into().unwrap();
            free_sub(&sub, ctx, blobs)
        }
        RecordListKind::Duplicate => {
            let table = dup_table(region, slot, ctx, blobs)?;
            for sub in &table {
                free_sub(sub, ctx, blobs)?;
            }
            if let Some(table_id) = dup_table_blob(region, slot) {
                blobs.erase(ctx, table_id)?;
            }
            region[entry_range(kind, slot)].fill(0);
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------
// Duplicates
// ----------------------------------------------------------------------

/// Number of duplicates stored for `slot`.
pub fn dup_count(
    region: &[u8],
    slot: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<usize> {
    let range = entry_range(RecordListKind::Duplicate, slot);
    let head = region[range.start];
    if head & DUP_FLAG_SPILLED != 0 {
        let table_id = BlobId::from_le_bytes(
            region[range.start + 1..range.start + 9].try_into().unwrap(),
        );
        let raw = blobs.read(ctx, table_id)?;
        Ok(u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize)
    } else {
        Ok((head & 0x7f) as usize)
    }
}

/// Insert a duplicate record at `position`; returns its index.
pub fn dup_insert(
    region: &mut [u8],
    slot: usize,
    position: DupPosition,
    data: &[u8],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<usize> {
    let mut table = dup_table(region, slot, ctx, blobs)?;
    let index = match position {
        DupPosition::First => 0,
        DupPosition::Last => table.len(),
        DupPosition::Before(i) => i.min(table.len()),
        DupPosition::After(i) => (i + 1).min(table.len()),
    };
    let sub = encode_sub(data, ctx, blobs)?;
    table.insert(index, sub);
    write_dup_table(region, slot, &table, ctx, blobs)?;
    Ok(index)
}

/// Remove the duplicate at `dup_index`; returns the remaining count.
pub fn dup_erase(
    region: &mut [u8],
    slot: usize,
    dup_index: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<usize> {
    let mut table = dup_table(region, slot, ctx, blobs)?;
    if dup_index >= table.len() {
        return Err(Error::new(ErrorCode::KeyNotFound));
    }
    let sub = table.remove(dup_index);
    free_sub(&sub, ctx, blobs)?;
    let remaining = table.len();
    if remaining == 0 {
        if let Some(table_id) = dup_table_blob(region, slot) {
            blobs.erase(ctx, table_id)?;
        }
        region[entry_range(RecordListKind::Duplicate, slot)].fill(0);
    } else {
        write_dup_table(region, slot, &table, ctx, blobs)?;
    }
    Ok(remaining)
}

/// Overwrite the duplicate at `dup_index` in place.
pub fn dup_set(
    region: &mut [u8],
    slot: usize,
    dup_index: usize,
    data: &[u8],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<()> {
    let table = dup_table(region, slot, ctx, blobs)?;
    let old = table
        .get(dup_index)
        .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
    let new = overwrite_sub(old, data, ctx, blobs)?;

    match dup_table_blob(region, slot) {
        Some(table_id) => {
            // patch the one sub-entry inside the spilled table
            let mut raw = blobs.read(ctx, table_id)?;
            let offset = 4 + dup_index * SUB_ENTRY_SIZE;
            raw[offset..offset + SUB_ENTRY_SIZE].copy_from_slice(&new);
            blobs.overwrite_regions(
                ctx,
                table_id,
                &raw,
                &[Region {
                    offset,
                    len: SUB_ENTRY_SIZE,
                }],
            )?;
        }
        None => {
            let range = entry_range(RecordListKind::Duplicate, slot);
            let base = range.start + 1 + dup_index * SUB_ENTRY_SIZE;
            region[base..base + SUB_ENTRY_SIZE].copy_from_slice(&new);
        }
    }
    Ok(())
}

/// The full duplicate table of `slot`, inline or from its blob.
fn dup_table(
    region: &[u8],
    slot: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<Vec<[u8; SUB_ENTRY_SIZE]>> {
    let range = entry_range(RecordListKind::Duplicate, slot);
    let head = region[range.start];
    if head & DUP_FLAG_SPILLED != 0 {
        let table_id = BlobId::from_le_bytes(
            region[range.start + 1..range.start + 9].try_into().unwrap(),
        );
        let raw = blobs.read(ctx, table_id)?;
        let count = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        Ok((0..count)
            .map(|i| {
                raw[4 + i * SUB_ENTRY_SIZE..4 + (i + 1) * SUB_ENTRY_SIZE]
                    .try_into()
                    .unwrap()
            })
            .collect())
    } else {
        let count = (head & 0x7f) as usize;
        Ok((0..count)
            .map(|i| {
                let base = range.start + 1 + i * SUB_ENTRY_SIZE;
                region[base..base + SUB_ENTRY_SIZE].try_into().unwrap()
            })
            .collect())
    }
}

fn dup_table_blob(region: &[u8], slot: usize) -> Option<BlobId> {
    let range = entry_range(RecordListKind::Duplicate, slot);
    if region[range.start] & DUP_FLAG_SPILLED != 0 {
        Some(BlobId::from_le_bytes(
            region[range.start + 1..range.start + 9].try_into().unwrap(),
        ))
    } else {
        None
    }
}

/// Persist a duplicate table, inline when it fits, else in a blob.
fn write_dup_table(
    region: &mut [u8],
    slot: usize,
    table: &[[u8; SUB_ENTRY_SIZE]],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<()> {
    let range = entry_range(RecordListKind::Duplicate, slot);
    let old_blob = dup_table_blob(region, slot);

    if table.len() <= INLINE_DUP_CAP {
        if let Some(table_id) = old_blob {
            blobs.erase(ctx, table_id)?;
        }
        region[range.clone()].fill(0);
        region[range.start] = table.len() as u8;
        for (i, sub) in table.iter().enumerate() {
            let base = range.start + 1 + i * SUB_ENTRY_SIZE;
            region[base..base + SUB_ENTRY_SIZE].copy_from_slice(sub);
        }
    } else {
        let mut raw = Vec::with_capacity(4 + table.len() * SUB_ENTRY_SIZE);
        raw.extend_from_slice(&(table.len() as u32).to_le_bytes());
        for sub in table {
            raw.extend_from_slice(sub);
        }
        let table_id = match old_blob {
            Some(old_id) => blobs.overwrite(ctx, old_id, &raw)?,
            None => blobs.allocate(ctx, &raw)?,
        };
        region[range.clone()].fill(0);
        region[range.start] = DUP_FLAG_SPILLED;
        region[range.start + 1..range.start + 9].copy_from_slice(&table_id.to_le_bytes());
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Sub-entries
// ----------------------------------------------------------------------

fn encode_sub(data: &[u8], ctx: &mut Context, blobs: &BlobManager) -> Result<[u8; SUB_ENTRY_SIZE]> {
    let mut sub = [0u8; SUB_ENTRY_SIZE];
    match data.len() {
        0 => sub[0] = REC_EMPTY,
        1..=7 => {
            sub[0] = REC_TINY;
            sub[1..1 + data.len()].copy_from_slice(data);
            sub[8] = data.len() as u8;
        }
        8 => {
            sub[0] = REC_SMALL;
            sub[1..9].copy_from_slice(data);
        }
        _ => {
            sub[0] = REC_BLOB;
            let blob_id = blobs.allocate(ctx, data)?;
            sub[1..9].copy_from_slice(&blob_id.to_le_bytes());
        }
    }
    Ok(sub)
}

fn overwrite_sub(
    old: &[u8; SUB_ENTRY_SIZE],
    data: &[u8],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<[u8; SUB_ENTRY_SIZE]> {
    if old[0] & REC_BLOB != 0 {
        let old_id = BlobId::from_le_bytes(old[1..9].try_into().unwrap());
        if data.len() > 8 {
            let new_id = blobs.overwrite(ctx, old_id, data)?;
            let mut sub = [0u8; SUB_ENTRY_SIZE];
            sub[0] = REC_BLOB;
            sub[1..9].copy_from_slice(&new_id.to_le_bytes());
            return Ok(sub);
        }
        blobs.erase(ctx, old_id)?;
    }
    encode_sub(data, ctx, blobs)
}

fn read_sub(sub: &[u8; SUB_ENTRY_SIZE], ctx: &mut Context, blobs: &BlobManager) -> Result<Vec<u8>> {
    if sub[0] & REC_EMPTY != 0 {
        Ok(Vec::new())
    } else if sub[0] & REC_TINY != 0 {
        let len = sub[8] as usize;
        Ok(sub[1..1 + len].to_vec())
    } else if sub[0] & REC_SMALL != 0 {
        Ok(sub[1..9].to_vec())
    } else if sub[0] & REC_BLOB != 0 {
        let blob_id = BlobId::from_le_bytes(sub[1..9].try_into().unwrap());
        blobs.read(ctx, blob_id)
    } else {
        // zeroed entry: no record was ever attached
        Ok(Vec::new())
    }
}

fn sub_size(sub: &[u8; SUB_ENTRY_SIZE], ctx: &mut Context, blobs: &BlobManager) -> Result<u32> {
    if sub[0] & REC_EMPTY != 0 {
        Ok(0)
    } else if sub[0] & REC_TINY != 0 {
        Ok(sub[8] as u32)
    } else if sub[0] & REC_SMALL != 0 {
        Ok(8)
    } else if sub[0] & REC_BLOB != 0 {
        let blob_id = BlobId::from_le_bytes(sub[1..9].try_into().unwrap());
        blobs.blob_size(ctx, blob_id)
    } else {
        Ok(0)
    }
}

fn free_sub(sub: &[u8; SUB_ENTRY_SIZE], ctx: &mut Context, blobs: &BlobManager) -> Result<()> {
    if sub[0] & REC_BLOB != 0 {
        let blob_id = BlobId::from_le_bytes(sub[1..9].try_into().unwrap());
        blobs.erase(ctx, blob_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{Device, InMemoryDevice};
    use crate::storage::pager::{PageManager, PagerConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn blobs() -> BlobManager {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(dev)));
        BlobManager::new(Arc::new(PageManager::new(
            PagerConfig {
                page_size: 1024,
                cache_capacity: 256,
                cache_unlimited: false,
                crc_enabled: false,
            },
            device,
        )))
    }

    #[test]
    fn test_default_record_shapes() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Default;
        let mut region = vec![0u8; 4 * kind.width()];

        for (slot, data) in [
            b"".as_slice(),
            b"tiny".as_slice(),
            b"8bytes!!".as_slice(),
            b"this record is far too long to stay inline".as_slice(),
        ]
        .iter()
        .enumerate()
        {
            insert_entry(kind, &mut region, slot, slot);
            set_record(kind, &mut region, slot, data, &mut ctx, &blobs).unwrap();
        }

        for (slot, data) in [
            b"".as_slice(),
            b"tiny".as_slice(),
            b"8bytes!!".as_slice(),
            b"this record is far too long to stay inline".as_slice(),
        ]
        .iter()
        .enumerate()
        {
            assert_eq!(
                record(kind, &region, slot, 0, &mut ctx, &blobs).unwrap(),
                *data
            );
            assert_eq!(
                record_size(kind, &region, slot, 0, &mut ctx, &blobs).unwrap(),
                data.len() as u32
            );
        }
    }

    #[test]
    fn test_blob_record_overwrite_reuses_allocation() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Default;
        let mut region = vec![0u8; kind.width()];

        insert_entry(kind, &mut region, 0, 0);
        set_record(kind, &mut region, 0, &vec![1u8; 100], &mut ctx, &blobs).unwrap();
        set_record(kind, &mut region, 0, &vec![2u8; 50], &mut ctx, &blobs).unwrap();
        assert_eq!(
            record(kind, &region, 0, 0, &mut ctx, &blobs).unwrap(),
            vec![2u8; 50]
        );
        // shrink to inline releases the blob
        set_record(kind, &mut region, 0, b"abc", &mut ctx, &blobs).unwrap();
        assert_eq!(record(kind, &region, 0, 0, &mut ctx, &blobs).unwrap(), b"abc");
    }

    #[test]
    fn test_duplicates_inline_then_spill() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Duplicate;
        let mut region = vec![0u8; kind.width()];

        insert_entry(kind, &mut region, 0, 0);
        for i in 0..6u8 {
            let data = vec![b'a' + i; 4];
            dup_insert(&mut region, 0, DupPosition::Last, &data, &mut ctx, &blobs).unwrap();
        }
        assert_eq!(dup_count(&region, 0, &mut ctx, &blobs).unwrap(), 6);
        assert!(
            dup_table_blob(&region, 0).is_some(),
            "six duplicates exceed the inline capacity"
        );

        for i in 0..6u8 {
            assert_eq!(
                record(kind, &region, 0, i as usize, &mut ctx, &blobs).unwrap(),
                vec![b'a' + i; 4]
            );
        }
    }

    #[test]
    fn test_duplicate_positions() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Duplicate;
        let mut region = vec![0u8; kind.width()];
        insert_entry(kind, &mut region, 0, 0);

        dup_insert(&mut region, 0, DupPosition::Last, b"b", &mut ctx, &blobs).unwrap();
        dup_insert(&mut region, 0, DupPosition::First, b"a", &mut ctx, &blobs).unwrap();
        dup_insert(&mut region, 0, DupPosition::After(1), b"c", &mut ctx, &blobs).unwrap();
        dup_insert(&mut region, 0, DupPosition::Before(2), b"x", &mut ctx, &blobs).unwrap();

        let read = |i, ctx: &mut Context| record(kind, &region, 0, i, ctx, &blobs).unwrap();
        assert_eq!(read(0, &mut ctx), b"a");
        assert_eq!(read(1, &mut ctx), b"b");
        assert_eq!(read(2, &mut ctx), b"x");
        assert_eq!(read(3, &mut ctx), b"c");
    }

    #[test]
    fn test_duplicate_erase_back_to_inline() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Duplicate;
        let mut region = vec![0u8; kind.width()];
        insert_entry(kind, &mut region, 0, 0);

        for i in 0..6u8 {
            dup_insert(&mut region, 0, DupPosition::Last, &[i], &mut ctx, &blobs).unwrap();
        }
        assert_eq!(dup_erase(&mut region, 0, 0, &mut ctx, &blobs).unwrap(), 5);
        assert_eq!(dup_erase(&mut region, 0, 0, &mut ctx, &blobs).unwrap(), 4);
        assert!(dup_table_blob(&region, 0).is_none(), "table shrank back inline");
        assert_eq!(record(kind, &region, 0, 0, &mut ctx, &blobs).unwrap(), &[2]);
    }

    #[test]
    fn test_dup_set_patches_in_place() {
        let blobs = blobs();
        let mut ctx = Context::new(None);
        let kind = RecordListKind::Duplicate;
        let mut region = vec![0u8; kind.width()];
        insert_entry(kind, &mut region, 0, 0);

        for i in 0..6u8 {
            dup_insert(&mut region, 0, DupPosition::Last, &[i], &mut ctx, &blobs).unwrap();
        }
        dup_set(&mut region, 0, 3, b"patched", &mut ctx, &blobs).unwrap();
        assert_eq!(
            record(kind, &region, 0, 3, &mut ctx, &blobs).unwrap(),
            b"patched"
        );
        assert_eq!(record(kind, &region, 0, 4, &mut ctx, &blobs).unwrap(), &[4]);
    }

    #[test]
    fn test_internal_children() {
        let kind = RecordListKind::Internal;
        let mut region = vec![0u8; 3 * kind.width()];
        insert_entry(kind, &mut region, 0, 0);
        set_child(&mut region, 0, 0x4000);
        insert_entry(kind, &mut region, 1, 0);
        set_child(&mut region, 0, 0x2000);
        assert_eq!(child_at(&region, 0), 0x2000);
        assert_eq!(child_at(&region, 1), 0x4000);
    }
}
