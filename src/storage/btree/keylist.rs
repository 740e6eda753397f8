//! Key list strategies: the key half of a btree node.
//!
//! A node's data area is split into a key region and a record region; the
//! key region is managed by one of the strategies below, chosen from the
//! database's declared key type:
//!
//! * `Fixed` — fixed-width binary keys, one stride per slot. Also covers
//!   the plain-old-data typed keys (`u8..u64`, `f32/f64`), which are
//!   stored as native little-endian values and compared decoded.
//! * `Variable` — variable-width binary keys behind a slot directory.
//!   Entries live in a heap growing down from the region end; keys above
//!   the extended threshold spill into a key blob.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob::BlobManager;
use crate::storage::changeset::Context;
use crate::types::BlobId;

/// Inline keys above this size move into an extended-key blob.
pub const EXTENDED_THRESHOLD: usize = 256;

/// Per-entry flag: the entry holds a blob id, not the key bytes.
const KEY_FLAG_EXTENDED: u8 = 0x01;

/// Bytes of entry overhead in the variable layout (flags + size).
const VAR_ENTRY_OVERHEAD: usize = 3;

/// Key list strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListKind {
    /// Fixed-width keys of the given stride
    Fixed(u16),
    /// Variable-width keys with a slot directory
    Variable,
}

impl KeyListKind {
    /// Fixed stride, if this layout has one.
    pub fn stride(&self) -> Option<usize> {
        match self {
            KeyListKind::Fixed(size) => Some(*size as usize),
            KeyListKind::Variable => None,
        }
    }
}

/// Outcome of an insert attempt at the key-list level.
#[derive(Debug, PartialEq, Eq)]
pub enum KeyInsert {
    Ok,
    /// The region cannot take the key even after compaction
    NeedsSplit,
}

// ----------------------------------------------------------------------
// Reads
// ----------------------------------------------------------------------

/// Read the full key bytes of `slot`.
pub fn key_at(
    kind: KeyListKind,
    region: &[u8],
    length: usize,
    slot: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<Vec<u8>> {
    debug_assert!(slot < length);
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            Ok(region[slot * size..(slot + 1) * size].to_vec())
        }
        KeyListKind::Variable => {
            let (flags, size, data) = var_entry(region, slot);
            if flags & KEY_FLAG_EXTENDED != 0 {
                let blob_id = BlobId::from_le_bytes(data[..8].try_into().unwrap());
                let key = blobs.read(ctx, blob_id)?;
                debug_assert_eq!(key.len(), size);
                Ok(key)
            } else {
                Ok(data[..size].to_vec())
            }
        }
    }
}

/// Raw stored entry of `slot`, for moving between nodes without touching
/// key blobs.
pub fn raw_entry(kind: KeyListKind, region: &[u8], slot: usize) -> Vec<u8> {
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            region[slot * size..(slot + 1) * size].to_vec()
        }
        KeyListKind::Variable => {
            let offset = dir_get(region, slot);
            let stored = var_stored_len(region, offset);
            region[offset..offset + VAR_ENTRY_OVERHEAD + stored].to_vec()
        }
    }
}

// ----------------------------------------------------------------------
// Writes
// ----------------------------------------------------------------------

/// Insert `key` at `slot`, shifting later slots right.
pub fn insert_key(
    kind: KeyListKind,
    region: &mut [u8],
    length: usize,
    slot: usize,
    key: &[u8],
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<KeyInsert> {
    debug_assert!(slot <= length);
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            if key.len() != size {
                return Err(Error::new(ErrorCode::InvKeySize));
            }
            if (length + 1) * size > region.len() {
                return Ok(KeyInsert::NeedsSplit);
            }
            region.copy_within(slot * size..length * size, (slot + 1) * size);
            region[slot * size..(slot + 1) * size].copy_from_slice(key);
            Ok(KeyInsert::Ok)
        }
        KeyListKind::Variable => {
            let extended = key.len() > EXTENDED_THRESHOLD;
            let stored = if extended { 8 } else { key.len() };
            let entry_size = VAR_ENTRY_OVERHEAD + stored;

            if free_gap(region, length) < entry_size + 2 {
                if total_free(region, length) >= entry_size + 2 {
                    vacuumize(region, length);
                } else {
                    return Ok(KeyInsert::NeedsSplit);
                }
            }

            let offset = heap_low(region, length) - entry_size;
            let flags = if extended { KEY_FLAG_EXTENDED } else { 0 };
            region[offset] = flags;
            region[offset + 1..offset + 3].copy_from_slice(&(key.len() as u16).to_le_bytes());
            if extended {
                let blob_id = blobs.allocate(ctx, key)?;
                region[offset + 3..offset + 11].copy_from_slice(&blob_id.to_le_bytes());
            } else {
                region[offset + 3..offset + 3 + key.len()].copy_from_slice(key);
            }

            dir_insert(region, length, slot, offset);
            Ok(KeyInsert::Ok)
        }
    }
}

/// Insert a raw entry previously read with [`raw_entry`]; blob ownership
/// moves with the entry.
pub fn insert_raw(
    kind: KeyListKind,
    region: &mut [u8],
    length: usize,
    slot: usize,
    entry: &[u8],
) -> Result<()> {
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            debug_assert_eq!(entry.len(), size);
            if (length + 1) * size > region.len() {
                return Err(Error::new(ErrorCode::LimitsReached));
            }
            region.copy_within(slot * size..length * size, (slot + 1) * size);
            region[slot * size..(slot + 1) * size].copy_from_slice(entry);
            Ok(())
        }
        KeyListKind::Variable => {
            if free_gap(region, length) < entry.len() + 2 {
                if total_free(region, length) >= entry.len() + 2 {
                    vacuumize(region, length);
                } else {
                    return Err(Error::new(ErrorCode::LimitsReached));
                }
            }
            let offset = heap_low(region, length) - entry.len();
            region[offset..offset + entry.len()].copy_from_slice(entry);
            dir_insert(region, length, slot, offset);
            Ok(())
        }
    }
}

/// Remove the key at `slot`, shifting later slots left. Extended keys
/// release their blob.
pub fn erase_key(
    kind: KeyListKind,
    region: &mut [u8],
    length: usize,
    slot: usize,
    ctx: &mut Context,
    blobs: &BlobManager,
) -> Result<()> {
    debug_assert!(slot < length);
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            region.copy_within((slot + 1) * size..length * size, slot * size);
            Ok(())
        }
        KeyListKind::Variable => {
            let (flags, _, data) = var_entry(region, slot);
            if flags & KEY_FLAG_EXTENDED != 0 {
                let blob_id = BlobId::from_le_bytes(data[..8].try_into().unwrap());
                blobs.erase(ctx, blob_id)?;
            }
            dir_remove(region, length, slot);
            Ok(())
        }
    }
}

/// Remove the entry at `slot` without releasing key blobs; used when the
/// raw entry has been moved to another node.
pub fn erase_raw(kind: KeyListKind, region: &mut [u8], length: usize, slot: usize) {
    match kind {
        KeyListKind::Fixed(size) => {
            let size = size as usize;
            region.copy_within((slot + 1) * size..length * size, slot * size);
        }
        KeyListKind::Variable => {
            dir_remove(region, length, slot);
        }
    }
}

/// True if inserting `key` requires a node split.
pub fn requires_split(kind: KeyListKind, region: &[u8], length: usize, key: &[u8]) -> bool {
    match kind {
        KeyListKind::Fixed(size) => (length + 1) * size as usize > region.len(),
        KeyListKind::Variable => {
            let stored = if key.len() > EXTENDED_THRESHOLD {
                8
            } else {
                key.len()
            };
            total_free(region, length) < VAR_ENTRY_OVERHEAD + stored + 2
        }
    }
}

/// Bytes of the region in use (directory + stored entries).
pub fn used_bytes(kind: KeyListKind, region: &[u8], length: usize) -> usize {
    match kind {
        KeyListKind::Fixed(size) => length * size as usize,
        KeyListKind::Variable => region.len() - total_free(region, length),
    }
}

/// Free bytes of the region, counting heap holes.
pub fn free_bytes(kind: KeyListKind, region: &[u8], length: usize) -> usize {
    region.len() - used_bytes(kind, region, length)
}

/// Compact the heap of a variable region in place, reclaiming the holes
/// left by erased keys. A no-op for fixed layouts.
pub fn vacuumize(region: &mut [u8], length: usize) {
    let mut entries: Vec<(usize, Vec<u8>)> = (0..length)
        .map(|slot| {
            let offset = dir_get(region, slot);
            let stored = var_stored_len(region, offset);
            (slot, region[offset..offset + VAR_ENTRY_OVERHEAD + stored].to_vec())
        })
        .collect();

    let mut write_pos = region.len();
    for (slot, entry) in entries.drain(..) {
        write_pos -= entry.len();
        region[write_pos..write_pos + entry.len()].copy_from_slice(&entry);
        dir_set(region, slot, write_pos);
    }
}

// ----------------------------------------------------------------------
// Variable-layout internals
// ----------------------------------------------------------------------
//
// Region layout: a directory of 2-byte offsets (region-relative) grows up
// from byte 0, one per slot; entries {flags u8, size u16, data} grow down
// from the region end.

fn dir_get(region: &[u8], slot: usize) -> usize {
    u16::from_le_bytes(region[slot * 2..slot * 2 + 2].try_into().unwrap()) as usize
}

fn dir_set(region: &mut [u8], slot: usize, offset: usize) {
    region[slot * 2..slot * 2 + 2].copy_from_slice(&(offset as u16).to_le_bytes());
}

fn dir_insert(region: &mut [u8], length: usize, slot: usize, offset: usize) {
    region.copy_within(slot * 2..length * 2, slot * 2 + 2);
    dir_set(region, slot, offset);
}

fn dir_remove(region: &mut [u8], length: usize, slot: usize) {
    region.copy_within((slot + 1) * 2..length * 2, slot * 2);
}

fn var_stored_len(region: &[u8], offset: usize) -> usize {
    let flags = region[offset];
    let size = u16::from_le_bytes(region[offset + 1..offset + 3].try_into().unwrap()) as usize;
    if flags & KEY_FLAG_EXTENDED != 0 {
        8
    } else {
        size
    }
}

fn var_entry(region: &[u8], slot: usize) -> (u8, usize, &[u8]) {
    let offset = dir_get(region, slot);
    let flags = region[offset];
    let size = u16::from_le_bytes(region[offset + 1..offset + 3].try_into().unwrap()) as usize;
    let stored = if flags & KEY_FLAG_EXTENDED != 0 { 8 } else { size };
    (flags, size, &region[offset + 3..offset + 3 + stored])
}

/// Lowest heap offset in use; `region.len()` when the heap is empty.
fn heap_low(region: &[u8], length: usize) -> usize {
    (0..length)
        .map(|slot| dir_get(region, slot))
        .min()
        .unwrap_or(region.len())
}

/// Contiguous free bytes between the directory and the heap.
fn free_gap(region: &[u8], length: usize) -> usize {
    heap_low(region, length).saturating_sub(length * 2)
}

/// Total free bytes, counting heap holes.
fn total_free(region: &[u8], length: usize) -> usize {
    let used: usize = (0..length)
        .map(|slot| {
            let offset = dir_get(region, slot);
            VAR_ENTRY_OVERHEAD + var_stored_len(region, offset)
        })
        .sum();
    region.len() - length * 2 - used
}
