//! Core type aliases, flag sets and key/record definitions.
//!
//! This module defines the foundational types used throughout the engine:
//! numeric aliases, the public flag words, typed-key configuration and the
//! comparator plumbing.

use std::cmp::Ordering;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Address of a page (byte offset in the backing device)
pub type PageAddr = u64;

/// Log serial number; strictly increasing over the environment's lifetime
pub type Lsn = u64;

/// Transaction id
pub type TxnId = u64;

/// Database name (16-bit namespace id inside an environment)
pub type DbName = u16;

/// Blob handle; on disk this is the file offset of the blob header
pub type BlobId = u64;

/// Maximum size of a key in bytes (just under 64 KiB; sizes are u16)
pub const MAX_KEY_SIZE: usize = 65535;

/// Marker for "key size is not fixed"
pub const KEY_SIZE_UNLIMITED: u16 = u16::MAX;

/// Marker for "record size is not fixed"
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Flags for `Environment::create` / `Environment::open`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Enable transaction support
        const ENABLE_TRANSACTIONS = 0x0001;
        /// Keep everything in memory; no backing file
        const IN_MEMORY = 0x0002;
        /// Open the file read-only
        const READ_ONLY = 0x0004;
        /// Verify page payloads with CRC32
        const ENABLE_CRC32 = 0x0008;
        /// Replay the journal when opening
        const AUTO_RECOVERY = 0x0010;
        /// Do not write a journal at all
        const DISABLE_RECOVERY = 0x0020;
        /// Never evict pages from the cache
        const CACHE_UNLIMITED = 0x0040;
        /// Do not flush committed transactions into the btree eagerly
        const DONT_FLUSH_TRANSACTIONS = 0x0080;
        /// Flush each transaction into the btree as soon as it commits
        const FLUSH_TRANSACTIONS_IMMEDIATELY = 0x0100;
        /// Hint that access is mostly random (posix_fadvise)
        const RANDOM_ACCESS = 0x0200;
    }

    /// Flags for `Environment::create_db` / `open_db`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Allow duplicate keys
        const ENABLE_DUPLICATES = 0x0001;
    }

    /// Flags for `Database::insert` and `Cursor::insert`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Overwrite the record if the key exists
        const OVERWRITE = 0x0001;
        /// Insert a duplicate if the key exists
        const DUPLICATE = 0x0002;
        /// Insert the duplicate before the cursor position
        const DUPLICATE_INSERT_BEFORE = 0x0004;
        /// Insert the duplicate after the cursor position
        const DUPLICATE_INSERT_AFTER = 0x0008;
        /// Insert the duplicate as the first of its key
        const DUPLICATE_INSERT_FIRST = 0x0010;
        /// Insert the duplicate as the last of its key
        const DUPLICATE_INSERT_LAST = 0x0020;
    }

    /// Flags for `Database::find` and `Cursor::find`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FindFlags: u32 {
        /// Return the largest key strictly less than the requested one
        const LT_MATCH = 0x0001;
        /// Return the smallest key strictly greater than the requested one
        const GT_MATCH = 0x0002;
        /// Exact match, or the next smaller key
        const LEQ_MATCH = 0x0004;
        /// Exact match, or the next larger key
        const GEQ_MATCH = 0x0008;
    }

    /// Flags for `Cursor::move_to`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u32 {
        /// Move to the first key
        const FIRST = 0x0001;
        /// Move to the last key
        const LAST = 0x0002;
        /// Move to the next item
        const NEXT = 0x0004;
        /// Move to the previous item
        const PREVIOUS = 0x0008;
        /// Do not step into duplicates of the current key
        const SKIP_DUPLICATES = 0x0010;
        /// Only step within duplicates of the current key
        const ONLY_DUPLICATES = 0x0020;
    }

    /// Flags for `Environment::close`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u32 {
        /// Keep the journal files on disk after a clean close
        const DONT_CLEAR_LOG = 0x0001;
    }
}

impl FindFlags {
    /// `NEAR` match: exact, else the nearest key in either direction.
    pub const NEAR_MATCH: FindFlags = FindFlags::LEQ_MATCH.union(FindFlags::GEQ_MATCH);

    /// True if any approximate-match bit is set.
    pub fn is_approximate(&self) -> bool {
        self.intersects(
            FindFlags::LT_MATCH | FindFlags::GT_MATCH | FindFlags::LEQ_MATCH | FindFlags::GEQ_MATCH,
        )
    }
}

// ============================================================================
// Approximate matches
// ============================================================================

/// Direction of an approximate match result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproxMatch {
    /// The returned key equals the requested key
    Exact,
    /// The returned key is smaller than the requested key
    Lower,
    /// The returned key is greater than the requested key
    Greater,
}

// ============================================================================
// Key and record typing
// ============================================================================

/// Declared type of the keys in a database.
///
/// Typed keys drive the choice of comparator and of the key list layout
/// inside btree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyType {
    /// Variable-size byte strings (default)
    Binary = 0,
    /// Byte strings compared by a user-supplied callback
    Custom = 1,
    /// Unsigned 8-bit integers
    UInt8 = 3,
    /// Unsigned 16-bit integers
    UInt16 = 5,
    /// Unsigned 32-bit integers
    UInt32 = 7,
    /// Unsigned 64-bit integers
    UInt64 = 9,
    /// 32-bit IEEE 754 floats
    Real32 = 11,
    /// 64-bit IEEE 754 floats
    Real64 = 12,
}

impl KeyType {
    /// Reconstruct a key type from its persisted tag.
    pub fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(KeyType::Binary),
            1 => Ok(KeyType::Custom),
            3 => Ok(KeyType::UInt8),
            5 => Ok(KeyType::UInt16),
            7 => Ok(KeyType::UInt32),
            9 => Ok(KeyType::UInt64),
            11 => Ok(KeyType::Real32),
            12 => Ok(KeyType::Real64),
            _ => Err(Error::new(ErrorCode::InvFileHeader)),
        }
    }

    /// Fixed width of this key type, if it has one.
    pub fn fixed_size(&self) -> Option<u16> {
        match self {
            KeyType::UInt8 => Some(1),
            KeyType::UInt16 => Some(2),
            KeyType::UInt32 => Some(4),
            KeyType::UInt64 => Some(8),
            KeyType::Real32 => Some(4),
            KeyType::Real64 => Some(8),
            KeyType::Binary | KeyType::Custom => None,
        }
    }
}

/// Comparator used to order keys inside one database.
pub type CompareFn = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Returns the comparator for a key type; `custom` must be supplied for
/// [`KeyType::Custom`] databases.
pub fn comparator_for(key_type: KeyType, custom: Option<CompareFn>) -> Result<CompareFn> {
    match key_type {
        KeyType::Binary => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| lhs.cmp(rhs))),
        KeyType::Custom => custom.ok_or_else(|| Error::new(ErrorCode::InvParameter)),
        KeyType::UInt8 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            pod_cmp::<1>(lhs, rhs, |b| b[0] as u64)
        })),
        KeyType::UInt16 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            pod_cmp::<2>(lhs, rhs, |b| u16::from_le_bytes([b[0], b[1]]) as u64)
        })),
        KeyType::UInt32 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            pod_cmp::<4>(lhs, rhs, |b| {
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64
            })
        })),
        KeyType::UInt64 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            pod_cmp::<8>(lhs, rhs, |b| {
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            })
        })),
        KeyType::Real32 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            let l = f32::from_le_bytes([lhs[0], lhs[1], lhs[2], lhs[3]]);
            let r = f32::from_le_bytes([rhs[0], rhs[1], rhs[2], rhs[3]]);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        })),
        KeyType::Real64 => Ok(Arc::new(|lhs: &[u8], rhs: &[u8]| {
            let l = f64::from_le_bytes([
                lhs[0], lhs[1], lhs[2], lhs[3], lhs[4], lhs[5], lhs[6], lhs[7],
            ]);
            let r = f64::from_le_bytes([
                rhs[0], rhs[1], rhs[2], rhs[3], rhs[4], rhs[5], rhs[6], rhs[7],
            ]);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        })),
    }
}

fn pod_cmp<const N: usize>(lhs: &[u8], rhs: &[u8], decode: fn(&[u8]) -> u64) -> Ordering {
    debug_assert!(lhs.len() >= N && rhs.len() >= N);
    decode(lhs).cmp(&decode(rhs))
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-database configuration, fixed at creation time and persisted in the
/// database's btree header.
#[derive(Clone)]
pub struct DbConfig {
    /// Database flags
    pub flags: DbFlags,
    /// Key type (drives comparator and key list layout)
    pub key_type: KeyType,
    /// Fixed key size, or [`KEY_SIZE_UNLIMITED`]
    pub key_size: u16,
    /// Fixed record size, or [`RECORD_SIZE_UNLIMITED`]
    pub record_size: u32,
    /// Comparator callback for [`KeyType::Custom`] databases
    pub custom_compare: Option<CompareFn>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            flags: DbFlags::empty(),
            key_type: KeyType::Binary,
            key_size: KEY_SIZE_UNLIMITED,
            record_size: RECORD_SIZE_UNLIMITED,
            custom_compare: None,
        }
    }
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("flags", &self.flags)
            .field("key_type", &self.key_type)
            .field("key_size", &self.key_size)
            .field("record_size", &self.record_size)
            .field("custom_compare", &self.custom_compare.is_some())
            .finish()
    }
}

/// Environment-wide configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Path of the backing file (ignored for in-memory environments)
    pub path: String,
    /// Environment flags
    pub flags: EnvFlags,
    /// Page size in bytes; power-of-two multiple of 1 KiB
    pub page_size: u32,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Hard cap on the backing file size, 0 = unlimited
    pub file_size_limit: u64,
    /// Maximum number of databases; 0 = derive from the page size
    pub max_databases: u16,
    /// Journal compression algorithm tag (0 = none, 1 = zlib)
    pub journal_compression: u8,
    /// Directory for the journal files; empty = next to the backing file
    pub log_directory: String,
    /// Number of committed transactions batched before a journal flush
    pub journal_switch_threshold: u32,
}

/// Default page size: 16 KiB.
pub const DEFAULT_PAGE_SIZE: u32 = 16 * 1024;

/// Default cache size: 2 MB.
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024;

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            path: String::new(),
            flags: EnvFlags::empty(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            file_size_limit: 0,
            max_databases: 0,
            journal_compression: 0,
            log_directory: String::new(),
            journal_switch_threshold: 32,
        }
    }
}

impl EnvConfig {
    /// Create a configuration for the given path with default values.
    pub fn new<S: Into<String>>(path: S) -> Self {
        EnvConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Validate the page size: power-of-two multiple of 1 KiB.
    pub fn validate(&self) -> Result<()> {
        let ps = self.page_size;
        if ps < 1024 || !ps.is_power_of_two() {
            return Err(Error::new(ErrorCode::InvPageSize));
        }
        if self.flags.contains(EnvFlags::AUTO_RECOVERY)
            && self.flags.contains(EnvFlags::DISABLE_RECOVERY)
        {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        Ok(())
    }
}
