//! Pages: the unit of I/O and of cache admission.
//!
//! Every page starts with a fixed 32-byte persisted header followed by the
//! type-specific payload. The header carries the lsn of the last write,
//! the page type and a CRC32 of the payload.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Lsn, PageAddr};

/// Size of the persisted page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 32;

// Persisted header layout:
//   0.. 8  lsn        u64 LE
//   8..12  flags      u32 LE
//  12..14  type       u16 LE
//  14..16  reserved
//  16..20  crc32      u32 LE
//  20..32  reserved

const OFS_LSN: usize = 0;
const OFS_FLAGS: usize = 8;
const OFS_TYPE: usize = 12;
const OFS_CRC: usize = 16;

/// Page type tag, persisted in the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageType {
    /// The environment header page (address 0)
    Header = 1,
    /// A btree node
    Index = 2,
    /// A blob page
    Blob = 3,
    /// Serialized page-manager state (freelist)
    PagerState = 4,
}

impl PageType {
    pub fn from_u16(v: u16) -> Result<Self> {
        match v {
            1 => Ok(PageType::Header),
            2 => Ok(PageType::Index),
            3 => Ok(PageType::Blob),
            4 => Ok(PageType::PagerState),
            _ => Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!("unknown page type {}", v),
            )),
        }
    }
}

/// A page resident in the cache.
pub struct Page {
    address: PageAddr,
    data: Vec<u8>,
    is_dirty: bool,
    is_allocated: bool,
    /// Continuation page of a multi-page blob: the whole page is raw
    /// payload, there is no persisted header and no CRC.
    without_header: bool,
    /// Number of btree cursors coupled to this page. A page with coupled
    /// cursors is never evicted.
    cursors: u32,
}

impl Page {
    /// Create a zeroed page buffer for `address`.
    pub fn new(address: PageAddr, page_size: usize) -> Self {
        Page {
            address,
            data: vec![0u8; page_size],
            is_dirty: false,
            is_allocated: true,
            without_header: false,
            cursors: 0,
        }
    }

    /// Wrap raw bytes read from the device.
    pub fn from_bytes(address: PageAddr, data: Vec<u8>) -> Self {
        Page {
            address,
            data,
            is_dirty: false,
            is_allocated: false,
            without_header: false,
            cursors: 0,
        }
    }

    pub fn address(&self) -> PageAddr {
        self.address
    }

    pub fn set_address(&mut self, address: PageAddr) {
        self.address = address;
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Usable payload bytes of a page of `page_size`.
    pub fn usable_page_size(page_size: u32) -> usize {
        page_size as usize - PAGE_HEADER_SIZE
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.is_dirty = dirty;
    }

    pub fn is_allocated(&self) -> bool {
        self.is_allocated
    }

    pub fn is_without_header(&self) -> bool {
        self.without_header
    }

    pub fn set_without_header(&mut self, without_header: bool) {
        self.without_header = without_header;
    }

    pub fn cursor_count(&self) -> u32 {
        self.cursors
    }

    pub fn attach_cursor(&mut self) {
        self.cursors += 1;
    }

    pub fn detach_cursor(&mut self) {
        debug_assert!(self.cursors > 0);
        self.cursors = self.cursors.saturating_sub(1);
    }

    // ------------------------------------------------------------------
    // Header accessors
    // ------------------------------------------------------------------

    pub fn lsn(&self) -> Lsn {
        u64::from_le_bytes(self.data[OFS_LSN..OFS_LSN + 8].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[OFS_LSN..OFS_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn flags(&self) -> u32 {
        u32::from_le_bytes(self.data[OFS_FLAGS..OFS_FLAGS + 4].try_into().unwrap())
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.data[OFS_FLAGS..OFS_FLAGS + 4].copy_from_slice(&flags.to_le_bytes());
    }

    pub fn raw_type(&self) -> u16 {
        u16::from_le_bytes(self.data[OFS_TYPE..OFS_TYPE + 2].try_into().unwrap())
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u16(self.raw_type())
    }

    pub fn set_type(&mut self, page_type: PageType) {
        self.data[OFS_TYPE..OFS_TYPE + 2].copy_from_slice(&(page_type as u16).to_le_bytes());
    }

    fn stored_crc(&self) -> u32 {
        u32::from_le_bytes(self.data[OFS_CRC..OFS_CRC + 4].try_into().unwrap())
    }

    fn set_stored_crc(&mut self, crc: u32) {
        self.data[OFS_CRC..OFS_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    }

    // ------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------

    /// Payload (everything after the persisted header). Continuation pages
    /// of multi-page blobs expose the full raw page.
    pub fn payload(&self) -> &[u8] {
        if self.without_header {
            &self.data
        } else {
            &self.data[PAGE_HEADER_SIZE..]
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.without_header {
            &mut self.data
        } else {
            &mut self.data[PAGE_HEADER_SIZE..]
        }
    }

    /// The raw page, header included, as written to the device.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    // ------------------------------------------------------------------
    // CRC32
    // ------------------------------------------------------------------

    fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.address as u32);
        hasher.update(&self.data[PAGE_HEADER_SIZE..]);
        hasher.finalize()
    }

    /// Recompute and store the payload CRC. Called right before the page
    /// is written to the device.
    pub fn update_crc(&mut self) {
        if self.without_header {
            return;
        }
        let crc = self.compute_crc();
        self.set_stored_crc(crc);
    }

    /// Verify the stored CRC against the payload. Called right after the
    /// page was read from the device.
    pub fn verify_crc(&self) -> Result<()> {
        if self.without_header {
            return Ok(());
        }
        let actual = self.compute_crc();
        if actual != self.stored_crc() {
            log::error!(
                "crc mismatch on page {:#x}: stored {:#x}, computed {:#x}",
                self.address,
                self.stored_crc(),
                actual
            );
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        Ok(())
    }
}

/// Shared handle to a cached page.
pub type PageRef = Arc<Mutex<Page>>;
