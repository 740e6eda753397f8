//! Page manager: allocation, fetching, eviction and freelist persistence.
//!
//! The manager owns the page cache and the freelist behind one lock, and
//! talks to the device for everything that misses the cache. All mutating
//! entry points take a [`Context`] whose changeset collects the touched
//! pages.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::os::Device;
use crate::storage::cache::Cache;
use crate::storage::changeset::Context;
use crate::storage::freelist::Freelist;
use crate::storage::page::{Page, PageRef, PageType, PAGE_HEADER_SIZE};
use crate::types::{Lsn, PageAddr};

/// Minimum number of pages one purge pass evicts.
const PURGE_FLOOR: usize = 20;

bitflags! {
    /// Flags for [`PageManager::fetch`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        /// Do not add the page to the caller's changeset
        const READ_ONLY = 0x0001;
        /// The page has no persisted header (blob continuation page)
        const NO_HEADER = 0x0002;
    }

    /// Flags for [`PageManager::alloc`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the payload even when the page is reused from the freelist
        const CLEAR_WITH_ZERO = 0x0001;
    }
}

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: u32,
    /// Cache capacity in pages
    pub cache_capacity: usize,
    pub cache_unlimited: bool,
    pub crc_enabled: bool,
}

struct PagerInner {
    cache: Cache,
    freelist: Freelist,
    /// Back-link to the page blobs are currently appended to
    last_blob_page: PageAddr,
    /// Chain of pager-state pages, in order
    state_pages: Vec<PageAddr>,
}

/// The pager. Shared between the environment and the background worker.
pub struct PageManager {
    config: PagerConfig,
    device: Arc<Mutex<Box<dyn Device>>>,
    inner: Mutex<PagerInner>,
}

impl PageManager {
    pub fn new(config: PagerConfig, device: Arc<Mutex<Box<dyn Device>>>) -> Self {
        PageManager {
            config,
            device,
            inner: Mutex::new(PagerInner {
                cache: Cache::new(),
                freelist: Freelist::new(),
                last_blob_page: 0,
                state_pages: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<Mutex<Box<dyn Device>>> {
        &self.device
    }

    pub fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Usable payload bytes per page.
    pub fn usable_page_size(&self) -> usize {
        self.config.page_size as usize - PAGE_HEADER_SIZE
    }

    // ------------------------------------------------------------------
    // Fetch / alloc / free
    // ------------------------------------------------------------------

    /// Fetch the page at `addr`, reading it from the device on a miss.
    pub fn fetch(&self, ctx: &mut Context, addr: PageAddr, flags: FetchFlags) -> Result<PageRef> {
        let mut inner = self.inner.lock();

        if let Some(page) = inner.cache.get(addr) {
            drop(inner);
            if !flags.contains(FetchFlags::READ_ONLY) {
                ctx.changeset.put(&page);
            }
            return Ok(page);
        }

        let mut data = vec![0u8; self.config.page_size as usize];
        self.device.lock().read(addr, &mut data)?;

        let mut page = Page::from_bytes(addr, data);
        if flags.contains(FetchFlags::NO_HEADER) {
            page.set_without_header(true);
        } else if self.config.crc_enabled {
            page.verify_crc()?;
        }

        let page = Arc::new(Mutex::new(page));
        inner.cache.insert(addr, page.clone());
        drop(inner);

        if !flags.contains(FetchFlags::READ_ONLY) {
            ctx.changeset.put(&page);
        }
        Ok(page)
    }

    /// Fetch only if the page is resident; never performs I/O.
    pub fn try_fetch_cached(&self, addr: PageAddr) -> Option<PageRef> {
        self.inner.lock().cache.get(addr)
    }

    /// Allocate one page of `page_type`, preferring the freelist.
    pub fn alloc(
        &self,
        ctx: &mut Context,
        page_type: PageType,
        _flags: AllocFlags,
    ) -> Result<PageRef> {
        let mut inner = self.inner.lock();

        let mut addr = inner.freelist.alloc(1, self.config.page_size);
        if addr == 0 {
            addr = self.device.lock().alloc(self.config.page_size as u64)?;
            // address 0 is the header page; devices hand it out exactly once
        } else {
            // a stale copy of the reused page may still be resident
            inner.cache.remove(addr);
        }

        let mut page = Page::new(addr, self.config.page_size as usize);
        page.set_type(page_type);
        page.set_dirty(true);

        let page = Arc::new(Mutex::new(page));
        inner.cache.insert(addr, page.clone());
        drop(inner);

        ctx.changeset.put(&page);
        Ok(page)
    }

    /// Allocate `num_pages` adjacent pages for a multi-page blob. The
    /// first page is a regular blob page; the rest are raw continuation
    /// pages without a persisted header.
    pub fn alloc_multiple_blob_pages(
        &self,
        ctx: &mut Context,
        num_pages: usize,
    ) -> Result<Vec<PageRef>> {
        let page_size = self.config.page_size as u64;
        let mut inner = self.inner.lock();

        let mut base = inner.freelist.alloc(num_pages as u64, self.config.page_size);
        if base == 0 {
            base = self.device.lock().alloc(num_pages as u64 * page_size)?;
        }

        let mut pages = Vec::with_capacity(num_pages);
        for i in 0..num_pages {
            let addr = base + i as u64 * page_size;
            inner.cache.remove(addr);
            let mut page = Page::new(addr, self.config.page_size as usize);
            if i == 0 {
                page.set_type(PageType::Blob);
            } else {
                page.set_without_header(true);
            }
            page.set_dirty(true);
            let page = Arc::new(Mutex::new(page));
            inner.cache.insert(addr, page.clone());
            pages.push(page);
        }
        drop(inner);

        for page in &pages {
            ctx.changeset.put(page);
        }
        Ok(pages)
    }

    /// Return `num_pages` adjacent pages starting at `addr` to the
    /// freelist and drop them from the cache.
    pub fn del(&self, _ctx: &mut Context, addr: PageAddr, num_pages: u64) {
        let mut inner = self.inner.lock();
        let page_size = self.config.page_size as u64;
        for i in 0..num_pages {
            inner.cache.remove(addr + i * page_size);
        }
        inner.freelist.put_run(addr, num_pages, self.config.page_size);
        if inner.last_blob_page == addr {
            inner.last_blob_page = 0;
        }
    }

    /// True if `addr` currently sits in the freelist.
    pub fn is_free(&self, addr: PageAddr) -> bool {
        self.inner
            .lock()
            .freelist
            .contains_address(addr, self.config.page_size)
    }

    // ------------------------------------------------------------------
    // Blob page back-link
    // ------------------------------------------------------------------

    pub fn last_blob_page(&self) -> PageAddr {
        self.inner.lock().last_blob_page
    }

    pub fn set_last_blob_page(&self, addr: PageAddr) {
        self.inner.lock().last_blob_page = addr;
    }

    // ------------------------------------------------------------------
    // Eviction and flushing
    // ------------------------------------------------------------------

    /// Evict cold pages when the cache exceeds its capacity. Dirty
    /// evictees are written out first.
    pub fn purge(&self) -> Result<usize> {
        if self.config.cache_unlimited {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        let resident = inner.cache.len();
        if resident <= self.config.cache_capacity {
            return Ok(0);
        }
        let target = (resident - self.config.cache_capacity).max(PURGE_FLOOR);
        let victims = inner.cache.purge_candidates(target);

        let mut evicted = 0;
        for addr in victims {
            if let Some(page) = inner.cache.peek(addr) {
                {
                    let mut guard = match page.try_lock() {
                        Some(guard) => guard,
                        None => continue,
                    };
                    if guard.is_dirty() {
                        self.write_page(&mut guard)?;
                    }
                }
                inner.cache.remove(addr);
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::debug!("purged {} pages from the cache", evicted);
        }
        Ok(evicted)
    }

    /// True once the cache has outgrown its capacity.
    pub fn needs_purge(&self) -> bool {
        !self.config.cache_unlimited && self.inner.lock().cache.len() > self.config.cache_capacity
    }

    /// Write one page to the device, refreshing its CRC and clearing the
    /// dirty bit.
    fn write_page(&self, page: &mut Page) -> Result<()> {
        if self.config.crc_enabled {
            page.update_crc();
        }
        self.device.lock().write(page.address(), page.raw_data())?;
        page.set_dirty(false);
        Ok(())
    }

    /// Write a page that carries the given lsn.
    pub fn flush_page(&self, page: &PageRef, lsn: Lsn) -> Result<()> {
        let mut guard = page.lock();
        if guard.is_dirty() {
            guard.set_lsn(lsn);
            self.write_page(&mut guard)?;
        }
        Ok(())
    }

    /// Synchronously write every dirty page; optionally empty the cache.
    pub fn flush_all(&self, delete_pages: bool) -> Result<()> {
        let inner = self.inner.lock();
        for (_, page) in inner.cache.iter() {
            let mut guard = page.lock();
            if guard.is_dirty() {
                self.write_page(&mut guard)?;
            }
        }
        drop(inner);
        if delete_pages {
            self.inner.lock().cache.clear();
        }
        self.device.lock().flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State persistence
    // ------------------------------------------------------------------

    /// Serialize the freelist and the blob back-link into one or more
    /// pager-state pages. Returns the address of the first state page, or
    /// 0 when there is nothing to persist.
    ///
    /// State page payload layout:
    ///   0.. 8  address of the next state page (0 = end of chain)
    ///   8..16  last blob page address (first page of the chain only)
    ///  16..    freelist entries (4-byte counter + packed runs)
    pub fn store_state(&self, ctx: &mut Context) -> Result<PageAddr> {
        let usable = self.usable_page_size();

        loop {
            let (needed, entries_empty) = {
                let inner = self.inner.lock();
                // worst case 9 bytes per entry after the 16-byte prologue
                let per_page = (usable - 16 - 4) / 9;
                let needed = inner.freelist.entry_count().div_ceil(per_page.max(1)).max(1);
                (needed, inner.freelist.is_empty() && inner.last_blob_page == 0)
            };

            if entries_empty && self.inner.lock().state_pages.is_empty() {
                return Ok(0);
            }

            // grow the chain first; allocation mutates the freelist, so
            // re-check afterwards and only encode once the chain suffices
            let have = self.inner.lock().state_pages.len();
            if have < needed {
                for _ in have..needed {
                    let page = self.alloc(ctx, PageType::PagerState, AllocFlags::CLEAR_WITH_ZERO)?;
                    let addr = page.lock().address();
                    self.inner.lock().state_pages.push(addr);
                }
                continue;
            }

            // encode into the existing chain; every chain page is always
            // rewritten so stale tails cannot survive
            let state_pages = self.inner.lock().state_pages.clone();
            let mut resume = None;
            let mut exhausted = false;
            let mut overflow = false;

            for (i, &addr) in state_pages.iter().enumerate() {
                let next = state_pages.get(i + 1).copied().unwrap_or(0);

                // encode outside the page lock; purge locks pager-then-page
                let mut encoded = vec![0u8; usable - 16];
                let last_blob;
                {
                    let inner = self.inner.lock();
                    last_blob = if i == 0 { inner.last_blob_page } else { 0 };
                    if !exhausted {
                        resume = inner.freelist.encode_state(
                            resume,
                            &mut encoded,
                            self.config.page_size,
                        );
                        if resume.is_none() {
                            exhausted = true;
                        }
                    }
                    // an exhausted pass leaves the zeroed counter in place
                }

                let page = self.fetch(ctx, addr, FetchFlags::empty())?;
                let mut guard = page.lock();
                let payload = guard.payload_mut();
                payload[0..8].copy_from_slice(&next.to_le_bytes());
                payload[8..16].copy_from_slice(&last_blob.to_le_bytes());
                payload[16..].copy_from_slice(&encoded);
                guard.set_dirty(true);

                if i + 1 == state_pages.len() && !exhausted {
                    overflow = true;
                }
            }

            if overflow {
                // the estimate was too small; extend the chain and retry
                let page = self.alloc(ctx, PageType::PagerState, AllocFlags::CLEAR_WITH_ZERO)?;
                let addr = page.lock().address();
                self.inner.lock().state_pages.push(addr);
                continue;
            }

            return Ok(state_pages[0]);
        }
    }

    /// Rebuild the freelist and blob back-link from the state chain
    /// starting at `addr`.
    pub fn load_state(&self, ctx: &mut Context, mut addr: PageAddr) -> Result<()> {
        let mut first = true;
        while addr != 0 {
            let page = self.fetch(ctx, addr, FetchFlags::READ_ONLY)?;
            let guard = page.lock();
            if guard.page_type()? != PageType::PagerState {
                return Err(Error::new(ErrorCode::IntegrityViolated));
            }
            let payload = guard.payload();
            let next = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            let last_blob = u64::from_le_bytes(payload[8..16].try_into().unwrap());

            let mut inner = self.inner.lock();
            if first {
                inner.last_blob_page = last_blob;
                first = false;
            }
            inner.state_pages.push(addr);
            inner
                .freelist
                .decode_state(&payload[16..], self.config.page_size);
            drop(inner);

            addr = next;
        }
        Ok(())
    }

    /// Cut trailing free runs off the file. Returns the new file size.
    pub fn truncate_tail(&self) -> Result<u64> {
        let file_size = self.device.lock().file_size()?;
        let mut inner = self.inner.lock();
        let new_size = inner.freelist.truncate(file_size, self.config.page_size);
        drop(inner);
        if new_size < file_size {
            self.device.lock().truncate(new_size)?;
            log::debug!("truncated file tail from {} to {} bytes", file_size, new_size);
        }
        Ok(new_size)
    }

    /// Cache statistics: (resident, hits, misses).
    pub fn cache_stats(&self) -> (usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.hits, inner.cache.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::InMemoryDevice;

    fn manager(capacity: usize) -> PageManager {
        let mut dev = InMemoryDevice::new(1024, 0);
        dev.create().unwrap();
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(dev)));
        PageManager::new(
            PagerConfig {
                page_size: 1024,
                cache_capacity: capacity,
                cache_unlimited: false,
                crc_enabled: true,
            },
            device,
        )
    }

    #[test]
    fn test_alloc_fetch_roundtrip() {
        let pm = manager(64);
        let mut ctx = Context::new(None);

        let page = pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
        let addr = page.lock().address();
        page.lock().payload_mut()[0..5].copy_from_slice(b"hello");
        pm.flush_all(true).unwrap();
        drop(page);

        let mut ctx = Context::new(None);
        let fetched = pm.fetch(&mut ctx, addr, FetchFlags::READ_ONLY).unwrap();
        assert_eq!(&fetched.lock().payload()[0..5], b"hello");
        assert_eq!(fetched.lock().page_type().unwrap(), PageType::Index);
    }

    #[test]
    fn test_del_reuses_address() {
        let pm = manager(64);
        let mut ctx = Context::new(None);

        let page = pm.alloc(&mut ctx, PageType::Blob, AllocFlags::empty()).unwrap();
        let addr = page.lock().address();
        drop(page);
        ctx.changeset.clear();

        pm.del(&mut ctx, addr, 1);
        assert!(pm.is_free(addr));

        let page = pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
        assert_eq!(page.lock().address(), addr);
        assert!(!pm.is_free(addr));
    }

    #[test]
    fn test_purge_respects_changeset() {
        let pm = manager(1);
        let mut ctx = Context::new(None);
        for _ in 0..30 {
            pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
        }
        // every page is referenced by the changeset: nothing is evictable
        assert_eq!(pm.purge().unwrap(), 0);
        ctx.changeset.clear();
        assert!(pm.purge().unwrap() > 0);
    }

    #[test]
    fn test_state_roundtrip() {
        let pm = manager(64);
        let mut ctx = Context::new(None);

        // create some free pages
        let mut addrs = Vec::new();
        for _ in 0..8 {
            let page = pm.alloc(&mut ctx, PageType::Index, AllocFlags::empty()).unwrap();
            addrs.push(page.lock().address());
        }
        ctx.changeset.clear();
        for &addr in &addrs[4..] {
            pm.del(&mut ctx, addr, 1);
        }
        pm.set_last_blob_page(addrs[0]);

        let state_addr = pm.store_state(&mut ctx).unwrap();
        assert_ne!(state_addr, 0);
        pm.flush_all(true).unwrap();
        ctx.changeset.clear();

        // a second manager over the same device rebuilds the state
        let pm2 = PageManager::new(pm.config.clone(), pm.device.clone());
        let mut ctx2 = Context::new(None);
        pm2.load_state(&mut ctx2, state_addr).unwrap();
        assert_eq!(pm2.last_blob_page(), addrs[0]);
        for &addr in &addrs[4..] {
            assert!(pm2.is_free(addr));
        }
    }
}
