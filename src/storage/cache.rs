//! Page cache: address lookup plus a single LRU ordering.

use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::page::PageRef;
use crate::types::PageAddr;

/// Maps page addresses to resident pages and keeps one totally-ordered
/// LRU list across all of them. The most recently fetched page sits at the
/// back of the list.
///
/// The cache itself is not synchronized; the page manager guards it with
/// its lock.
#[derive(Default)]
pub struct Cache {
    map: HashMap<PageAddr, PageRef>,
    /// LRU order, least recently used first. Contains exactly the keys of
    /// `map`; a touch splices the address to the back.
    lru: Vec<PageAddr>,
    pub hits: u64,
    pub misses: u64,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up a page and mark it most recently used.
    pub fn get(&mut self, address: PageAddr) -> Option<PageRef> {
        match self.map.get(&address).cloned() {
            Some(page) => {
                self.hits += 1;
                self.touch(address);
                Some(page)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching the LRU order.
    pub fn peek(&self, address: PageAddr) -> Option<PageRef> {
        self.map.get(&address).cloned()
    }

    pub fn insert(&mut self, address: PageAddr, page: PageRef) {
        if self.map.insert(address, page).is_none() {
            self.lru.push(address);
        } else {
            self.touch(address);
        }
    }

    pub fn remove(&mut self, address: PageAddr) -> Option<PageRef> {
        let page = self.map.remove(&address);
        if page.is_some() {
            self.lru.retain(|&a| a != address);
        }
        page
    }

    fn touch(&mut self, address: PageAddr) {
        if let Some(pos) = self.lru.iter().position(|&a| a == address) {
            self.lru.remove(pos);
            self.lru.push(address);
        }
    }

    /// Walk the LRU tail and collect up to `target` evictable pages.
    ///
    /// A page is evictable iff it lives in an allocated buffer (not an
    /// mmap view), is referenced by nobody but the cache (no changeset
    /// holds it) and has no coupled cursors.
    pub fn purge_candidates(&self, target: usize) -> Vec<PageAddr> {
        let mut victims = Vec::new();
        for &addr in self.lru.iter() {
            if victims.len() >= target {
                break;
            }
            let page = &self.map[&addr];
            if Arc::strong_count(page) > 1 {
                continue;
            }
            // never wait: a locked page is in use and stays resident
            let guard = match page.try_lock() {
                Some(guard) => guard,
                None => continue,
            };
            if guard.is_allocated() && guard.cursor_count() == 0 {
                victims.push(addr);
            }
        }
        victims
    }

    /// All resident pages, for full flushes.
    pub fn iter(&self) -> impl Iterator<Item = (&PageAddr, &PageRef)> {
        self.map.iter()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.lru.clear();
    }
}
