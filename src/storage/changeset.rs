//! Changesets: the set of pages touched by one top-level operation.

use std::collections::HashSet;

use crate::storage::page::PageRef;
use crate::types::{PageAddr, TxnId};

/// Collects every page a top-level operation touches. On commit the
/// changeset is journaled first, then the pages are written in place.
/// Holding a `PageRef` also pins the page against eviction.
#[derive(Default)]
pub struct Changeset {
    pages: Vec<PageRef>,
    addresses: HashSet<PageAddr>,
}

impl Changeset {
    pub fn new() -> Self {
        Changeset::default()
    }

    /// Add a page; duplicate addresses are ignored.
    pub fn put(&mut self, page: &PageRef) {
        let addr = page.lock().address();
        if self.addresses.insert(addr) {
            self.pages.push(page.clone());
        }
    }

    pub fn contains(&self, address: PageAddr) -> bool {
        self.addresses.contains(&address)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.addresses.clear();
    }

    /// Move all pages out of `other` into `self`.
    pub fn absorb(&mut self, other: &mut Changeset) {
        for page in other.pages.drain(..) {
            let addr = page.lock().address();
            if self.addresses.insert(addr) {
                self.pages.push(page);
            }
        }
        other.addresses.clear();
    }
}

/// Per-operation context: the acting transaction plus the changeset of
/// pages the operation has touched so far.
pub struct Context {
    pub txn_id: Option<TxnId>,
    pub changeset: Changeset,
}

impl Context {
    pub fn new(txn_id: Option<TxnId>) -> Self {
        Context {
            txn_id,
            changeset: Changeset::new(),
        }
    }
}
