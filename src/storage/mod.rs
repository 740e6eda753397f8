//! Storage layer: pages, cache, pager, blobs and the btree.

pub mod blob;
pub mod btree;
pub mod cache;
pub mod changeset;
pub mod freelist;
pub mod page;
pub mod pager;
pub mod worker;
