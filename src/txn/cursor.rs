//! Transaction cursor: walks the visible part of a transaction index.
//!
//! A "position" is a node of the index whose op chain yields a visible op
//! for the acting transaction. Erase ops are positions too; the merged
//! cursor decides whether to surface or skip them.

use crate::txn::index::{NodeId, TxnIndex};
use crate::txn::{OpId, TxnManager};
use crate::types::{ApproxMatch, FindFlags, TxnId};

/// A visible position inside the transaction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnPosition {
    pub node: NodeId,
    pub op: OpId,
    /// The visible op erases the key
    pub erased: bool,
}

fn position_of(
    mgr: &TxnManager,
    idx: &TxnIndex,
    node: NodeId,
    txn_id: Option<TxnId>,
) -> Option<TxnPosition> {
    mgr.find_visible(idx.ops(node), txn_id)
        .map(|(op, erased)| TxnPosition { node, op, erased })
}

/// Exact or approximate lookup; nodes without a visible op are stepped
/// over in the direction of the match.
pub fn find(
    mgr: &TxnManager,
    idx: &TxnIndex,
    key: &[u8],
    flags: FindFlags,
    txn_id: Option<TxnId>,
) -> Option<(TxnPosition, ApproxMatch)> {
    let (node, approx) = idx.get(key, flags)?;
    if let Some(position) = position_of(mgr, idx, node, txn_id) {
        return Some((position, approx));
    }
    // invisible node: keep walking in the direction the flags allow
    match approx {
        ApproxMatch::Exact => {
            if flags.contains(FindFlags::GEQ_MATCH) {
                next(mgr, idx, node, txn_id).map(|p| (p, ApproxMatch::Greater))
            } else if flags.contains(FindFlags::LEQ_MATCH) {
                previous(mgr, idx, node, txn_id).map(|p| (p, ApproxMatch::Lower))
            } else {
                None
            }
        }
        ApproxMatch::Greater => next(mgr, idx, node, txn_id).map(|p| (p, ApproxMatch::Greater)),
        ApproxMatch::Lower => previous(mgr, idx, node, txn_id).map(|p| (p, ApproxMatch::Lower)),
    }
}

/// First visible position.
pub fn first(mgr: &TxnManager, idx: &TxnIndex, txn_id: Option<TxnId>) -> Option<TxnPosition> {
    let mut current = idx.first();
    while let Some(node) = current {
        if let Some(position) = position_of(mgr, idx, node, txn_id) {
            return Some(position);
        }
        current = idx.next_sibling(node);
    }
    None
}

/// Last visible position.
pub fn last(mgr: &TxnManager, idx: &TxnIndex, txn_id: Option<TxnId>) -> Option<TxnPosition> {
    let mut current = idx.last();
    while let Some(node) = current {
        if let Some(position) = position_of(mgr, idx, node, txn_id) {
            return Some(position);
        }
        current = idx.previous_sibling(node);
    }
    None
}

/// Next visible position after `node`.
pub fn next(
    mgr: &TxnManager,
    idx: &TxnIndex,
    node: NodeId,
    txn_id: Option<TxnId>,
) -> Option<TxnPosition> {
    let mut current = idx.next_sibling(node);
    while let Some(n) = current {
        if let Some(position) = position_of(mgr, idx, n, txn_id) {
            return Some(position);
        }
        current = idx.next_sibling(n);
    }
    None
}

/// Previous visible position before `node`.
pub fn previous(
    mgr: &TxnManager,
    idx: &TxnIndex,
    node: NodeId,
    txn_id: Option<TxnId>,
) -> Option<TxnPosition> {
    let mut current = idx.previous_sibling(node);
    while let Some(n) = current {
        if let Some(position) = position_of(mgr, idx, n, txn_id) {
            return Some(position);
        }
        current = idx.previous_sibling(n);
    }
    None
}

/// First visible position at or after `key` (used by merge moves).
pub fn seek_geq(
    mgr: &TxnManager,
    idx: &TxnIndex,
    key: &[u8],
    txn_id: Option<TxnId>,
) -> Option<TxnPosition> {
    find(mgr, idx, key, FindFlags::GEQ_MATCH, txn_id).map(|(p, _)| p)
}

/// Last visible position at or before `key` (used by merge moves).
pub fn seek_leq(
    mgr: &TxnManager,
    idx: &TxnIndex,
    key: &[u8],
    txn_id: Option<TxnId>,
) -> Option<TxnPosition> {
    find(mgr, idx, key, FindFlags::LEQ_MATCH, txn_id).map(|(p, _)| p)
}
