//! Transaction index: an in-memory red-black tree of pending operations.
//!
//! Each database owns one index; nodes are keyed by the user key under
//! the database's comparator and hold the chronological list of pending
//! operations on that key. Nodes live in an arena and are addressed by
//! index, so there are no back-pointers to chase or leak.

use std::cmp::Ordering;

use crate::types::{ApproxMatch, CompareFn, FindFlags};

/// Arena index of a node.
pub type NodeId = u32;

const NIL: NodeId = u32::MAX;

struct RbNode {
    key: Vec<u8>,
    red: bool,
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    /// Chronological op list, oldest first; ops are ids into the
    /// transaction manager's arena.
    ops: Vec<u64>,
}

/// The per-database tree of [`TxnNode`]s (see `txn::TxnOperation`).
pub struct TxnIndex {
    nodes: Vec<RbNode>,
    root: NodeId,
    cmp: CompareFn,
}

impl TxnIndex {
    pub fn new(cmp: CompareFn) -> Self {
        TxnIndex {
            nodes: Vec::new(),
            root: NIL,
            cmp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn key(&self, id: NodeId) -> &[u8] {
        &self.nodes[id as usize].key
    }

    pub fn ops(&self, id: NodeId) -> &[u64] {
        &self.nodes[id as usize].ops
    }

    pub fn push_op(&mut self, id: NodeId, op: u64) {
        self.nodes[id as usize].ops.push(op);
    }

    pub fn remove_op(&mut self, id: NodeId, op: u64) {
        self.nodes[id as usize].ops.retain(|&o| o != op);
    }

    /// The chronologically newest op on this key.
    pub fn newest_op(&self, id: NodeId) -> Option<u64> {
        self.nodes[id as usize].ops.last().copied()
    }

    /// Total number of pending ops across all nodes.
    pub fn total_ops(&self) -> usize {
        self.nodes.iter().map(|n| n.ops.len()).sum()
    }

    /// Drop all nodes. Only legal once every op has been released.
    pub fn clear(&mut self) {
        debug_assert_eq!(self.total_ops(), 0);
        self.nodes.clear();
        self.root = NIL;
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    fn find_exact(&self, key: &[u8]) -> Option<NodeId> {
        let mut current = self.root;
        while current != NIL {
            let node = &self.nodes[current as usize];
            match (self.cmp)(key, &node.key) {
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
                Ordering::Equal => return Some(current),
            }
        }
        None
    }

    /// First node with key >= `key`.
    fn lower_bound(&self, key: &[u8]) -> Option<NodeId> {
        let mut current = self.root;
        let mut candidate = None;
        while current != NIL {
            let node = &self.nodes[current as usize];
            match (self.cmp)(&node.key, key) {
                Ordering::Less => current = node.right,
                _ => {
                    candidate = Some(current);
                    current = node.left;
                }
            }
        }
        candidate
    }

    /// Exact or approximate lookup following the find flags.
    pub fn get(&self, key: &[u8], flags: FindFlags) -> Option<(NodeId, ApproxMatch)> {
        let exact = self.find_exact(key);

        if let Some(id) = exact {
            if flags.contains(FindFlags::LT_MATCH) {
                return self.previous_sibling(id).map(|p| (p, ApproxMatch::Lower));
            }
            if flags.contains(FindFlags::GT_MATCH) {
                return self.next_sibling(id).map(|n| (n, ApproxMatch::Greater));
            }
            return Some((id, ApproxMatch::Exact));
        }
        if !flags.is_approximate() {
            return None;
        }

        let geq = self.lower_bound(key);
        if flags.intersects(FindFlags::GT_MATCH | FindFlags::GEQ_MATCH) {
            if let Some(id) = geq {
                return Some((id, ApproxMatch::Greater));
            }
            if !flags.intersects(FindFlags::LT_MATCH | FindFlags::LEQ_MATCH) {
                return None;
            }
        }
        // the LT/LEQ candidate is the node before the lower bound
        let lt = match geq {
            Some(id) => self.previous_sibling(id),
            None => self.last(),
        };
        lt.map(|id| (id, ApproxMatch::Lower))
    }

    pub fn first(&self) -> Option<NodeId> {
        if self.root == NIL {
            return None;
        }
        Some(self.minimum(self.root))
    }

    pub fn last(&self) -> Option<NodeId> {
        if self.root == NIL {
            return None;
        }
        Some(self.maximum(self.root))
    }

    /// In-order successor.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id as usize];
        if node.right != NIL {
            return Some(self.minimum(node.right));
        }
        let mut current = id;
        let mut parent = node.parent;
        while parent != NIL && self.nodes[parent as usize].right == current {
            current = parent;
            parent = self.nodes[parent as usize].parent;
        }
        if parent == NIL {
            None
        } else {
            Some(parent)
        }
    }

    /// In-order predecessor.
    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id as usize];
        if node.left != NIL {
            return Some(self.maximum(node.left));
        }
        let mut current = id;
        let mut parent = node.parent;
        while parent != NIL && self.nodes[parent as usize].left == current {
            current = parent;
            parent = self.nodes[parent as usize].parent;
        }
        if parent == NIL {
            None
        } else {
            Some(parent)
        }
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while self.nodes[id as usize].left != NIL {
            id = self.nodes[id as usize].left;
        }
        id
    }

    fn maximum(&self, mut id: NodeId) -> NodeId {
        while self.nodes[id as usize].right != NIL {
            id = self.nodes[id as usize].right;
        }
        id
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// The node for `key`, created if absent.
    pub fn store(&mut self, key: &[u8]) -> NodeId {
        let mut parent = NIL;
        let mut current = self.root;
        while current != NIL {
            parent = current;
            let node = &self.nodes[current as usize];
            match (self.cmp)(key, &node.key) {
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
                Ordering::Equal => return current,
            }
        }

        let id = self.nodes.len() as NodeId;
        self.nodes.push(RbNode {
            key: key.to_vec(),
            red: true,
            parent,
            left: NIL,
            right: NIL,
            ops: Vec::new(),
        });

        if parent == NIL {
            self.root = id;
        } else if (self.cmp)(key, &self.nodes[parent as usize].key) == Ordering::Less {
            self.nodes[parent as usize].left = id;
        } else {
            self.nodes[parent as usize].right = id;
        }

        self.insert_fixup(id);
        id
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while z != self.root && self.is_red(self.parent_of(z)) {
            let parent = self.parent_of(z);
            let grand = self.parent_of(parent);
            if parent == self.nodes[grand as usize].left {
                let uncle = self.nodes[grand as usize].right;
                if self.is_red(uncle) {
                    self.set_red(parent, false);
                    self.set_red(uncle, false);
                    self.set_red(grand, true);
                    z = grand;
                } else {
                    if z == self.nodes[parent as usize].right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.parent_of(z);
                    let grand = self.parent_of(parent);
                    self.set_red(parent, false);
                    self.set_red(grand, true);
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.nodes[grand as usize].left;
                if self.is_red(uncle) {
                    self.set_red(parent, false);
                    self.set_red(uncle, false);
                    self.set_red(grand, true);
                    z = grand;
                } else {
                    if z == self.nodes[parent as usize].left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.parent_of(z);
                    let grand = self.parent_of(parent);
                    self.set_red(parent, false);
                    self.set_red(grand, true);
                    self.rotate_left(grand);
                }
            }
        }
        let root = self.root;
        self.set_red(root, false);
    }

    fn is_red(&self, id: NodeId) -> bool {
        id != NIL && self.nodes[id as usize].red
    }

    fn set_red(&mut self, id: NodeId, red: bool) {
        if id != NIL {
            self.nodes[id as usize].red = red;
        }
    }

    fn parent_of(&self, id: NodeId) -> NodeId {
        if id == NIL {
            NIL
        } else {
            self.nodes[id as usize].parent
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.nodes[x as usize].right;
        let y_left = self.nodes[y as usize].left;
        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].left == x {
            self.nodes[x_parent as usize].left = y;
        } else {
            self.nodes[x_parent as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.nodes[x as usize].left;
        let y_right = self.nodes[y as usize].right;
        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].left == x {
            self.nodes[x_parent as usize].left = y;
        } else {
            self.nodes[x_parent as usize].right = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
    }
}
