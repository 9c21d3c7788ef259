//! The persistent, byte-indexed implicit treap (spec §3, §4.2).
//!
//! A [`Node`] is an `Rc` handle to a single slice `[start, end)` of one
//! [`Fragment`], plus up to two children and aggregated subtree
//! [`Stats`]. Nodes are immutable once frozen; any mutator first calls
//! [`Node::thaw`], which performs the shallow copy-on-write and
//! propagates the freeze bit one level down onto the (unchanged)
//! children — "freeze is contagious downward lazily, on first copy of a
//! parent."
//!
//! Every [`Node`] also carries an interned [`NodeId`], assigned from a
//! counter shared through [`NodeCtx`]. The source language keys its copy
//! cache on node pointer identity; Rust gives no equivalent stable
//! pointer hash once `Rc` allocations can be reused, so this crate uses
//! the interned id instead (spec §4.6, §9).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::fragment::Fragment;

pub type NodeId = u64;

/// Shared context a tree of [`Node`]s is built against: the random
/// source for treap priorities, and the id-interning counter. Cloning a
/// `NodeCtx` shares the same counter and RNG (both are `Rc`-backed),
/// which is what lets [`crate::editor::Editor`] hand out one context to
/// every buffer it owns.
#[derive(Clone)]
pub struct NodeCtx {
    rng: Rc<RefCell<StdRng>>,
    next_id: Rc<Cell<NodeId>>,
}

impl NodeCtx {
    pub fn new(seed: u64) -> Self {
        NodeCtx {
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
            next_id: Rc::new(Cell::new(0)),
        }
    }

    fn next_priority(&self) -> u64 {
        self.rng.borrow_mut().gen()
    }

    fn next_id(&self) -> NodeId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Eight lowercase hex digits drawn from the same random source used
    /// for treap priorities, for the save pipeline's side-file naming
    /// convention (spec §6: `.{name}.skak-{xxxxxxxx}`).
    pub(crate) fn random_hex_suffix(&self) -> String {
        let value: u32 = self.rng.borrow_mut().gen();
        format!("{:08x}", value)
    }
}

/// Subtree statistics aggregated at every node: total byte count and
/// whether the subtree reaches a healthy or corrupt mmap fragment
/// (spec §3, §4.2 `update_stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub bytes: usize,
    pub has_healthy_mmap: bool,
    pub has_corrupt_mmap: bool,
}

#[derive(Clone)]
pub struct Node(Rc<NodeInner>);

struct NodeInner {
    id: NodeId,
    fragment: Fragment,
    start: Cell<usize>,
    end: Cell<usize>,
    priority: u64,
    frozen: Cell<bool>,
    left: RefCell<Option<Node>>,
    right: RefCell<Option<Node>>,
    stats: Cell<Stats>,
}

impl Node {
    /// Builds a leaf over `fragment[start..end)`, with no children.
    /// Bounds-checked: `start < end <= fragment.len()`.
    pub fn leaf(ctx: &NodeCtx, fragment: Fragment, start: usize, end: usize) -> Result<Node> {
        if start >= end || end > fragment.len() {
            return Err(Error::OutOfBounds);
        }
        Ok(Self::build(ctx, fragment, start, end, None, None))
    }

    fn build(
        ctx: &NodeCtx,
        fragment: Fragment,
        start: usize,
        end: usize,
        left: Option<Node>,
        right: Option<Node>,
    ) -> Node {
        let node = Node(Rc::new(NodeInner {
            id: ctx.next_id(),
            fragment,
            start: Cell::new(start),
            end: Cell::new(end),
            priority: ctx.next_priority(),
            frozen: Cell::new(false),
            left: RefCell::new(left),
            right: RefCell::new(right),
            stats: Cell::new(Stats::default()),
        }));
        node.update_stats(false);
        node
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn start(&self) -> usize {
        self.0.start.get()
    }

    pub fn end(&self) -> usize {
        self.0.end.get()
    }

    pub fn fragment(&self) -> &Fragment {
        &self.0.fragment
    }

    pub fn left(&self) -> Option<Node> {
        self.0.left.borrow().clone()
    }

    pub fn right(&self) -> Option<Node> {
        self.0.right.borrow().clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub fn stats(&self) -> Stats {
        self.0.stats.get()
    }

    pub fn bytes(&self) -> usize {
        self.0.stats.get().bytes
    }

    pub fn has_healthy_mmap(&self) -> bool {
        self.0.stats.get().has_healthy_mmap
    }

    pub fn has_corrupt_mmap(&self) -> bool {
        self.0.stats.get().has_corrupt_mmap
    }

    /// Marks this node immutable. O(1), non-recursive: children are left
    /// alone until a `thaw` actually needs to touch them.
    pub fn freeze(&self) {
        self.0.frozen.set(true);
    }

    /// Copy-on-write: a non-frozen node returns a cheap `Rc` clone of
    /// itself. A frozen node produces a fresh, unfrozen node holding new
    /// references to the same fragment and the same children — and
    /// marks both children frozen, propagating the freeze one level
    /// down. Priority and id-worthy identity (stats, bounds) are
    /// preserved; the id itself is fresh, since the copy is a genuinely
    /// new value as far as the copy cache is concerned.
    pub fn thaw(&self, ctx: &NodeCtx) -> Node {
        if !self.0.frozen.get() {
            return self.clone();
        }

        if let Some(l) = self.left() {
            l.freeze();
        }
        if let Some(r) = self.right() {
            r.freeze();
        }

        Node(Rc::new(NodeInner {
            id: ctx.next_id(),
            fragment: self.0.fragment.clone(),
            start: Cell::new(self.0.start.get()),
            end: Cell::new(self.0.end.get()),
            priority: self.0.priority,
            frozen: Cell::new(false),
            left: RefCell::new(self.left()),
            right: RefCell::new(self.right()),
            stats: Cell::new(self.0.stats.get()),
        }))
    }

    /// Sets the left child. Only valid on an unfrozen node — callers
    /// must `thaw` first; this is an internal invariant of `merge` and
    /// `split_ref`, not a user-facing error.
    pub fn set_left(&self, child: Option<Node>) {
        debug_assert!(!self.0.frozen.get(), "set_left on a frozen node");
        *self.0.left.borrow_mut() = child;
    }

    /// Sets the right child. See [`Node::set_left`].
    pub fn set_right(&self, child: Option<Node>) {
        debug_assert!(!self.0.frozen.get(), "set_right on a frozen node");
        *self.0.right.borrow_mut() = child;
    }

    /// Recomputes local stats from the fragment's current
    /// healthy/corrupt state and the children's current stats.
    /// `recurse = true` walks the whole subtree bottom-up first; used
    /// after a fragment's provenance changed underneath this tree (load
    /// or corruption).
    pub fn update_stats(&self, recurse: bool) {
        if recurse {
            if let Some(l) = self.left() {
                l.update_stats(true);
            }
            if let Some(r) = self.right() {
                r.update_stats(true);
            }
        }

        let local_len = self.0.end.get() - self.0.start.get();
        let left_stats = self.left().map(|n| n.stats()).unwrap_or_default();
        let right_stats = self.right().map(|n| n.stats()).unwrap_or_default();

        self.0.stats.set(Stats {
            bytes: local_len + left_stats.bytes + right_stats.bytes,
            has_healthy_mmap: self.0.fragment.has_healthy_mmap()
                || left_stats.has_healthy_mmap
                || right_stats.has_healthy_mmap,
            has_corrupt_mmap: self.0.fragment.has_corrupt_mmap()
                || left_stats.has_corrupt_mmap
                || right_stats.has_corrupt_mmap,
        });
    }

    /// Persistent treap merge: `a`'s bytes all precede `b`'s. `O(log|a|
    /// + log|b|)` expected, picking the higher-priority root and
    /// recursing down the appropriate side after thawing it.
    pub fn merge(ctx: &NodeCtx, a: Option<Node>, b: Option<Node>) -> Option<Node> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => {
                if a.0.priority >= b.0.priority {
                    let a = a.thaw(ctx);
                    let right = Node::merge(ctx, a.right(), Some(b));
                    a.set_right(right);
                    a.update_stats(false);
                    Some(a)
                } else {
                    let b = b.thaw(ctx);
                    let left = Node::merge(ctx, Some(a), b.left());
                    b.set_left(left);
                    b.update_stats(false);
                    Some(b)
                }
            }
        }
    }

    /// Splits `n`'s in-order byte sequence at `offset`, returning two
    /// independent trees whose concatenation equals `n`'s sequence
    /// (spec §4.2). `offset` is always relative to `n`'s own subtree.
    pub fn split_ref(ctx: &NodeCtx, n: Node, offset: usize) -> Result<(Option<Node>, Option<Node>)> {
        let total = n.bytes();
        if offset > total {
            return Err(Error::OutOfBounds);
        }
        if offset == 0 {
            return Ok((None, Some(n)));
        }
        if offset == total {
            return Ok((Some(n), None));
        }

        let left_size = n.left().map(|l| l.bytes()).unwrap_or(0);
        let local_len = n.0.end.get() - n.0.start.get();

        if offset <= left_size {
            let left = n.left().expect("offset <= left_size implies a left child");
            let (ll, lr) = Node::split_ref(ctx, left, offset)?;
            let n = n.thaw(ctx);
            n.set_left(lr);
            n.update_stats(false);
            Ok((ll, Some(n)))
        } else if offset < left_size + local_len {
            let local_offset = offset - left_size;
            let new_right = Node::build(
                ctx,
                n.0.fragment.clone(),
                n.0.start.get() + local_offset,
                n.0.end.get(),
                None,
                n.right(),
            );
            let n = n.thaw(ctx);
            n.0.end.set(n.0.start.get() + local_offset);
            n.set_right(None);
            n.update_stats(false);
            Ok((Some(n), Some(new_right)))
        } else {
            let right = n.right().expect("remaining offset implies a right child");
            let (rl, rr) = Node::split_ref(ctx, right, offset - left_size - local_len)?;
            let n = n.thaw(ctx);
            n.set_right(rl);
            n.update_stats(false);
            Ok((Some(n), rr))
        }
    }

    /// In-order copy of up to `dest.len()` bytes starting at `offset`
    /// into `dest`. Returns the number of bytes actually written;
    /// partial reads (when fewer bytes remain than `dest` can hold) are
    /// permitted. Fails if `offset` exceeds this subtree's length.
    pub fn read(&self, offset: usize, dest: &mut [u8]) -> Result<usize> {
        if offset > self.bytes() {
            return Err(Error::OutOfBounds);
        }
        Ok(self.read_from(offset, dest))
    }

    fn read_from(&self, offset: usize, dest: &mut [u8]) -> usize {
        if dest.is_empty() {
            return 0;
        }

        let left_size = self.left().map(|l| l.bytes()).unwrap_or(0);

        if offset < left_size {
            let mut written = match self.left() {
                Some(l) => l.read_from(offset, dest),
                None => 0,
            };
            if written < dest.len() {
                written += self.read_local_then_right(0, &mut dest[written..]);
            }
            return written;
        }

        let local_len = self.0.end.get() - self.0.start.get();
        if offset < left_size + local_len {
            self.read_local_then_right(offset - left_size, dest)
        } else {
            match self.right() {
                Some(r) => r.read_from(offset - left_size - local_len, dest),
                None => 0,
            }
        }
    }

    fn read_local_then_right(&self, local_offset: usize, dest: &mut [u8]) -> usize {
        let local_len = self.0.end.get() - self.0.start.get();
        let mut written = 0;

        if local_offset < local_len {
            let available = local_len - local_offset;
            let n = available.min(dest.len());
            let start = self.0.start.get() + local_offset;
            self.0
                .fragment
                .with_bytes(|bytes| dest[..n].copy_from_slice(&bytes[start..start + n]));
            written += n;
        }

        if written < dest.len() {
            if let Some(r) = self.right() {
                written += r.read_from(0, &mut dest[written..]);
            }
        }

        written
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("range", &(self.0.start.get()..self.0.end.get()))
            .field("frozen", &self.0.frozen.get())
            .field("stats", &self.0.stats.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(ctx: &NodeCtx, s: &str) -> Node {
        Node::leaf(ctx, Fragment::heap(s.as_bytes().to_vec()), 0, s.len()).unwrap()
    }

    fn read_all(n: &Node) -> Vec<u8> {
        let mut buf = vec![0u8; n.bytes()];
        n.read(0, &mut buf).unwrap();
        buf
    }

    #[test]
    fn leaf_rejects_bad_bounds() {
        let ctx = NodeCtx::new(1);
        let frag = Fragment::heap(b"hi".to_vec());
        assert!(matches!(
            Node::leaf(&ctx, frag.clone(), 2, 2),
            Err(Error::OutOfBounds)
        ));
        assert!(matches!(Node::leaf(&ctx, frag, 0, 5), Err(Error::OutOfBounds)));
    }

    #[test]
    fn merge_concatenates_in_order() {
        let ctx = NodeCtx::new(1);
        let a = leaf(&ctx, "hello");
        let b = leaf(&ctx, " world");
        let merged = Node::merge(&ctx, Some(a), Some(b)).unwrap();
        assert_eq!(merged.bytes(), 11);
        assert_eq!(read_all(&merged), b"hello world");
    }

    #[test]
    fn split_then_merge_roundtrips() {
        let ctx = NodeCtx::new(7);
        let a = leaf(&ctx, "hello");
        let b = leaf(&ctx, " world");
        let whole = Node::merge(&ctx, Some(a), Some(b)).unwrap();

        for cut in 0..=whole.bytes() {
            let (l, r) = Node::split_ref(&ctx, whole.clone(), cut).unwrap();
            let mut out = Vec::new();
            if let Some(l) = &l {
                out.extend(read_all(l));
            }
            if let Some(r) = &r {
                out.extend(read_all(r));
            }
            assert_eq!(out, b"hello world");
        }
    }

    #[test]
    fn split_out_of_bounds_errors() {
        let ctx = NodeCtx::new(1);
        let n = leaf(&ctx, "abc");
        assert!(matches!(
            Node::split_ref(&ctx, n, 4),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn stats_bytes_matches_inorder_length() {
        let ctx = NodeCtx::new(42);
        let mut tree = leaf(&ctx, "a");
        for s in ["bb", "ccc", "d", "eeee"] {
            tree = Node::merge(&ctx, Some(tree), Some(leaf(&ctx, s))).unwrap();
        }
        assert_eq!(tree.bytes(), read_all(&tree).len());
    }

    #[test]
    fn thaw_of_unfrozen_node_is_identity_rc_clone() {
        let ctx = NodeCtx::new(3);
        let n = leaf(&ctx, "abc");
        let t = n.thaw(&ctx);
        assert_eq!(n.id(), t.id());
    }

    #[test]
    fn thaw_of_frozen_node_copies_and_propagates_freeze() {
        let ctx = NodeCtx::new(3);
        let a = leaf(&ctx, "hello");
        let b = leaf(&ctx, " world");
        let whole = Node::merge(&ctx, Some(a), Some(b)).unwrap();
        whole.freeze();

        let copy = whole.thaw(&ctx);
        assert_ne!(copy.id(), whole.id());
        assert!(!copy.is_frozen());
        if let Some(l) = copy.left() {
            assert!(l.is_frozen());
        }
        if let Some(r) = copy.right() {
            assert!(r.is_frozen());
        }
        assert_eq!(read_all(&copy), read_all(&whole));
    }

    #[test]
    fn frozen_source_unaffected_by_edits_on_thawed_copy() {
        let ctx = NodeCtx::new(9);
        let frozen = leaf(&ctx, "hello");
        frozen.freeze();

        let copy = frozen.thaw(&ctx);
        let extra = leaf(&ctx, " world");
        let merged = Node::merge(&ctx, Some(copy), Some(extra)).unwrap();

        assert_eq!(read_all(&frozen), b"hello");
        assert_eq!(read_all(&merged), b"hello world");
    }
}
