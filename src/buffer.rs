//! The client-facing editing handle over a treap root (spec §3, §4.3).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::editor::Shared;
use crate::error::{Error, Result};
use crate::fragment::Fragment;
use crate::node::Node;

#[derive(Clone)]
pub struct Buffer(Rc<BufferInner>);

pub(crate) struct BufferInner {
    shared: Rc<Shared>,
    root: RefCell<Option<Node>>,
    frozen: Cell<bool>,
}

/// A non-owning registration handle an [`Editor`](crate::editor::Editor)
/// keeps for each buffer it created, so it can reach live buffers
/// (e.g. to re-aggregate stats after mmap corruption) without
/// prolonging their lifetime — a buffer is destroyed, Rust-idiomatically,
/// by dropping its last `Buffer` handle.
pub(crate) struct WeakBuffer(Weak<BufferInner>);

impl WeakBuffer {
    pub(crate) fn upgrade(&self) -> Option<Buffer> {
        self.0.upgrade().map(Buffer)
    }
}

impl Buffer {
    pub(crate) fn new(shared: Rc<Shared>, root: Option<Node>) -> Buffer {
        Buffer(Rc::new(BufferInner {
            shared,
            root: RefCell::new(root),
            frozen: Cell::new(false),
        }))
    }

    pub(crate) fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Rc::downgrade(&self.0))
    }

    pub(crate) fn root(&self) -> Option<Node> {
        self.0.root.borrow().clone()
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.0.shared
    }

    pub(crate) fn reaggregate_stats(&self) {
        if let Some(root) = self.root() {
            root.update_stats(true);
        }
    }

    pub fn len(&self) -> usize {
        self.root().map(|n| n.bytes()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub fn has_healthy_mmap(&self) -> bool {
        self.root().map(|n| n.has_healthy_mmap()).unwrap_or(false)
    }

    pub fn has_corrupt_mmap(&self) -> bool {
        self.root().map(|n| n.has_corrupt_mmap()).unwrap_or(false)
    }

    pub fn read(&self, offset: usize, dest: &mut [u8]) -> Result<usize> {
        match self.root() {
            Some(root) => root.read(offset, dest),
            None if offset == 0 => Ok(0),
            None => Err(Error::OutOfBounds),
        }
    }

    pub fn insert(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.0.frozen.get() {
            return Err(Error::BufferFrozen);
        }
        if offset > self.len() {
            return Err(Error::OutOfBounds);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let ctx = &self.0.shared.node_ctx;
        let new_node = Node::leaf(ctx, Fragment::heap(bytes.to_vec()), 0, bytes.len())?;

        let new_root = match self.root() {
            None => new_node,
            Some(root) => {
                let (left, right) = Node::split_ref(ctx, root, offset)?;
                Node::merge(ctx, Node::merge(ctx, left, Some(new_node)), right)
                    .expect("merging a freshly-inserted node is never empty")
            }
        };

        *self.0.root.borrow_mut() = Some(new_root);
        Ok(())
    }

    pub fn delete(&self, start: usize, end: usize) -> Result<()> {
        if self.0.frozen.get() {
            return Err(Error::BufferFrozen);
        }
        if start >= end {
            return Ok(());
        }
        if end > self.len() {
            return Err(Error::OutOfBounds);
        }

        let root = self.root().ok_or(Error::OutOfBounds)?;
        let ctx = &self.0.shared.node_ctx;

        let (ab, c) = Node::split_ref(ctx, root, end)?;
        let ab = ab.expect("end > start >= 0 implies a non-empty left part");
        let (a, _b) = Node::split_ref(ctx, ab, start)?;

        *self.0.root.borrow_mut() = Node::merge(ctx, a, c);
        Ok(())
    }

    /// Splices in the slice `[start, end)` of `src` at `offset`. `src`
    /// must belong to the same editor. Consults (and populates) the
    /// shared copy cache keyed on `(src root id, start, end)` so a
    /// repeated copy of the same frozen range is O(log n) instead of
    /// O(range).
    pub fn copy(&self, offset: usize, src: &Buffer, start: usize, end: usize) -> Result<()> {
        if self.0.frozen.get() {
            return Err(Error::BufferFrozen);
        }
        if !Rc::ptr_eq(&self.0.shared, &src.0.shared) {
            return Err(Error::Unexpected(
                "copy requires both buffers to belong to the same editor".into(),
            ));
        }
        if start > end {
            return Err(Error::OutOfBounds);
        }
        if start == end {
            return Ok(());
        }
        if offset > self.len() {
            return Err(Error::OutOfBounds);
        }

        let src_root = src.root().ok_or(Error::OutOfBounds)?;
        if end > src_root.bytes() {
            return Err(Error::OutOfBounds);
        }

        let ctx = self.0.shared.node_ctx.clone();
        let key = (src_root.id(), start, end);

        let middle = {
            let cached = self.0.shared.copy_cache.borrow().get(&key).cloned();
            match cached {
                Some(hit) => hit,
                None => {
                    src_root.freeze();
                    let (ab, c) = Node::split_ref(&ctx, src_root, end)?;
                    let ab = ab.expect("end > 0 implies a non-empty left part");
                    let (_a, b) = Node::split_ref(&ctx, ab, start)?;
                    let middle = b.expect("start < end implies a non-empty middle part");
                    middle.freeze();
                    self.0
                        .shared
                        .copy_cache
                        .borrow_mut()
                        .insert(key, middle.clone());
                    middle
                }
            }
        };

        let new_root = match self.root() {
            None => middle,
            Some(root) => {
                let (left, right) = Node::split_ref(&ctx, root, offset)?;
                Node::merge(&ctx, Node::merge(&ctx, left, Some(middle)), right)
                    .expect("merging a non-empty payload is never empty")
            }
        };

        *self.0.root.borrow_mut() = Some(new_root);
        Ok(())
    }

    /// Recursively promotes every healthy mmap leaf in this buffer's
    /// tree to a heap allocation; corrupt mmaps are left untouched.
    pub fn load(&self) -> Result<()> {
        if let Some(root) = self.root() {
            Self::load_subtree(&self.0.shared, &root)?;
        }
        Ok(())
    }

    fn load_subtree(shared: &Shared, node: &Node) -> Result<()> {
        if let Some(l) = node.left() {
            Self::load_subtree(shared, &l)?;
        }
        if let Some(r) = node.right() {
            Self::load_subtree(shared, &r)?;
        }

        let fragment = node.fragment();
        let token = fragment.watch_token();
        if fragment.load()? {
            if let Some(token) = token {
                shared.unwatch(token);
            }
        }

        node.update_stats(false);
        Ok(())
    }

    /// Marks this buffer (and, eagerly but non-recursively, its current
    /// root) immutable. Children are frozen lazily, only on the first
    /// `thaw` that actually needs to touch them.
    pub fn freeze(&self) {
        self.0.frozen.set(true);
        if let Some(root) = self.root() {
            root.freeze();
        }
    }

    /// A non-frozen buffer returns a cheap handle clone of itself. A
    /// frozen buffer produces a fresh, independently-registered buffer
    /// sharing the same root — edits on it never affect bytes read
    /// through the original, frozen handle.
    pub fn thaw(&self) -> Buffer {
        if !self.0.frozen.get() {
            return self.clone();
        }
        Buffer(Rc::new(BufferInner {
            shared: self.0.shared.clone(),
            root: RefCell::new(self.root()),
            frozen: Cell::new(false),
        }))
    }

    /// Writes this buffer's bytes to `path`, using the rename-aside
    /// protocol when `path` is currently mmapped by this editor (spec
    /// §4.5).
    pub fn save(&self, path: &str) -> Result<()> {
        crate::save::save(self, path)
    }

    /// Returns a byte cursor positioned at `offset`, steppable forward
    /// and backward one byte at a time (spec §4.7).
    pub fn iter(&self, offset: usize) -> Result<crate::iter::Iter> {
        crate::iter::Iter::new(self, offset)
    }

    pub(crate) fn for_each_leaf(&self, mut f: impl FnMut(&Node)) {
        if let Some(root) = self.root() {
            Self::walk(&root, &mut f);
        }
    }

    fn walk(node: &Node, f: &mut impl FnMut(&Node)) {
        if let Some(l) = node.left() {
            Self::walk(&l, f);
        }
        f(node);
        if let Some(r) = node.right() {
            Self::walk(&r, f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{Editor, EditorOptions};

    fn editor() -> Editor {
        Editor::new(EditorOptions {
            seed: 123,
            ..EditorOptions::default()
        })
    }

    fn read_all(buf: &Buffer) -> Vec<u8> {
        let mut out = vec![0u8; buf.len()];
        buf.read(0, &mut out).unwrap();
        out
    }

    #[test]
    fn insert_into_empty_buffer_then_delete_restores_it() {
        let editor = editor();
        let buf = editor.new_empty_buffer();

        buf.insert(0, b"hello").unwrap();
        assert_eq!(read_all(&buf), b"hello");

        buf.delete(0, 5).unwrap();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn insert_out_of_bounds_on_empty_buffer_fails() {
        let editor = editor();
        let buf = editor.new_empty_buffer();
        assert!(matches!(buf.insert(1, b"x"), Err(Error::OutOfBounds)));
    }

    #[test]
    fn delete_no_op_when_start_equals_end() {
        let editor = editor();
        let buf = editor.new_empty_buffer();
        buf.insert(0, b"abc").unwrap();
        buf.delete(1, 1).unwrap();
        assert_eq!(read_all(&buf), b"abc");
    }

    #[test]
    fn delete_past_end_fails() {
        let editor = editor();
        let buf = editor.new_empty_buffer();
        buf.insert(0, b"abc").unwrap();
        assert!(matches!(buf.delete(0, 4), Err(Error::OutOfBounds)));
    }

    #[test]
    fn frozen_buffer_rejects_mutators() {
        let editor = editor();
        let buf = editor.new_empty_buffer();
        buf.insert(0, b"abc").unwrap();
        buf.freeze();

        assert!(matches!(buf.insert(0, b"x"), Err(Error::BufferFrozen)));
        assert!(matches!(buf.delete(0, 1), Err(Error::BufferFrozen)));
    }

    #[test]
    fn persistent_snapshot_scenario() {
        let editor = editor();
        let buf = editor.new_empty_buffer();
        buf.insert(0, b"hello").unwrap();

        buf.freeze();
        let writable = buf.thaw();
        writable.insert(5, b" world").unwrap();

        assert_eq!(read_all(&buf), b"hello");
        assert_eq!(read_all(&writable), b"hello world");
    }

    #[test]
    fn copy_requires_same_editor() {
        let e1 = editor();
        let e2 = editor();
        let src = e1.new_empty_buffer();
        src.insert(0, b"hello").unwrap();
        let dst = e2.new_empty_buffer();

        assert!(dst.copy(0, &src, 0, 5).is_err());
    }

    #[test]
    fn copy_splices_source_range_without_mutating_source() {
        let editor = editor();
        let src = editor.new_empty_buffer();
        src.insert(0, b"hello world").unwrap();

        let dst = editor.new_empty_buffer();
        dst.insert(0, b"XY").unwrap();
        dst.copy(1, &src, 0, 5).unwrap();

        assert_eq!(read_all(&dst), b"XhelloY");
        assert_eq!(read_all(&src), b"hello world");
    }

    #[test]
    fn repeated_copy_of_same_range_hits_cache() {
        let editor = editor();
        let src = editor.new_empty_buffer();
        src.insert(0, b"hello world").unwrap();

        let dst = editor.new_empty_buffer();
        dst.copy(0, &src, 0, 5).unwrap();
        dst.copy(dst.len(), &src, 0, 5).unwrap();

        assert_eq!(read_all(&dst), b"hellohello");
    }
}
