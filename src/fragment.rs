//! Immutable, reference-counted byte regions tagged by allocator
//! provenance (spec §3, §4.1).
//!
//! A [`Fragment`] is cheap to clone (it is an `Rc` handle) and its byte
//! content never changes identity once constructed — the one exception
//! being an mmap fragment, whose provenance tag mutates in place on
//! [`Fragment::load`] (promotion to heap) or on corruption (pages
//! replaced by an anonymous zero mapping at the same address). Both
//! paths are owned by this module; [`crate::node`] only ever reads
//! through [`Fragment::with_bytes`].

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::ext::ResultExt;
use crate::os;
use crate::uri::LoadedBytes;
use crate::watcher::{FileWatcher, WatchToken};

#[derive(Clone)]
pub struct Fragment(Rc<FragmentInner>);

struct FragmentInner {
    bytes: RefCell<Bytes>,
}

enum Bytes {
    Heap(Box<[u8]>),
    Foreign(Box<[u8]>),
    Mmap(MmapBytes),
}

struct MmapBytes {
    ptr: NonNull<u8>,
    len: usize,
    fd: RawFd,
    dev: u64,
    ino: u64,
    is_corrupt: bool,
    watch: Option<WatchToken>,
}

impl Bytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Heap(b) => b,
            Bytes::Foreign(b) => b,
            // SAFETY: ptr/len describe a mapping owned for the lifetime
            // of this Bytes value; dropping it unmaps them (see below).
            Bytes::Mmap(m) => unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) },
        }
    }
}

impl Drop for Bytes {
    fn drop(&mut self) {
        if let Bytes::Mmap(m) = self {
            let _ = os::unmap(m.ptr, m.len);
            let _ = os::close(m.fd);
        }
    }
}

impl Fragment {
    /// Wraps an owned, heap-allocated byte buffer (`insert`'s payload,
    /// and the promoted form of a loaded mmap fragment).
    pub fn heap(data: Vec<u8>) -> Fragment {
        Fragment(Rc::new(FragmentInner {
            bytes: RefCell::new(Bytes::Heap(data.into_boxed_slice())),
        }))
    }

    /// Wraps bytes obtained from a [`UriLoader`](crate::uri::UriLoader).
    pub fn foreign(data: LoadedBytes) -> Fragment {
        Fragment(Rc::new(FragmentInner {
            bytes: RefCell::new(Bytes::Foreign(data.into_vec().into_boxed_slice())),
        }))
    }

    /// Opens `path`, maps it read-only, and subscribes `watcher` to its
    /// contents changing. Fails closed: if the watch subscription fails,
    /// the mapping and descriptor are released before returning the
    /// error (spec §4.1).
    pub fn open_mmap(path: &Path, watcher: &mut dyn FileWatcher) -> Result<Fragment> {
        tracing::trace!(path = %path.display(), "mmap open started");
        let fd = os::open_readonly(path)?;
        let stat = os::fstat(fd).cleanup(|| {
            let _ = os::close(fd);
        })?;

        let len = stat.size as usize;
        let ptr = os::map_readonly(fd, len).cleanup(|| {
            let _ = os::close(fd);
        })?;

        let token = watcher.watch(path).cleanup(|| {
            let _ = os::unmap(ptr, len);
            let _ = os::close(fd);
        })?;

        tracing::trace!(fd, len, "mmap open finished");
        Ok(Fragment(Rc::new(FragmentInner {
            bytes: RefCell::new(Bytes::Mmap(MmapBytes {
                ptr,
                len,
                fd,
                dev: stat.dev,
                ino: stat.ino,
                is_corrupt: false,
                watch: Some(token),
            })),
        })))
    }

    /// Number of bytes in this fragment.
    pub fn len(&self) -> usize {
        self.0.bytes.borrow().as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the fragment's current bytes. Held only for the
    /// duration of the call — no long-lived borrows escape, so this is
    /// safe to call from `Node::read` even though `load`/`mark_corrupt`
    /// may later mutate this same fragment in place.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.0.bytes.borrow().as_slice())
    }

    /// `(dev, ino)` if this is (or was, before promotion) a mapped file.
    pub fn dev_ino(&self) -> Option<(u64, u64)> {
        match &*self.0.bytes.borrow() {
            Bytes::Mmap(m) => Some((m.dev, m.ino)),
            _ => None,
        }
    }

    /// The watcher token registered for this fragment, if any. The
    /// caller (the editor) is responsible for unwatching it before the
    /// fragment's mapping goes away, since `Fragment` does not itself
    /// hold a `&mut dyn FileWatcher`.
    pub fn watch_token(&self) -> Option<WatchToken> {
        match &*self.0.bytes.borrow() {
            Bytes::Mmap(m) => m.watch,
            _ => None,
        }
    }

    /// Whether this fragment is currently a mapping whose contents are
    /// trusted.
    pub fn has_healthy_mmap(&self) -> bool {
        matches!(&*self.0.bytes.borrow(), Bytes::Mmap(m) if !m.is_corrupt)
    }

    /// Whether this fragment is currently a mapping whose contents have
    /// been replaced by zero pages after an external change.
    pub fn has_corrupt_mmap(&self) -> bool {
        matches!(&*self.0.bytes.borrow(), Bytes::Mmap(m) if m.is_corrupt)
    }

    /// Replaces this fragment's mapped pages in place with an anonymous,
    /// read-only, zero-filled mapping of the same length at the same
    /// address, and marks it corrupt. A no-op if already corrupt, or if
    /// this fragment isn't a mapping. The caller must have already
    /// unwatched this fragment's token (spec §4.1: "atomically detach
    /// and release the watcher").
    pub fn mark_corrupt(&self) -> Result<()> {
        let mut bytes = self.0.bytes.borrow_mut();
        if let Bytes::Mmap(m) = &mut *bytes {
            if m.is_corrupt {
                return Ok(());
            }
            // SAFETY: ptr/len describe this fragment's own live mapping,
            // and nothing else maps over the same address range.
            unsafe { os::remap_zero_fixed(m.ptr, m.len)? };
            m.is_corrupt = true;
            m.watch = None;
            tracing::warn!(dev = m.dev, ino = m.ino, "mmap marked corrupt after external change");
        }
        Ok(())
    }

    /// Promotes a healthy mmap fragment to a heap allocation: advises
    /// sequential access, copies the mapped bytes, unmaps the old
    /// pages, and mutates the provenance tag in place. Returns whether
    /// a promotion happened (callers use this to decide whether to
    /// re-aggregate stats). A corrupt mmap, or a fragment that is
    /// already Heap/Foreign, is a no-op returning `false`.
    ///
    /// As with `mark_corrupt`, the caller must unwatch this fragment's
    /// token (obtained via `watch_token` before calling this) itself.
    pub fn load(&self) -> Result<bool> {
        let mut bytes = self.0.bytes.borrow_mut();
        let promote = match &*bytes {
            Bytes::Mmap(m) if !m.is_corrupt => true,
            _ => false,
        };
        if !promote {
            return Ok(false);
        }

        let Bytes::Mmap(m) = &*bytes else {
            unreachable!("checked above")
        };
        os::advise_sequential(m.ptr, m.len)?;
        let mut copy = vec![0u8; m.len];
        // SAFETY: ptr/len describe the live mapping being promoted, and
        // it is not torn down until after this copy completes.
        copy.copy_from_slice(unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) });
        os::unmap(m.ptr, m.len)?;
        os::close(m.fd)?;

        let len = copy.len();
        *bytes = Bytes::Heap(copy.into_boxed_slice());
        tracing::debug!(len, "mmap promoted to heap");
        Ok(true)
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.bytes.borrow();
        let kind = match &*bytes {
            Bytes::Heap(_) => "Heap",
            Bytes::Foreign(_) => "Foreign",
            Bytes::Mmap(m) if m.is_corrupt => "Mmap(corrupt)",
            Bytes::Mmap(_) => "Mmap",
        };
        f.debug_struct("Fragment")
            .field("kind", &kind)
            .field("len", &bytes.as_slice().len())
            .finish()
    }
}
