//! The process-wide registry tying fragments, buffers, the copy cache,
//! and the collaborator contracts (watcher, URI loader) together (spec
//! §3, §4.4).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::{Rc, Weak};

use rand::Rng;

use crate::buffer::{Buffer, WeakBuffer};
use crate::error::Result;
use crate::fragment::Fragment;
use crate::node::{Node, NodeCtx, NodeId};
use crate::os;
use crate::uri::{NullUriLoader, UriLoader};
use crate::watcher::{FileWatcher, NullWatcher, WatchToken};

/// Tunables and injected collaborators for an [`Editor`]. The defaults
/// (100 MB open threshold, a randomly-seeded RNG, no-op watcher and URI
/// loader) match a headless/no-collaborator embedding; real embedders
/// override `watcher` and `uri_loader`.
pub struct EditorOptions {
    pub max_open_size: u64,
    pub seed: u64,
    pub watcher: Box<dyn FileWatcher>,
    pub uri_loader: Box<dyn UriLoader>,
}

impl Default for EditorOptions {
    fn default() -> Self {
        EditorOptions {
            max_open_size: 100_000_000,
            seed: rand::thread_rng().gen(),
            watcher: Box::new(NullWatcher::default()),
            uri_loader: Box::new(NullUriLoader),
        }
    }
}

/// State shared between an [`Editor`] and every [`Buffer`] it has
/// created. Kept alive by whichever of them is dropped last — if a
/// `Buffer` outlives its `Editor`, the shared registries (and the
/// moved-aside cleanup in [`Drop`]) stay valid until that buffer goes
/// too, rather than being torn down out from under it.
pub(crate) struct Shared {
    pub(crate) node_ctx: NodeCtx,
    pub(crate) copy_cache: RefCell<HashMap<(NodeId, usize, usize), Node>>,
    pub(crate) watcher: RefCell<Box<dyn FileWatcher>>,
    pub(crate) uri_loader: Box<dyn UriLoader>,
    pub(crate) mmaps: RefCell<HashMap<WatchToken, Fragment>>,
    pub(crate) moved_aside: RefCell<Vec<(RawFd, OsString)>>,
}

impl Shared {
    /// Unwatches `token` and drops its mmap-list registration. Centralized
    /// here so the load (promotion) and corruption paths can't forget one
    /// half of the pair.
    pub(crate) fn unwatch(&self, token: WatchToken) {
        self.watcher.borrow_mut().unwatch(token);
        self.mmaps.borrow_mut().remove(&token);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (dir_fd, name) in self.moved_aside.borrow_mut().drain(..) {
            tracing::trace!(side = %name.to_string_lossy(), "teardown unlink started");
            let _ = os::unlinkat(dir_fd, &name);
            let _ = os::close(dir_fd);
        }
    }
}

pub struct Editor {
    shared: Rc<Shared>,
    max_open_size: Cell<u64>,
    buffers: RefCell<Vec<WeakBuffer>>,
}

impl Editor {
    pub fn new(options: EditorOptions) -> Editor {
        Editor {
            shared: Rc::new(Shared {
                node_ctx: NodeCtx::new(options.seed),
                copy_cache: RefCell::new(HashMap::new()),
                watcher: RefCell::new(options.watcher),
                uri_loader: options.uri_loader,
                mmaps: RefCell::new(HashMap::new()),
                moved_aside: RefCell::new(Vec::new()),
            }),
            max_open_size: Cell::new(options.max_open_size),
            buffers: RefCell::new(Vec::new()),
        }
    }

    pub fn max_open_size(&self) -> u64 {
        self.max_open_size.get()
    }

    pub fn set_max_open_size(&self, bytes: u64) {
        self.max_open_size.set(bytes);
    }

    /// Opens `path` (a local filesystem path, or a URI the configured
    /// loader recognizes) as a new buffer (spec §4.4).
    pub fn open(&self, path: &str) -> Result<Buffer> {
        tracing::trace!(path, "buffer open started");
        if self.shared.uri_loader.is_uri(path) {
            let loaded = self.shared.uri_loader.load(path)?;
            let fragment = Fragment::foreign(loaded);
            return self.buffer_from_fragment(fragment);
        }

        let fs_path = Path::new(path);
        let metadata = std::fs::metadata(fs_path)?;
        let size = metadata.len();

        if size == 0 {
            return Ok(self.new_buffer(None));
        }

        let fragment = if size <= self.max_open_size.get() {
            Fragment::heap(std::fs::read(fs_path)?)
        } else {
            let fragment = {
                let mut watcher = self.shared.watcher.borrow_mut();
                Fragment::open_mmap(fs_path, &mut **watcher)?
            };
            if let Some(token) = fragment.watch_token() {
                self.shared.mmaps.borrow_mut().insert(token, fragment.clone());
            }
            fragment
        };

        self.buffer_from_fragment(fragment)
    }

    fn buffer_from_fragment(&self, fragment: Fragment) -> Result<Buffer> {
        let len = fragment.len();
        let root = if len == 0 {
            None
        } else {
            Some(Node::leaf(&self.shared.node_ctx, fragment, 0, len)?)
        };
        Ok(self.new_buffer(root))
    }

    fn new_buffer(&self, root: Option<Node>) -> Buffer {
        let buffer = Buffer::new(self.shared.clone(), root);
        self.buffers.borrow_mut().push(buffer.downgrade());
        buffer
    }

    /// Creates a new, empty buffer not backed by any file.
    pub fn new_empty_buffer(&self) -> Buffer {
        self.new_buffer(None)
    }

    /// Pumps the file watcher once, non-blocking. Any token reported as
    /// changed is matched against the editor's live mmap fragments,
    /// unwatched, and marked corrupt; every live buffer's stats (and
    /// every cached copy-slice node's stats) are then re-aggregated.
    /// Returns whether any corruption was found during this pump.
    pub fn validate_mmaps(&self) -> bool {
        let tokens = self.shared.watcher.borrow_mut().poll();
        if tokens.is_empty() {
            return false;
        }

        let mut corrupted = false;
        for token in tokens {
            let fragment = self.shared.mmaps.borrow().get(&token).cloned();
            let Some(fragment) = fragment else { continue };
            self.shared.unwatch(token);
            if fragment.mark_corrupt().is_ok() {
                corrupted = true;
            }
        }

        if corrupted {
            self.buffers.borrow_mut().retain(|w| w.upgrade().is_some());
            for weak in self.buffers.borrow().iter() {
                if let Some(buffer) = weak.upgrade() {
                    buffer.reaggregate_stats();
                }
            }
            for node in self.shared.copy_cache.borrow().values() {
                node.update_stats(true);
            }
        }

        corrupted
    }

    /// Releases every cached copy-slice node.
    pub fn clear_copy_cache(&self) {
        self.shared.copy_cache.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor_with_seed(seed: u64, max_open_size: u64) -> Editor {
        Editor::new(EditorOptions {
            max_open_size,
            seed,
            ..EditorOptions::default()
        })
    }

    #[test]
    fn opening_zero_byte_file_yields_empty_buffer_with_null_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let editor = editor_with_seed(1, 100_000_000);
        let buf = editor.open(path.to_str().unwrap()).unwrap();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn small_file_opens_as_heap_backed_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let editor = editor_with_seed(1, 100_000_000);
        let buf = editor.open(path.to_str().unwrap()).unwrap();
        assert_eq!(buf.len(), 11);
        assert!(!buf.has_healthy_mmap());

        let mut out = vec![0u8; 11];
        buf.read(0, &mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn large_file_opens_as_mmap_backed_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, vec![b'A'; 100]).unwrap();

        let editor = editor_with_seed(1, 10);
        let buf = editor.open(path.to_str().unwrap()).unwrap();
        assert!(buf.has_healthy_mmap());
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn mmap_corruption_scenario() {
        use crate::watcher::NotifyWatcher;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, vec![b'A'; 100]).unwrap();

        let editor = Editor::new(EditorOptions {
            max_open_size: 10,
            seed: 1,
            watcher: Box::new(NotifyWatcher::new().unwrap()),
            ..EditorOptions::default()
        });
        let buf = editor.open(path.to_str().unwrap()).unwrap();
        assert!(buf.has_healthy_mmap());

        let mut before = vec![0u8; 100];
        buf.read(0, &mut before).unwrap();
        assert_eq!(before, vec![b'A'; 100]);

        // Give the platform watcher a moment to register before mutating.
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(&path, vec![b'B'; 100]).unwrap();

        let mut corrupted = false;
        for _ in 0..20 {
            if editor.validate_mmaps() {
                corrupted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(corrupted, "expected validate_mmaps to observe the rewrite");
        assert!(buf.has_corrupt_mmap());

        let mut after = vec![0u8; 100];
        buf.read(0, &mut after).unwrap();
        assert_eq!(after, vec![0u8; 100]);
    }
}
