//! A persistent, byte-indexed buffer engine for editing huge files.
//!
//! *skakun-buffer* represents a file's contents as an immutable,
//! reference-counted treap over byte-range slices ("fragments") of the
//! source data. Opening a file maps it read-only instead of loading
//! it; edits split and merge treap nodes in `O(log n)` without copying
//! untouched bytes. Because nodes are shared (not duplicated) until
//! they need to change, freezing a [`Buffer`] and continuing to edit a
//! thawed copy gives cheap, correct snapshots — the frozen handle keeps
//! reading the bytes it always did.
//!
//! The crate is intentionally single-threaded: all sharing is via `Rc`
//! and interior mutability (`RefCell`/`Cell`), so `Editor` and `Buffer`
//! are `!Send`/`!Sync`. This mirrors how a single editor session
//! actually uses its document model — one thread owns it.
//!
//! # Usage
//!
//! ```no_run
//! use skakun_buffer::{Editor, EditorOptions};
//!
//! let editor = Editor::new(EditorOptions::default());
//! let buffer = editor.open("large-file.txt").unwrap();
//! buffer.insert(0, b"prefix ").unwrap();
//! buffer.save("large-file.txt").unwrap();
//! ```
//!
//! # Errors
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. [`Error`] unifies I/O failures,
//! URI-loader failures, and the buffer engine's own invariants (out of
//! bounds access, writes to a frozen buffer, a save destination with
//! more than one hard link) into one flat taxonomy.
//!
//! # Platform support
//!
//! This crate is Unix-only: the save pipeline relies on directory-fd
//! relative syscalls (`openat`, `fstatat`, `renameat`, `unlinkat`) with
//! no portable Windows equivalent.
//!
//! # Non-goals
//!
//! This crate does not implement text-aware operations (line/column
//! addressing, encoding detection, undo history) — it is the storage
//! layer underneath those, not an editor itself.

#![cfg(unix)]
#![deny(missing_docs)]

mod buffer;
mod editor;
mod error;
mod ext;
mod fragment;
mod iter;
mod node;
mod os;
mod save;
mod uri;
mod watcher;

pub use buffer::Buffer;
pub use editor::{Editor, EditorOptions};
pub use error::{Error, Result};
pub use iter::Iter;
pub use uri::{LoadedBytes, NullUriLoader, UriError, UriLoader, UriWriter};
pub use watcher::{FileWatcher, NotifyWatcher, NullWatcher, WatchToken};
