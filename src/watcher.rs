//! The file watcher collaborator contract (spec §6).
//!
//! [`Fragment`](crate::fragment::Fragment) subscribes a healthy mmap's path
//! for "contents changed" notifications through a [`FileWatcher`]. The
//! editor pumps the watcher non-blockingly inside
//! [`Editor::validate_mmaps`](crate::editor::Editor::validate_mmaps); any
//! token reported as changed is handed back to its fragment, which marks
//! itself corrupt (spec §4.1).

use std::fmt;
use std::path::Path;

/// Opaque handle identifying one watched path. Returned by
/// [`FileWatcher::watch`] and passed back to [`FileWatcher::unwatch`].
pub type WatchToken = u64;

/// The external collaborator that watches local paths for content changes
/// and delivers them through a non-blocking pump (spec §6). Any
/// implementation offering these two semantics is acceptable; this crate
/// ships [`NotifyWatcher`] (backed by the `notify` crate) and
/// [`NullWatcher`] (reports nothing, useful in tests that don't exercise
/// corruption).
pub trait FileWatcher: fmt::Debug {
    /// Subscribes to "contents changed" events for `path`, returning a
    /// token to later `unwatch` it. Subscription is hard-link aware: a
    /// modification made through any other name of the same inode is
    /// still observed, because the watch is established against the
    /// inode the path currently resolves to.
    fn watch(&mut self, path: &Path) -> std::io::Result<WatchToken>;

    /// Cancels a subscription. Idempotent: unwatching an already-detached
    /// or unknown token is a no-op.
    fn unwatch(&mut self, token: WatchToken);

    /// Pumps the watcher's event source once, without blocking, and
    /// returns the distinct tokens whose path had a "contents changed"
    /// event pending. Called from
    /// [`Editor::validate_mmaps`](crate::editor::Editor::validate_mmaps).
    fn poll(&mut self) -> Vec<WatchToken>;
}

/// A [`FileWatcher`] that never reports any change. Useful in tests that
/// drive `validate_mmaps` without needing real filesystem events, and as
/// a safe default when corruption detection is not needed.
#[derive(Debug, Default)]
pub struct NullWatcher {
    next_token: WatchToken,
}

impl FileWatcher for NullWatcher {
    fn watch(&mut self, _path: &Path) -> std::io::Result<WatchToken> {
        self.next_token += 1;
        Ok(self.next_token)
    }

    fn unwatch(&mut self, _token: WatchToken) {}

    fn poll(&mut self) -> Vec<WatchToken> {
        Vec::new()
    }
}

/// A [`FileWatcher`] backed by the `notify` crate's recommended
/// platform watcher (inotify on Linux, FSEvents on macOS, ReadDirectoryChangesW
/// on Windows), the same dependency `oxidized` uses for its own
/// file-change detection. Each watched path gets its own subscription;
/// events are buffered on an internal channel and drained on `poll`.
pub struct NotifyWatcher {
    watcher: notify::RecommendedWatcher,
    receiver: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    paths: std::collections::HashMap<WatchToken, std::path::PathBuf>,
    next_token: WatchToken,
}

impl NotifyWatcher {
    /// Creates a new watcher with no active subscriptions.
    pub fn new() -> std::io::Result<Self> {
        use notify::Watcher;

        let (tx, rx) = std::sync::mpsc::channel();
        let watcher = notify::RecommendedWatcher::new(
            move |res| {
                // The channel only disconnects once `NotifyWatcher` itself
                // is dropped, at which point delivering further events is
                // moot.
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(notify_to_io)?;

        Ok(Self {
            watcher,
            receiver: rx,
            paths: std::collections::HashMap::new(),
            next_token: 0,
        })
    }
}

impl fmt::Debug for NotifyWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyWatcher")
            .field("watched", &self.paths.len())
            .finish()
    }
}

impl FileWatcher for NotifyWatcher {
    fn watch(&mut self, path: &Path) -> std::io::Result<WatchToken> {
        use notify::Watcher;

        self.watcher
            .watch(path, notify::RecursiveMode::NonRecursive)
            .map_err(notify_to_io)?;

        self.next_token += 1;
        let token = self.next_token;
        self.paths.insert(token, path.to_path_buf());
        Ok(token)
    }

    fn unwatch(&mut self, token: WatchToken) {
        use notify::Watcher;

        if let Some(path) = self.paths.remove(&token) {
            // Best-effort: the path may already be gone (e.g. renamed
            // aside by our own save pipeline), which is harmless.
            let _ = self.watcher.unwatch(&path);
        }
    }

    fn poll(&mut self) -> Vec<WatchToken> {
        let mut changed = std::collections::HashSet::new();

        while let Ok(result) = self.receiver.try_recv() {
            let Ok(event) = result else { continue };
            if !is_content_change(&event.kind) {
                continue;
            }
            for path in &event.paths {
                for (token, watched) in &self.paths {
                    if watched == path {
                        changed.insert(*token);
                    }
                }
            }
        }

        changed.into_iter().collect()
    }
}

/// Whether a `notify` event kind corresponds to the file's *contents*
/// changing. Other events (creation of unrelated siblings, metadata-only
/// changes, deletion) are ignored, mirroring the spec's "other events are
/// ignored — deletion is harmless while the mapping keeps bytes alive".
fn is_content_change(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Modify(notify::event::ModifyKind::Data(_))
            | notify::EventKind::Modify(notify::event::ModifyKind::Any)
    )
}

fn notify_to_io(err: notify::Error) -> std::io::Error {
    std::io::Error::other(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_watcher_reports_nothing() {
        let mut w = NullWatcher::default();
        let token = w.watch(Path::new("/tmp/does-not-matter")).unwrap();
        assert!(w.poll().is_empty());
        w.unwatch(token);
        assert!(w.poll().is_empty());
    }

    #[test]
    fn notify_watcher_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.txt");
        std::fs::write(&path, b"before").unwrap();

        let mut watcher = NotifyWatcher::new().unwrap();
        let token = watcher.watch(&path).unwrap();

        // Give the platform watcher a moment to register before mutating,
        // and poll a few times since delivery is asynchronous.
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(&path, b"after!").unwrap();

        let mut seen = false;
        for _ in 0..20 {
            if watcher.poll().contains(&token) {
                seen = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(seen, "expected a content-change event for the watched path");

        watcher.unwatch(token);
    }
}
