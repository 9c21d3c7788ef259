//! The rename-aside save pipeline (spec §4.5).
//!
//! Writing a buffer to a path that is itself mmapped by this editor
//! must never corrupt the bytes a live buffer reads through that
//! mapping. When the destination collides with a tracked mmap, the
//! existing file is renamed to a uniquely-named sibling first — the
//! mapping keeps addressing that inode under its new name — and a new
//! file is created at the original name to receive the write.

use std::ffi::OsString;
use std::path::Path;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::ext::ResultExt;
use crate::node::Node;
use crate::os;

pub(crate) fn save(buffer: &Buffer, path: &str) -> Result<()> {
    let shared = buffer.shared().clone();

    if shared.uri_loader.is_uri(path) {
        return shared
            .uri_loader
            .replace(path, &mut |writer| {
                stream(buffer, &mut |chunk| writer.write_all(chunk))
            })
            .map_err(Error::from);
    }

    let fs_path = Path::new(path);
    match std::fs::symlink_metadata(fs_path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => create_exclusive(buffer, fs_path),
        Err(err) => Err(err.into()),
        Ok(_) => save_existing(buffer, fs_path),
    }
}

/// Destination doesn't exist yet: just create and stream.
fn create_exclusive(buffer: &Buffer, path: &Path) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    stream(buffer, &mut |chunk| file.write_all(chunk))?;
    file.flush()?;
    Ok(())
}

/// Destination exists: resolve it TOCTOU-safely relative to its
/// directory's fd, check whether it collides with a tracked mmap, and
/// either stream in place or rename-aside first.
fn save_existing(buffer: &Buffer, path: &Path) -> Result<()> {
    let canonical = std::fs::canonicalize(path)?;
    let dir = canonical
        .parent()
        .ok_or_else(|| Error::Unexpected("path has no parent directory".into()))?;
    let name = canonical
        .file_name()
        .ok_or_else(|| Error::Unexpected("path has no file name".into()))?;

    let dir_fd = os::open_dir(dir)?;
    let stat = os::fstatat(dir_fd, name).cleanup(|| {
        let _ = os::close(dir_fd);
    })?;

    let shared = buffer.shared().clone();
    let collides = shared
        .mmaps
        .borrow()
        .values()
        .any(|f| f.dev_ino() == Some((stat.dev, stat.ino)));

    if !collides {
        os::close(dir_fd)?;
        return create_truncate(buffer, &canonical);
    }

    if stat.nlink > 1 {
        os::close(dir_fd)?;
        return Err(Error::MultipleHardLinks);
    }

    let side_name = OsString::from(format!(
        ".{}.skak-{}",
        name.to_string_lossy(),
        shared.node_ctx.random_hex_suffix()
    ));

    tracing::trace!(name = %name.to_string_lossy(), side = %side_name.to_string_lossy(), "rename-aside started");
    os::renameat_same_dir(dir_fd, name, &side_name).cleanup(|| {
        let _ = os::close(dir_fd);
    })?;
    shared.moved_aside.borrow_mut().push((dir_fd, side_name));

    let new_fd = os::openat(
        dir_fd,
        name,
        libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
        stat.mode as libc::mode_t,
    )?;
    let result = stream_fd(buffer, new_fd);
    os::close(new_fd)?;
    tracing::trace!("rename-aside finished");
    result
}

/// Destination exists and doesn't collide with any tracked mmap: just
/// truncate and stream in place.
fn create_truncate(buffer: &Buffer, path: &Path) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    stream(buffer, &mut |chunk| file.write_all(chunk))?;
    file.flush()?;
    Ok(())
}

fn stream_fd(buffer: &Buffer, fd: std::os::unix::io::RawFd) -> Result<()> {
    let mut error = None;
    buffer.for_each_leaf(|node| {
        if error.is_some() {
            return;
        }
        if let Err(e) = write_leaf(node, &mut |chunk| os::write_all(fd, chunk)) {
            error = Some(e);
        }
    });
    match error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn stream(buffer: &Buffer, sink: &mut dyn FnMut(&[u8]) -> std::io::Result<()>) -> std::io::Result<()> {
    let mut error = None;
    buffer.for_each_leaf(|node| {
        if error.is_some() {
            return;
        }
        if let Err(e) = write_leaf(node, sink) {
            error = Some(e);
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn write_leaf(node: &Node, sink: &mut dyn FnMut(&[u8]) -> std::io::Result<()>) -> std::io::Result<()> {
    node.fragment()
        .with_bytes(|bytes| sink(&bytes[node.start()..node.end()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{Editor, EditorOptions};

    fn editor(max_open_size: u64) -> Editor {
        Editor::new(EditorOptions {
            max_open_size,
            seed: 9,
            ..EditorOptions::default()
        })
    }

    #[test]
    fn save_to_new_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let ed = editor(100_000_000);
        let buf = ed.new_empty_buffer();
        buf.insert(0, b"hello").unwrap();

        let dest = dir.path().join("out.txt");
        buf.save(dest.to_str().unwrap()).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn save_to_existing_non_mmapped_path_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        std::fs::write(&dest, b"old contents, much longer than new").unwrap();

        let ed = editor(100_000_000);
        let buf = ed.new_empty_buffer();
        buf.insert(0, b"new").unwrap();
        buf.save(dest.to_str().unwrap()).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn save_aside_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, vec![b'A'; 100]).unwrap();

        let ed = editor(10);
        let buf = ed.open(path.to_str().unwrap()).unwrap();
        assert!(buf.has_healthy_mmap());

        buf.delete(0, 10).unwrap();
        buf.save(path.to_str().unwrap()).unwrap();

        let mut has_side_file = false;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".x.txt.skak-") {
                has_side_file = true;
            }
        }
        assert!(has_side_file, "expected a moved-aside sibling file");

        let mut out = vec![0u8; buf.len()];
        buf.read(0, &mut out).unwrap();
        assert_eq!(out, vec![b'A'; 90]);

        drop(buf);
        drop(ed);

        let mut remaining_side_files = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".x.txt.skak-") {
                remaining_side_files += 1;
            }
        }
        assert_eq!(remaining_side_files, 0, "side file should be unlinked at teardown");
    }

    #[test]
    fn hard_link_refusal_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("x.txt");
        let y = dir.path().join("y.txt");
        std::fs::write(&x, vec![b'A'; 100]).unwrap();
        std::fs::hard_link(&x, &y).unwrap();

        let ed = editor(10);
        let buf = ed.open(x.to_str().unwrap()).unwrap();
        assert!(buf.has_healthy_mmap());

        let result = buf.save(y.to_str().unwrap());
        assert!(matches!(result, Err(Error::MultipleHardLinks)));
    }
}
