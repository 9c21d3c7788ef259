use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

/// The subset of `fstat(2)` fields the fragment lifecycle and the save
/// pipeline need: device/inode identity for matching an mmap against a
/// save destination, link count for the hard-link refusal check, and
/// size for mapping length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub size: u64,
    pub mode: u32,
}

/// Opens `path` read-only for mapping. Returns the raw file descriptor;
/// the caller owns it and must `close` it (mirrors `harrow`'s RawFile,
/// which ties the descriptor's lifetime to a Drop impl one layer up,
/// here to [`crate::fragment::Fragment`]).
pub fn open_readonly(path: &Path) -> io::Result<RawFd> {
    let c = cstr(path)?;
    // SAFETY: `c` is a valid NUL-terminated path. `O_RDONLY` is a valid
    // flag with no associated mode argument needed.
    unsafe { ffi::open(&c, libc::O_RDONLY, 0) }
}

/// `fstat`s an already-open descriptor.
pub fn fstat(fd: RawFd) -> io::Result<Stat> {
    // SAFETY: fd is a valid, open descriptor for the lifetime of this call.
    unsafe { ffi::fstat(fd) }
}

/// Maps `len` bytes of `fd` starting at offset 0, read-only, `MAP_PRIVATE`.
/// On success the mapping also gets `madvise(MADV_SEQUENTIAL)` applied,
/// matching the "advises sequential access" step of `Fragment::load`
/// and the initial mmap-open path (spec §4.1, §4.4).
pub fn map_readonly(fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fd is valid and len is nonzero (checked by the caller via
    // the zero-byte-file special case in `Editor::open`).
    let ptr = unsafe { ffi::map(fd, len, 0, libc::PROT_READ, libc::MAP_PRIVATE, -1) }?;
    // SAFETY: ptr/len describe the mapping just created above.
    unsafe {
        let _ = ffi::advise_sequential(ptr, len);
    }
    Ok(ptr)
}

/// Advises the kernel that `ptr`/`len` will be read sequentially.
/// Best-effort: failures are surfaced but callers typically ignore them.
pub fn advise_sequential(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: caller guarantees ptr/len describe a live mapping.
    unsafe { ffi::advise_sequential(ptr, len) }
}

/// Unmaps a mapping previously returned by [`map_readonly`] or
/// [`remap_zero_fixed`].
pub fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: caller guarantees ptr/len describe a live mapping owned by
    // this process, per the Drop-time contract of `Fragment`.
    unsafe { ffi::unmap(ptr, len) }
}

/// Replaces the `len` bytes at `ptr` in place with an anonymous,
/// read-only, zero-filled mapping of identical length at the identical
/// address, using `MAP_FIXED`. Used when the watcher reports that an
/// mmapped file's contents changed underneath a live fragment (spec
/// §4.1): existing interior references into the fragment's data range
/// stay valid, but now read zeros.
///
/// # Safety
/// `ptr`/`len` must describe a mapping this process currently owns and
/// no other mapping may be interleaved with it; callers must not race
/// this with reads that assume a stable mapping identity other than "the
/// address stays valid".
pub unsafe fn remap_zero_fixed(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    ffi::map(-1, len, 0, libc::PROT_READ, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED, ptr.as_ptr() as i64)
        .map(|_| ())
}

/// Opens a directory for use as the base of `openat`/`renameat`/`unlinkat`
/// calls (spec §4.5 step 3: "open its enclosing directory read-only").
pub fn open_dir(path: &Path) -> io::Result<RawFd> {
    let c = cstr(path)?;
    // SAFETY: c is a valid NUL-terminated directory path.
    unsafe { ffi::open(&c, libc::O_RDONLY | libc::O_DIRECTORY, 0) }
}

/// `openat(dir_fd, name, flags, mode)`.
pub fn openat(dir_fd: RawFd, name: &OsStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<RawFd> {
    let c = CString::new(name.as_bytes())?;
    // SAFETY: dir_fd is a valid open directory descriptor; c is a valid
    // relative, NUL-terminated name.
    unsafe { ffi::openat(dir_fd, &c, flags, mode) }
}

/// `fstat`s the file named `name` relative to `dir_fd`, without
/// following a TOCTOU-prone standalone path lookup.
pub fn fstatat(dir_fd: RawFd, name: &OsStr) -> io::Result<Stat> {
    let c = CString::new(name.as_bytes())?;
    // SAFETY: dir_fd and c are as above.
    unsafe { ffi::fstatat(dir_fd, &c) }
}

/// `renameat(dir_fd, from, dir_fd, to)` — renames within the same
/// directory, used for the rename-aside protocol.
pub fn renameat_same_dir(dir_fd: RawFd, from: &OsStr, to: &OsStr) -> io::Result<()> {
    let from = CString::new(from.as_bytes())?;
    let to = CString::new(to.as_bytes())?;
    // SAFETY: dir_fd, from, and to are all valid for the duration of the
    // call.
    unsafe { ffi::renameat(dir_fd, &from, dir_fd, &to) }
}

/// `unlinkat(dir_fd, name, 0)` — best-effort cleanup of a moved-aside
/// file at editor teardown (spec §4.4).
pub fn unlinkat(dir_fd: RawFd, name: &OsStr) -> io::Result<()> {
    let c = CString::new(name.as_bytes())?;
    // SAFETY: dir_fd and c are valid.
    unsafe { ffi::unlinkat(dir_fd, &c) }
}

/// Closes a raw descriptor previously returned by one of the `open*`
/// functions above.
pub fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: caller guarantees fd is open and not otherwise in use.
    unsafe { ffi::close(fd) }
}

/// Writes the entirety of `buf` to `fd`, looping over partial writes and
/// retrying on `EINTR`. Used by the save pipeline's streaming step.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: fd is a valid, open, writable descriptor for the
        // duration of this call.
        match unsafe { ffi::write(fd, buf) } {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn cstr(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

mod ffi {
    use std::ffi::CStr;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::ptr::NonNull;

    use super::Stat;

    pub unsafe fn open(path: &CStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<RawFd> {
        let fd = libc::open(path.as_ptr(), flags, mode as libc::c_uint);
        if fd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub unsafe fn openat(
        dir_fd: RawFd,
        name: &CStr,
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<RawFd> {
        let fd = libc::openat(dir_fd, name.as_ptr(), flags, mode as libc::c_uint);
        if fd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub unsafe fn close(fd: RawFd) -> io::Result<()> {
        if libc::close(fd) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn fstat(fd: RawFd) -> io::Result<Stat> {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(to_stat(&st))
    }

    pub unsafe fn fstatat(dir_fd: RawFd, name: &CStr) -> io::Result<Stat> {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstatat(dir_fd, name.as_ptr(), &mut st, 0) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(to_stat(&st))
    }

    fn to_stat(st: &libc::stat) -> Stat {
        Stat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            nlink: st.st_nlink as u64,
            size: st.st_size as u64,
            mode: st.st_mode as u32,
        }
    }

    pub unsafe fn map(
        fd: RawFd,
        len: usize,
        off: libc::off_t,
        prot: libc::c_int,
        flags: libc::c_int,
        addr_hint: i64,
    ) -> io::Result<NonNull<u8>> {
        let addr = addr_hint as *mut libc::c_void;
        let ptr = libc::mmap(addr, len, prot, flags, fd, off);

        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
        }
    }

    pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn advise_sequential(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if libc::madvise(ptr.as_ptr() as *mut libc::c_void, len, libc::MADV_SEQUENTIAL) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn renameat(
        from_dir: RawFd,
        from: &CStr,
        to_dir: RawFd,
        to: &CStr,
    ) -> io::Result<()> {
        if libc::renameat(from_dir, from.as_ptr(), to_dir, to.as_ptr()) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let n = libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub unsafe fn unlinkat(dir_fd: RawFd, name: &CStr) -> io::Result<()> {
        if libc::unlinkat(dir_fd, name.as_ptr(), 0) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fstat_reports_size_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"hello").unwrap();
        }

        let fd = open_readonly(&path).unwrap();
        let st = fstat(fd).unwrap();
        assert_eq!(st.size, 5);
        assert_eq!(st.nlink, 1);
        close(fd).unwrap();
    }

    #[test]
    fn map_and_unmap_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abcdef").unwrap();

        let fd = open_readonly(&path).unwrap();
        let ptr = map_readonly(fd, 6).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 6) };
        assert_eq!(slice, b"abcdef");
        unmap(ptr, 6).unwrap();
        close(fd).unwrap();
    }

    #[test]
    fn remap_zero_fixed_returns_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abcdef").unwrap();

        let fd = open_readonly(&path).unwrap();
        let ptr = map_readonly(fd, 6).unwrap();
        unsafe {
            remap_zero_fixed(ptr, 6).unwrap();
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 6) };
        assert_eq!(slice, [0u8; 6]);
        unmap(ptr, 6).unwrap();
        close(fd).unwrap();
    }

    #[test]
    fn renameat_and_unlinkat_within_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dir_fd = open_dir(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        renameat_same_dir(dir_fd, OsStr::new("a.txt"), OsStr::new("b.txt")).unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());

        unlinkat(dir_fd, OsStr::new("b.txt")).unwrap();
        assert!(!dir.path().join("b.txt").exists());

        close(dir_fd).unwrap();
    }
}
