//! Thin, safe-ish wrappers over the POSIX primitives the save pipeline and
//! the mmap fragment lifecycle need: `open`/`fstat`/`mmap`/`madvise`/
//! `munmap`, the MAP_FIXED anonymous-zero remap used on corruption, and
//! the `openat`/`renameat`/`unlinkat`-relative-to-directory-fd protocol
//! the rename-aside save path depends on (spec §4.1, §4.5, §6).
//!
//! This module (and the crate as a whole) is `#[cfg(unix)]`: the
//! directory-fd-relative save protocol has no Windows analogue, the same
//! scoping choice the `crumbles` crate in the reference corpus makes for
//! its own raw-syscall mmap code.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::*;
