//! Unified error taxonomy for the buffer engine.
//!
//! Every fallible operation in this crate returns [`Error`]. OS errors
//! encountered during `open`/`save` and errors reported by a [`UriLoader`]
//! implementation are both translated into this flat enum rather than
//! leaking their originating domain to callers.
//!
//! [`UriLoader`]: crate::uri::UriLoader

use std::io;

use crate::uri::UriError;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A unified error taxonomy covering allocation failure, bounds violations,
/// buffer-state misuse, and translated OS/URI-loader errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The allocator refused a request.
    #[error("out of memory")]
    OutOfMemory,

    /// An offset or range exceeded the length of the buffer being operated
    /// on.
    #[error("offset or range out of bounds")]
    OutOfBounds,

    /// A mutator (`insert`, `delete`, `copy`) was invoked on a frozen
    /// buffer.
    #[error("buffer is frozen")]
    BufferFrozen,

    /// `save` refused to overwrite a destination that is mmapped by the
    /// editor and has more than one hard link, since renaming it aside
    /// would not protect the other link's readers.
    #[error("destination has multiple hard links")]
    MultipleHardLinks,

    /// No file exists at the given path.
    #[error("file not found")]
    FileNotFound,
    /// The path refers to a directory where a regular file was expected.
    #[error("path is a directory")]
    IsDir,
    /// A path component exceeded the platform's maximum length.
    #[error("name too long")]
    NameTooLong,
    /// The path contains invalid characters or structure.
    #[error("bad path name")]
    BadPathName,
    /// Resolving the path followed too many symbolic links.
    #[error("symbolic link loop")]
    SymLinkLoop,
    /// The filesystem's inode/link quota was exhausted.
    #[error("link quota exceeded")]
    LinkQuotaExceeded,
    /// The destination filesystem has no space left.
    #[error("no space left on device")]
    NoSpaceLeft,
    /// The operating system denied access to the path.
    #[error("access denied")]
    AccessDenied,
    /// The filesystem backing the path is not currently mounted.
    #[error("file not mounted")]
    FileNotMounted,
    /// A network operation (URI loader) timed out.
    #[error("connection timed out")]
    ConnectionTimedOut,
    /// The device backing the path is busy.
    #[error("device busy")]
    DeviceBusy,
    /// A URI's host name did not resolve.
    #[error("unknown host name")]
    UnknownHostName,
    /// The process' file descriptor quota was exhausted.
    #[error("file descriptor quota exceeded")]
    FdQuotaExceeded,
    /// The network is unreachable.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// The remote end refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The remote end reset the connection.
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    /// No such device.
    #[error("no such device")]
    NoDevice,

    /// The URI loader's D-Bus transport failed.
    #[error("dbus failure")]
    DbusFailure,
    /// The URI loader failed to initialize TLS.
    #[error("tls initialization failed")]
    TlsInitializationFailed,
    /// A name server lookup failed transiently.
    #[error("temporary name server failure")]
    TemporaryNameServerFailure,
    /// A name server lookup failed.
    #[error("name server failure")]
    NameServerFailure,

    /// A scheme was given that no configured [`UriLoader`](crate::uri::UriLoader)
    /// supports.
    #[error("unsupported uri scheme")]
    UnsupportedScheme,

    /// An error that does not fit the taxonomy above.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind as K;

        match err.kind() {
            K::NotFound => Error::FileNotFound,
            K::PermissionDenied => Error::AccessDenied,
            K::AlreadyExists => Error::Unexpected(err.to_string()),
            K::InvalidInput | K::InvalidData => Error::BadPathName,
            K::TimedOut => Error::ConnectionTimedOut,
            K::ConnectionRefused => Error::ConnectionRefused,
            K::ConnectionReset => Error::ConnectionResetByPeer,
            _ => translate_raw_os_error(&err).unwrap_or_else(|| Error::Unexpected(err.to_string())),
        }
    }
}

/// Inspects the raw `errno` behind an [`io::Error`] for the OS-level
/// conditions the generic [`io::ErrorKind`] match above does not
/// distinguish (link count, device, name length, quotas...).
#[cfg(unix)]
fn translate_raw_os_error(err: &io::Error) -> Option<Error> {
    let errno = err.raw_os_error()?;
    Some(match errno {
        libc::ENAMETOOLONG => Error::NameTooLong,
        libc::ELOOP => Error::SymLinkLoop,
        libc::EMLINK => Error::LinkQuotaExceeded,
        libc::ENOSPC => Error::NoSpaceLeft,
        libc::EISDIR => Error::IsDir,
        libc::ENODEV => Error::NoDevice,
        libc::EBUSY => Error::DeviceBusy,
        libc::EMFILE | libc::ENFILE => Error::FdQuotaExceeded,
        libc::ENXIO | libc::ENOENT => Error::FileNotFound,
        _ => return None,
    })
}

#[cfg(not(unix))]
fn translate_raw_os_error(_err: &io::Error) -> Option<Error> {
    None
}

impl From<UriError> for Error {
    fn from(err: UriError) -> Self {
        match err {
            UriError::UnsupportedScheme => Error::UnsupportedScheme,
            UriError::NotFound => Error::FileNotFound,
            UriError::AccessDenied => Error::AccessDenied,
            UriError::UnknownHostName => Error::UnknownHostName,
            UriError::NetworkUnreachable => Error::NetworkUnreachable,
            UriError::ConnectionRefused => Error::ConnectionRefused,
            UriError::ConnectionResetByPeer => Error::ConnectionResetByPeer,
            UriError::ConnectionTimedOut => Error::ConnectionTimedOut,
            UriError::DbusFailure => Error::DbusFailure,
            UriError::TlsInitializationFailed => Error::TlsInitializationFailed,
            UriError::TemporaryNameServerFailure => Error::TemporaryNameServerFailure,
            UriError::NameServerFailure => Error::NameServerFailure,
            UriError::Other(message) => Error::Unexpected(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_not_found() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "nope").into();
        assert!(matches!(err, Error::FileNotFound));
    }

    #[test]
    fn translates_permission_denied() {
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, Error::AccessDenied));
    }

    #[test]
    fn unexpected_has_message() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "weird").into();
        assert!(err.to_string().contains("weird"));
    }
}
