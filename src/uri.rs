//! The URI loader collaborator contract (spec §6).
//!
//! `Editor::open` and `Buffer::save` route to a [`UriLoader`] whenever the
//! given path parses as a URI with a scheme; otherwise they fall back to
//! plain filesystem operations. This crate does not ship a loader that
//! performs real network I/O (that is out of scope, see spec §1) — only
//! [`NullUriLoader`], which reports every URI as unsupported, and which is
//! what [`crate::EditorOptions`] defaults to.

use std::io;

/// Errors a [`UriLoader`] implementation may report. Translated into
/// [`crate::Error`] by the core.
#[derive(Debug, Clone)]
pub enum UriError {
    /// No configured loader recognizes the URI's scheme.
    UnsupportedScheme,
    /// The resource does not exist.
    NotFound,
    /// The loader was denied access to the resource.
    AccessDenied,
    /// The URI's host name did not resolve.
    UnknownHostName,
    /// The network is unreachable.
    NetworkUnreachable,
    /// The remote end refused the connection.
    ConnectionRefused,
    /// The remote end reset the connection.
    ConnectionResetByPeer,
    /// The operation timed out.
    ConnectionTimedOut,
    /// The loader's D-Bus transport failed.
    DbusFailure,
    /// The loader failed to set up TLS.
    TlsInitializationFailed,
    /// A name server lookup failed transiently.
    TemporaryNameServerFailure,
    /// A name server lookup failed.
    NameServerFailure,
    /// Anything not covered by the variants above.
    Other(String),
}

/// A byte buffer obtained from a [`UriLoader`], together with the means to
/// release it. Mirrors the "foreign allocator" provenance a loader's
/// `load` may hand back (spec §4.1, Foreign fragment).
pub struct LoadedBytes {
    data: Box<[u8]>,
}

impl LoadedBytes {
    /// Wraps an owned byte buffer as loaded content.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// Borrows the loaded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the wrapper, yielding the owned byte buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_vec()
    }
}

/// A sink `Buffer::save` streams bytes into when the destination is a URI.
pub trait UriWriter {
    /// Writes `buf` to the remote resource. May be called multiple times;
    /// the loader is responsible for making the whole sequence atomic with
    /// respect to readers (spec §4.5 step 1).
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// The external collaborator that loads and replaces URI-addressed
/// resources (spec §6). The core never performs network I/O itself; it
/// only validates whether a path looks like a URI and, if so, delegates.
pub trait UriLoader {
    /// Returns `true` if `path` parses as a URI this loader (or any
    /// loader) should be asked to handle, i.e. it has a scheme.
    fn is_uri(&self, path: &str) -> bool {
        parse_scheme(path).is_some()
    }

    /// Loads the entire contents addressed by `uri`.
    fn load(&self, uri: &str) -> Result<LoadedBytes, UriError>;

    /// Atomically replaces the contents addressed by `uri` with what is
    /// written to the returned writer.
    fn replace(&self, uri: &str, write: &mut dyn FnMut(&mut dyn UriWriter) -> io::Result<()>) -> Result<(), UriError>;
}

/// Returns the scheme of `path` if it parses as an absolute URI (i.e. has
/// a scheme followed by `:`), using the `url` crate's parser. Plain
/// filesystem paths, including relative ones, do not have a scheme and so
/// are never mistaken for URIs.
///
/// Single-letter schemes are rejected even if `url` would otherwise accept
/// them, since on Windows they are indistinguishable from a drive letter
/// (`c:\Users\a`); every real scheme in use (`http`, `https`, `file`,
/// `ftp`, ...) is at least two characters long.
pub fn parse_scheme(path: &str) -> Option<String> {
    let url = url::Url::parse(path).ok()?;
    let scheme = url.scheme();
    if scheme.len() < 2 {
        return None;
    }
    Some(scheme.to_string())
}

/// A [`UriLoader`] that supports no scheme at all; every call fails with
/// [`UriError::UnsupportedScheme`]. This is the crate's default loader,
/// since performing real URI loads is out of scope for the core engine
/// (spec §1) and left to the embedder to inject.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUriLoader;

impl UriLoader for NullUriLoader {
    fn is_uri(&self, _path: &str) -> bool {
        // Without a real loader behind it, routing to the URI path would
        // only produce `UnsupportedScheme` for inputs that are actually
        // valid local paths on some platforms (e.g. `c:\foo`). Treat
        // nothing as a URI rather than risk that misclassification.
        false
    }

    fn load(&self, _uri: &str) -> Result<LoadedBytes, UriError> {
        Err(UriError::UnsupportedScheme)
    }

    fn replace(
        &self,
        _uri: &str,
        _write: &mut dyn FnMut(&mut dyn UriWriter) -> io::Result<()>,
    ) -> Result<(), UriError> {
        Err(UriError::UnsupportedScheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme() {
        assert_eq!(parse_scheme("https://example.com/a").as_deref(), Some("https"));
        assert_eq!(parse_scheme("file:///tmp/a").as_deref(), Some("file"));
        assert_eq!(parse_scheme("/tmp/a"), None);
        assert_eq!(parse_scheme("relative/path.txt"), None);
        assert_eq!(parse_scheme("C:\\Users\\a"), None);
    }

    #[test]
    fn null_loader_never_claims_a_uri() {
        let loader = NullUriLoader;
        assert!(!loader.is_uri("https://example.com/a"));
        assert!(loader.load("https://example.com/a").is_err());
    }
}
