//! Address Resolution
//!
//! Turns a filesystem path into a `sockaddr_un` ready for `bind`/`connect`.
//!
//! The encoded length handed to the kernel is the structure's header
//! (everything before `sun_path`) plus the path's byte length, the value
//! `SUN_LEN` computes. The kernel reads the path up to that length, so the
//! full structure size is never passed.

use std::fmt;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::TransportError;
use crate::sys;

/// Bytes of `sockaddr_un` that precede `sun_path`
pub const HEADER_OVERHEAD: usize = mem::offset_of!(libc::sockaddr_un, sun_path);

/// Capacity of `sun_path`, NUL terminator included
const SUN_PATH_CAPACITY: usize = mem::size_of::<libc::sockaddr_un>() - HEADER_OVERHEAD;

/// Longest path accepted, leaving room for the NUL terminator
pub const MAX_PATH_LEN: usize = SUN_PATH_CAPACITY - 1;

/// A resolved Unix-domain socket address
#[derive(Clone)]
pub struct SocketAddress {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
    path: PathBuf,
}

impl SocketAddress {
    /// Resolve `path` into a socket address.
    ///
    /// The length is checked before anything is copied, so an oversized
    /// path never touches the structure.
    ///
    /// # Errors
    ///
    /// - `PathTooLong` if the path exceeds [`MAX_PATH_LEN`] bytes
    /// - `InvalidPath` if the path is empty or contains a NUL byte
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let bytes = path.as_os_str().as_bytes();

        if bytes.len() > MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                len: bytes.len(),
                max: MAX_PATH_LEN,
            });
        }
        if bytes.is_empty() {
            return Err(TransportError::InvalidPath("path is empty".to_string()));
        }
        if bytes.contains(&0) {
            return Err(TransportError::InvalidPath(format!(
                "{path:?} contains a NUL byte"
            )));
        }

        let mut addr = sys::zeroed_sockaddr_un();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        Ok(Self {
            addr,
            len: (HEADER_OVERHEAD + bytes.len()) as libc::socklen_t,
            path: path.to_path_buf(),
        })
    }

    /// Length passed to `bind`/`connect`: header plus path bytes
    #[must_use]
    pub fn encoded_len(&self) -> libc::socklen_t {
        self.len
    }

    /// The path this address was resolved from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw `sun_path` bytes up to the encoded length
    #[must_use]
    pub fn raw_path(&self) -> Vec<u8> {
        self.addr.sun_path[..self.len as usize - HEADER_OVERHEAD]
            .iter()
            .map(|c| *c as u8)
            .collect()
    }

    /// Pointer for passing to the kernel
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        (&self.addr as *const libc::sockaddr_un).cast()
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAddress")
            .field("path", &self.path)
            .field("encoded_len", &self.len)
            .finish()
    }
}
