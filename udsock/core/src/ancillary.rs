//! Descriptor Passing
//!
//! `SCM_RIGHTS` control messages: encoding descriptors for the first
//! `sendmsg` of a record, and collecting descriptors on the receiving end.
//!
//! Control buffers are backed by `u64`s so the `cmsghdr` at their start is
//! suitably aligned.

#![allow(unsafe_code)]

use std::mem;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::{Syscall, TransportError};
use crate::socket::Socket;
use crate::stream::ReadOutcome;
use crate::sys;

/// Most descriptors accepted in one receive
pub const MAX_FDS_PER_MESSAGE: usize = 253;

/// `CMSG_SPACE` for `count` descriptors
fn fd_space(count: usize) -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    unsafe { libc::CMSG_SPACE((count * mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// An aligned control-message buffer
#[derive(Debug, Default)]
pub struct ControlBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(mem::size_of::<u64>())],
            len,
        }
    }

    /// Encode one `SCM_RIGHTS` message carrying `fds`.
    ///
    /// The descriptors are borrowed: the kernel duplicates them into the
    /// receiving process and the sender keeps its own copies.
    #[must_use]
    pub fn with_fds(fds: &[BorrowedFd<'_>]) -> Self {
        if fds.is_empty() {
            return Self::default();
        }

        let data_len = fds.len() * mem::size_of::<RawFd>();
        let mut buffer = Self::zeroed(fd_space(fds.len()));
        let raw: Vec<RawFd> = fds.iter().map(std::os::fd::AsRawFd::as_raw_fd).collect();

        // SAFETY: the buffer is zeroed, u64-aligned and CMSG_SPACE(data_len)
        // bytes long, which holds one cmsghdr followed by data_len bytes.
        unsafe {
            let cmsg = buffer.words.as_mut_ptr().cast::<libc::cmsghdr>();
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as libc::c_uint) as _;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            ptr::copy_nonoverlapping(
                raw.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw.len(),
            );
        }
        buffer
    }

    /// Encoded bytes, empty when no descriptors are attached
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: words owns at least len initialised bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: words owns at least len initialised bytes and is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    /// Whether no control data is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take ownership of every descriptor in the first `len` bytes
    fn collect_fds(&self, len: usize) -> Vec<OwnedFd> {
        let mut fds = Vec::new();
        if len == 0 {
            return fds;
        }

        // SAFETY: msghdr is integers and nullable pointers; all-zero is valid.
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_control = self.words.as_ptr() as *mut libc::c_void;
        hdr.msg_controllen = len as _;

        // SAFETY: hdr describes len valid bytes of this buffer; the CMSG
        // macros only walk headers that lie within that range.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let header_len = libc::CMSG_LEN(0) as usize;
                    let data_len = (*cmsg).cmsg_len as usize - header_len;
                    let count = data_len / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count {
                        let raw = ptr::read_unaligned(data.add(i));
                        // The kernel installed this descriptor for us; nobody else owns it.
                        fds.push(OwnedFd::from_raw_fd(raw));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
            }
        }
        fds
    }
}

impl Socket {
    /// Read like [`Socket::read_into`] and also collect descriptors passed
    /// with `SCM_RIGHTS`.
    ///
    /// Up to `max_fds` descriptors are accepted; the received descriptors
    /// are owned by the caller.
    ///
    /// # Errors
    ///
    /// - `System { op: Recv }` if the kernel call fails
    /// - `MalformedFrame` if the kernel dropped descriptors that did not fit
    pub fn recv_with_fds(
        &self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<(ReadOutcome, Vec<OwnedFd>), TransportError> {
        let max_fds = max_fds.min(MAX_FDS_PER_MESSAGE);
        let mut control = if max_fds == 0 {
            ControlBuffer::default()
        } else {
            ControlBuffer::zeroed(fd_space(max_fds))
        };

        let received = sys::recvmsg(self.as_fd(), buf, control.as_bytes_mut())
            .map_err(|e| TransportError::system(Syscall::Recv, e))?;
        let fds = control.collect_fds(received.control_len);

        if received.control_truncated {
            // Whatever did fit is closed when `fds` drops.
            return Err(TransportError::MalformedFrame(format!(
                "descriptors truncated, at most {max_fds} accepted"
            )));
        }

        let outcome = if buf.is_empty() {
            ReadOutcome::Data(0)
        } else {
            self.outcome(received.bytes)
        };
        Ok((outcome, fds))
    }
}
