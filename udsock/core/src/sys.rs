//! Raw syscall wrappers
//!
//! Every `libc` socket call the transport makes goes through here. The
//! wrappers translate `-1` into `io::Error::last_os_error()` and hand out
//! descriptors as `OwnedFd` so ownership is tracked from the moment the
//! kernel returns them.
//!
//! Blocking calls that consume nothing when interrupted (`accept`, `read`,
//! `write`, `recvmsg`) retry `EINTR` here. `sendmsg` does not: the drain loop
//! in `sender` owns that retry so it can keep its bookkeeping exact.

#![allow(unsafe_code)]

use std::io::{self, IoSlice};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};

use crate::address::SocketAddress;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn retry_interrupted<T>(mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::trace!("syscall interrupted, retrying");
            }
            other => return other,
        }
    }
}

/// A zero-initialised `sockaddr_un`
pub(crate) fn zeroed_sockaddr_un() -> libc::sockaddr_un {
    // SAFETY: sockaddr_un is plain integers and a byte array; all-zero is valid.
    unsafe { mem::zeroed() }
}

/// Set close-on-exec on platforms without `SOCK_CLOEXEC`
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fd is open for the duration of the call.
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

/// `socket(AF_UNIX, ty, 0)`
pub(crate) fn socket(ty: libc::c_int) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = ty | libc::SOCK_CLOEXEC;

    // SAFETY: no pointers are passed.
    let fd = cvt(unsafe { libc::socket(libc::AF_UNIX, ty, 0) })?;
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    set_cloexec(&fd)?;

    Ok(fd)
}

/// `socketpair(AF_UNIX, ty, 0)`
pub(crate) fn socketpair(ty: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = ty | libc::SOCK_CLOEXEC;

    let mut fds = [-1 as libc::c_int; 2];
    // SAFETY: fds points at two writable c_ints.
    cvt(unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) })?;
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(&pair.0)?;
        set_cloexec(&pair.1)?;
    }

    Ok(pair)
}

/// `bind(fd, addr, SUN_LEN(addr))`
pub(crate) fn bind(fd: BorrowedFd<'_>, addr: &SocketAddress) -> io::Result<()> {
    // SAFETY: addr points at a live sockaddr_un and encoded_len never exceeds its size.
    cvt(unsafe { libc::bind(fd.as_raw_fd(), addr.as_ptr(), addr.encoded_len()) })?;
    Ok(())
}

/// `listen(fd, backlog)`
pub(crate) fn listen(fd: BorrowedFd<'_>, backlog: libc::c_int) -> io::Result<()> {
    // SAFETY: no pointers are passed.
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(())
}

/// `accept(fd, NULL, NULL)`, retried on `EINTR`
pub(crate) fn accept(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let raw = retry_interrupted(|| {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        // SAFETY: null address pointers are allowed and ask the kernel not to report the peer.
        let ret = unsafe {
            libc::accept4(
                fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        // SAFETY: as above.
        let ret =
            unsafe { libc::accept(fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        cvt(ret)
    })?;
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    let accepted = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    set_cloexec(&accepted)?;

    Ok(accepted)
}

/// `connect(fd, addr, SUN_LEN(addr))`
pub(crate) fn connect(fd: BorrowedFd<'_>, addr: &SocketAddress) -> io::Result<()> {
    // SAFETY: addr points at a live sockaddr_un and encoded_len never exceeds its size.
    cvt(unsafe { libc::connect(fd.as_raw_fd(), addr.as_ptr(), addr.encoded_len()) })?;
    Ok(())
}

/// `read(fd, buf, len)`, retried on `EINTR`
pub(crate) fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    retry_interrupted(|| {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        cvt_size(unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) })
    })
}

/// `write(fd, buf, len)`, retried on `EINTR`
pub(crate) fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    retry_interrupted(|| {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        cvt_size(unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
    })
}

/// One `sendmsg` call over `bufs`, with optional control data.
///
/// `EINTR` is returned to the caller untouched.
pub(crate) fn sendmsg(
    fd: BorrowedFd<'_>,
    bufs: &[IoSlice<'_>],
    control: Option<&[u8]>,
) -> io::Result<usize> {
    // SAFETY: msghdr is integers and nullable pointers; all-zero is valid.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    // IoSlice is guaranteed ABI compatible with iovec on Unix.
    hdr.msg_iov = bufs.as_ptr() as *mut libc::iovec;
    hdr.msg_iovlen = bufs.len() as _;
    if let Some(control) = control.filter(|c| !c.is_empty()) {
        hdr.msg_control = control.as_ptr() as *mut libc::c_void;
        hdr.msg_controllen = control.len() as _;
    }

    // SAFETY: hdr only references bufs and control, both borrowed for this call.
    cvt_size(unsafe { libc::sendmsg(fd.as_raw_fd(), &hdr, SEND_FLAGS) })
}

/// Result of one `recvmsg` call
pub(crate) struct Received {
    /// Payload bytes written into the data buffer
    pub bytes: usize,
    /// Control bytes written into the control buffer
    pub control_len: usize,
    /// Kernel dropped control data that did not fit
    pub control_truncated: bool,
}

/// `recvmsg(fd, ...)` into one data buffer and one control buffer, retried on `EINTR`
pub(crate) fn recvmsg(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
    control: &mut [u8],
) -> io::Result<Received> {
    retry_interrupted(|| {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is integers and nullable pointers; all-zero is valid.
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        if !control.is_empty() {
            hdr.msg_control = control.as_mut_ptr().cast();
            hdr.msg_controllen = control.len() as _;
        }

        // SAFETY: hdr references iov and control, both live and writable for this call.
        let bytes = cvt_size(unsafe { libc::recvmsg(fd.as_raw_fd(), &mut hdr, RECV_FLAGS) })?;
        Ok(Received {
            bytes,
            control_len: hdr.msg_controllen as usize,
            control_truncated: hdr.msg_flags & libc::MSG_CTRUNC != 0,
        })
    })
}

/// `shutdown(fd, how)`
pub(crate) fn shutdown(fd: BorrowedFd<'_>, how: libc::c_int) -> io::Result<()> {
    // SAFETY: no pointers are passed.
    cvt(unsafe { libc::shutdown(fd.as_raw_fd(), how) })?;
    Ok(())
}

/// `close(fd)`, reporting the error `OwnedFd`'s drop would swallow.
///
/// The descriptor is released even when an error is reported; it is never
/// closed twice.
pub(crate) fn close(fd: OwnedFd) -> io::Result<()> {
    let raw = fd.into_raw_fd();
    // SAFETY: raw came out of an OwnedFd, so this is its single close.
    cvt(unsafe { libc::close(raw) })?;
    Ok(())
}

/// `setsockopt(fd, SOL_SOCKET, SO_SNDBUF, size)`
pub(crate) fn set_send_buffer_size(fd: BorrowedFd<'_>, size: usize) -> io::Result<()> {
    let value = libc::c_int::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "send buffer size overflows c_int"))?;
    // SAFETY: value lives across the call and its size is passed alongside.
    cvt(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Credentials of the process on the other end of a connected socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer process id
    pub pid: i32,
    /// Peer user id
    pub uid: u32,
    /// Peer group id
    pub gid: u32,
}

/// `getsockopt(fd, SOL_SOCKET, SO_PEERCRED)`
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<PeerCredentials> {
    // SAFETY: ucred is plain integers; all-zero is valid.
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: cred and len are live and writable, len holds cred's size.
    cvt(unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    })?;
    Ok(PeerCredentials {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

/// Peer credentials are only read through `SO_PEERCRED`
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn peer_credentials(_fd: BorrowedFd<'_>) -> io::Result<PeerCredentials> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_PEERCRED is Linux-specific",
    ))
}

/// Real user id of this process
pub(crate) fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}
