//! Failed connects must not leak descriptors
//!
//! Kept alone in its own test binary: it counts the process's open
//! descriptors, which other tests running in parallel would disturb.

#![cfg(target_os = "linux")]

use tempfile::TempDir;

use udsock_core::{Socket, SocketKind, Syscall};

fn open_descriptor_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn test_failed_open_closes_socket() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nobody-listens.sock");

    // Warm up anything lazily allocated on the first failure.
    let _ = Socket::open(&path, SocketKind::Stream);
    let before = open_descriptor_count();

    for _ in 0..64 {
        let err = Socket::open(&path, SocketKind::Stream).unwrap_err();
        assert_eq!(err.syscall(), Some(Syscall::Connect));
    }
    for _ in 0..64 {
        let err = Socket::open(&path, SocketKind::Datagram).unwrap_err();
        assert_eq!(err.syscall(), Some(Syscall::Connect));
    }

    assert_eq!(open_descriptor_count(), before);
}
