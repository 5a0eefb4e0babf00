//! Scatter-Gather Sender
//!
//! Delivers a multi-part message as one ordered byte sequence even when a
//! single `sendmsg` takes only a prefix of it, or is interrupted by a signal
//! before taking anything.
//!
//! [`send_all`] is the drain loop every framing goes through. Control data
//! (passed descriptors) rides on the first call only; the retries continue
//! the same payload without it.

use std::any::Any;
use std::io::{self, IoSlice, Read};
use std::os::fd::{AsFd, BorrowedFd};

use crate::ancillary::ControlBuffer;
use crate::error::{Syscall, TransportError};
use crate::framing::{ConnectionHeader, MessageType, Record, BREAK};
use crate::pending::{PendingVector, MAX_IOVECS};
use crate::segment::{encode_all, Encoded, Segment};
use crate::socket::{Socket, SocketKind};
use crate::sys;

/// Payload chunk size for [`send_record_streaming`]
pub const STREAM_CHUNK_LEN: usize = 100 * 1024;

/// Interruptions in a row before the drain loop starts logging them
const INTERRUPT_WARN_THRESHOLD: u32 = 64;

/// One vectored send primitive.
///
/// Returns the number of bytes accepted, which may be any prefix of the
/// offered slices. `Interrupted` means nothing was accepted.
pub trait MessageSink {
    /// Offer `bufs` (and `control`, if any) in one call
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], control: Option<&[u8]>)
        -> io::Result<usize>;

    /// Whether every call becomes one datagram on the wire.
    ///
    /// A message for such a sink must fit in a single call.
    fn is_message_oriented(&self) -> bool {
        false
    }
}

impl MessageSink for &Socket {
    fn send_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
        control: Option<&[u8]>,
    ) -> io::Result<usize> {
        sys::sendmsg(self.as_fd(), bufs, control)
    }

    fn is_message_oriented(&self) -> bool {
        self.kind() == SocketKind::Datagram
    }
}

impl MessageSink for Socket {
    fn send_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
        control: Option<&[u8]>,
    ) -> io::Result<usize> {
        (&*self).send_vectored(bufs, control)
    }

    fn is_message_oriented(&self) -> bool {
        self.kind() == SocketKind::Datagram
    }
}

fn send_failure(sent: usize, total: usize, source: io::Error) -> TransportError {
    if sent == 0 {
        TransportError::system(Syscall::Send, source)
    } else {
        tracing::warn!(sent, total, error = %source, "send failed mid-message");
        TransportError::PartialSend {
            sent,
            total,
            source,
        }
    }
}

/// Fold everything past the first `MAX_IOVECS - 1` non-empty parts into
/// `storage`, so the message fits in one slice table.
fn coalesce_tail<'a>(parts: &[&'a [u8]], storage: &'a mut Vec<u8>) -> Vec<&'a [u8]> {
    let mut non_empty: Vec<&'a [u8]> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    if non_empty.len() <= MAX_IOVECS {
        return non_empty;
    }

    for part in non_empty.drain(MAX_IOVECS - 1..) {
        storage.extend_from_slice(part);
    }
    let tail: &'a Vec<u8> = storage;
    non_empty.push(tail.as_slice());
    non_empty
}

/// Deliver every byte of `parts`, in order.
///
/// Returns the total number of bytes delivered. A message with no bytes and
/// no control data makes no kernel call. On a message-oriented sink parts
/// beyond [`MAX_IOVECS`] are copied into one buffer so the message still
/// leaves in a single datagram.
///
/// # Errors
///
/// - `System { op: Send }` if the first accepting call fails
/// - `PartialSend` if a call fails after part of the message was accepted;
///   the connection must then be closed
pub fn send_all<S: MessageSink + ?Sized>(
    sink: &mut S,
    parts: &[&[u8]],
    control: Option<&[u8]>,
) -> Result<usize, TransportError> {
    let total = parts.iter().map(|p| p.len()).sum();
    drain(sink, parts, control, 0, total)
}

/// The drain loop for one piece of a larger message.
///
/// `already_sent` bytes of the `total`-byte message went out before this
/// piece; a failure is classified against the whole message. Returns the
/// bytes delivered by this piece.
fn drain<S: MessageSink + ?Sized>(
    sink: &mut S,
    parts: &[&[u8]],
    control: Option<&[u8]>,
    already_sent: usize,
    total: usize,
) -> Result<usize, TransportError> {
    let mut storage = Vec::new();
    let mut pending = if sink.is_message_oriented() {
        PendingVector::new(coalesce_tail(parts, &mut storage))
    } else {
        PendingVector::new(parts.iter().copied())
    };
    let mut control = control.filter(|c| !c.is_empty());
    let mut sent = 0usize;
    let mut interruptions = 0u32;

    while !pending.is_drained() || control.is_some() {
        let slices = pending.io_slices();
        match sink.send_vectored(&slices, control) {
            Ok(0) if !pending.is_drained() => {
                return Err(send_failure(
                    already_sent + sent,
                    total,
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            Ok(accepted) => {
                control = None;
                interruptions = 0;
                let overshoot = pending.advance(accepted);
                if overshoot > 0 {
                    tracing::warn!(accepted, overshoot, "sink reported more bytes than offered");
                }
                sent += accepted - overshoot;
                tracing::trace!(accepted, sent = already_sent + sent, total, "sendmsg progress");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                interruptions += 1;
                if interruptions % INTERRUPT_WARN_THRESHOLD == 0 {
                    tracing::warn!(
                        interruptions,
                        sent = already_sent + sent,
                        total,
                        "sendmsg repeatedly interrupted"
                    );
                }
            }
            Err(e) => return Err(send_failure(already_sent + sent, total, e)),
        }
    }

    Ok(sent)
}

fn send_encoded<S: MessageSink + ?Sized>(
    sink: &mut S,
    encoded: &[Encoded<'_>],
    control: Option<&[u8]>,
) -> Result<usize, TransportError> {
    let parts: Vec<&[u8]> = encoded.iter().map(Encoded::as_bytes).collect();
    send_all(sink, &parts, control)
}

/// Deliver a list of typed segments completely
///
/// # Errors
///
/// As [`send_all`].
pub fn send_segments<S: MessageSink + ?Sized>(
    sink: &mut S,
    segments: &[Segment<'_>],
) -> Result<usize, TransportError> {
    send_encoded(sink, &encode_all(segments), None)
}

/// Offer a list of typed segments in a single call.
///
/// Returns what the kernel accepted, which may be short; nothing is resent.
/// An interrupted call is retried.
///
/// # Errors
///
/// `System { op: Send }` if the call fails.
pub fn send_segments_once<S: MessageSink + ?Sized>(
    sink: &mut S,
    segments: &[Segment<'_>],
) -> Result<usize, TransportError> {
    let encoded = encode_all(segments);
    let parts: Vec<&[u8]> = encoded.iter().map(Encoded::as_bytes).collect();
    let mut storage = Vec::new();
    let pending = if sink.is_message_oriented() {
        PendingVector::new(coalesce_tail(&parts, &mut storage))
    } else {
        PendingVector::new(parts)
    };
    if pending.is_drained() {
        return Ok(0);
    }

    let slices = pending.io_slices();
    loop {
        match sink.send_vectored(&slices, None) {
            Ok(accepted) => return Ok(accepted),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::system(Syscall::Send, e)),
        }
    }
}

/// Classify marshalled values and deliver them completely.
///
/// # Errors
///
/// - `UnsupportedSegmentType` before anything is sent, if a value is not
///   one of the segment kinds
/// - otherwise as [`send_all`]
pub fn send_dynamic<S: MessageSink + ?Sized>(
    sink: &mut S,
    values: &[&dyn Any],
) -> Result<usize, TransportError> {
    let segments = Segment::classify_all(values)?;
    send_segments(sink, &segments)
}

/// Deliver one fixed-field record
///
/// # Errors
///
/// As [`send_all`].
pub fn send_record<S: MessageSink + ?Sized>(
    sink: &mut S,
    record: &Record<'_>,
) -> Result<usize, TransportError> {
    send_record_with_fds(sink, record, &[])
}

/// Deliver one record, passing `fds` alongside its first bytes
///
/// # Errors
///
/// As [`send_all`].
pub fn send_record_with_fds<S: MessageSink + ?Sized>(
    sink: &mut S,
    record: &Record<'_>,
    fds: &[BorrowedFd<'_>],
) -> Result<usize, TransportError> {
    let buffer = ControlBuffer::with_fds(fds);
    let segments = record.segments();
    let encoded = encode_all(&segments);
    let control = (!buffer.is_empty()).then(|| buffer.as_bytes());

    let sent = send_encoded(sink, &encoded, control)?;
    tracing::debug!(
        message_type = %record.message_type(),
        bytes = sent,
        fds = fds.len(),
        "record sent"
    );
    Ok(sent)
}

/// Deliver one record whose payload is read from `payload` in chunks.
///
/// Exactly `data_len` bytes are read and sent; the header announces them
/// before the first chunk is read, so every failure after the header is a
/// `PartialSend`.
///
/// # Errors
///
/// - `Unsupported` for [`MessageType::JournalFd`], which has no inline payload
/// - `System { op: Send }` if the header cannot be sent at all
/// - `PartialSend` once the header is out: a failing send, a failing reader
///   (its error is the source), or a reader that ends before `data_len`
///   bytes (`UnexpectedEof`)
pub fn send_record_streaming<S: MessageSink + ?Sized, R: Read>(
    sink: &mut S,
    message_type: MessageType,
    data_len: u64,
    payload: R,
    metadata: &[u8],
) -> Result<usize, TransportError> {
    if !message_type.carries_payload() {
        return Err(TransportError::Unsupported(
            "journal-fd records carry no inline payload",
        ));
    }

    let header = ConnectionHeader::new(message_type, data_len, metadata.len() as u64).to_bytes();
    let total = usize::try_from(data_len)
        .ok()
        .and_then(|len| len.checked_add(header.len() + 2 * BREAK.len() + metadata.len()))
        .unwrap_or(usize::MAX);
    let mut sent = drain(sink, &[&header], None, 0, total)?;

    let mut payload = payload.take(data_len);
    let mut chunk = vec![0u8; STREAM_CHUNK_LEN];
    let mut streamed = 0u64;
    loop {
        let read = match payload.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(send_failure(sent, total, e)),
        };
        sent += drain(sink, &[&chunk[..read]], None, sent, total)?;
        streamed += read as u64;
    }

    if streamed != data_len {
        return Err(send_failure(
            sent,
            total,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload ended after {streamed} of {data_len} bytes"),
            ),
        ));
    }

    sent += drain(sink, &[BREAK, metadata, BREAK], None, sent, total)?;
    tracing::debug!(%message_type, bytes = sent, "streamed record sent");
    Ok(sent)
}

impl Socket {
    /// [`send_all`] on this socket
    ///
    /// # Errors
    ///
    /// As [`send_all`].
    pub fn send_all(&self, parts: &[&[u8]]) -> Result<usize, TransportError> {
        send_all(&mut &*self, parts, None)
    }

    /// [`send_record`] on this socket
    ///
    /// # Errors
    ///
    /// As [`send_all`].
    pub fn send_record(&self, record: &Record<'_>) -> Result<usize, TransportError> {
        send_record(&mut &*self, record)
    }

    /// [`send_record_with_fds`] on this socket
    ///
    /// # Errors
    ///
    /// As [`send_all`].
    pub fn send_record_with_fds(
        &self,
        record: &Record<'_>,
        fds: &[BorrowedFd<'_>],
    ) -> Result<usize, TransportError> {
        send_record_with_fds(&mut &*self, record, fds)
    }

    /// [`send_segments`] on this socket
    ///
    /// # Errors
    ///
    /// As [`send_all`].
    pub fn send_segments(&self, segments: &[Segment<'_>]) -> Result<usize, TransportError> {
        send_segments(&mut &*self, segments)
    }

    /// [`send_segments_once`] on this socket
    ///
    /// # Errors
    ///
    /// `System { op: Send }` if the call fails.
    pub fn send_segments_once(&self, segments: &[Segment<'_>]) -> Result<usize, TransportError> {
        send_segments_once(&mut &*self, segments)
    }

    /// [`send_dynamic`] on this socket
    ///
    /// # Errors
    ///
    /// As [`send_dynamic`].
    pub fn send_dynamic(&self, values: &[&dyn Any]) -> Result<usize, TransportError> {
        send_dynamic(&mut &*self, values)
    }
}
