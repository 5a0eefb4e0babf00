//! Record Framing
//!
//! Fixed-field records as exchanged between producers and the receiver.
//!
//! # Record Format
//!
//! ```text
//! +-------------+-------------+----------------+----------------+
//! | Version (2) | Type (2)    | Data length (8)| Meta length (8)|
//! +-------------+-------------+----------------+----------------+
//! | Payload (data length) | "BREAK" |     (absent for JournalFd)
//! +-----------------------+---------+
//! | Metadata (meta length)| "BREAK" |
//! +-----------------------+---------+
//! ```
//!
//! All integers are in host byte order; both ends live on the same machine.
//! A `JournalFd` record carries its payload as a passed descriptor, so the
//! data length describes the descriptor's contents and no payload bytes
//! follow the header.

use std::fmt;

use crate::error::TransportError;
use crate::segment::Segment;

/// Protocol version written into every header
pub const PROTOCOL_VERSION: u16 = 1;

/// Delimiter after the payload and after the metadata
pub const BREAK: &[u8] = b"BREAK";

/// Header size: version, type, data length, metadata length
pub const HEADER_LEN: usize = 2 + 2 + 8 + 8;

/// Default limit for either variable-length field (10 MB)
pub const DEFAULT_MAX_FIELD_LEN: u64 = 10 * 1024 * 1024;

/// Largest limit either variable-length field may be configured with
pub const MAX_FIELD_LIMIT: u64 = isize::MAX as u64 - (HEADER_LEN + 2 * BREAK.len()) as u64;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Kind of record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Application log entry
    Log = 1,
    /// Audit event
    Audit = 2,
    /// Journal data carried inline
    Journal = 3,
    /// Journal data carried by a passed descriptor
    JournalFd = 4,
}

impl MessageType {
    /// Wire value
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether payload bytes follow the header
    #[must_use]
    pub fn carries_payload(self) -> bool {
        self != Self::JournalFd
    }

    /// Lowercase name, as used in logs and on the command line
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Audit => "audit",
            Self::Journal => "journal",
            Self::JournalFd => "journal-fd",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Log),
            2 => Ok(Self::Audit),
            3 => Ok(Self::Journal),
            4 => Ok(Self::JournalFd),
            other => Err(TransportError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "audit" => Ok(Self::Audit),
            "journal" => Ok(Self::Journal),
            "journal-fd" | "journal_fd" => Ok(Self::JournalFd),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// The fixed fields at the start of every record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Protocol version, [`PROTOCOL_VERSION`] for records built here
    pub protocol_version: u16,
    /// Record kind
    pub message_type: MessageType,
    /// Payload length in bytes
    pub data_len: u64,
    /// Metadata length in bytes
    pub meta_len: u64,
}

impl ConnectionHeader {
    /// Header for the current protocol version
    #[must_use]
    pub fn new(message_type: MessageType, data_len: u64, meta_len: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_type,
            data_len,
            meta_len,
        }
    }

    /// Wire form of the header
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.protocol_version.to_ne_bytes());
        out[2..4].copy_from_slice(&self.message_type.as_u16().to_ne_bytes());
        out[4..12].copy_from_slice(&self.data_len.to_ne_bytes());
        out[12..20].copy_from_slice(&self.meta_len.to_ne_bytes());
        out
    }

    /// Parse a header.
    ///
    /// # Errors
    ///
    /// - `MalformedFrame` for a protocol version other than [`PROTOCOL_VERSION`]
    /// - `UnknownMessageType` for a type outside 1..=4
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, TransportError> {
        let protocol_version = u16::from_ne_bytes([bytes[0], bytes[1]]);
        if protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::MalformedFrame(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let message_type = MessageType::try_from(u16::from_ne_bytes([bytes[2], bytes[3]]))?;

        let mut data_len = [0u8; 8];
        data_len.copy_from_slice(&bytes[4..12]);
        let mut meta_len = [0u8; 8];
        meta_len.copy_from_slice(&bytes[12..20]);

        Ok(Self {
            protocol_version,
            message_type,
            data_len: u64::from_ne_bytes(data_len),
            meta_len: u64::from_ne_bytes(meta_len),
        })
    }

    /// Bytes following the header, both delimiters included
    #[must_use]
    pub fn body_len(&self) -> u64 {
        let payload = if self.message_type.carries_payload() {
            self.data_len.saturating_add(BREAK.len() as u64)
        } else {
            0
        };
        payload
            .saturating_add(self.meta_len)
            .saturating_add(BREAK.len() as u64)
    }
}

/// An outgoing record borrowing its payload and metadata
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record<'a> {
    message_type: MessageType,
    data_len: u64,
    payload: &'a [u8],
    metadata: &'a [u8],
}

impl<'a> Record<'a> {
    /// A record whose payload travels inline.
    ///
    /// For [`MessageType::JournalFd`] use [`Record::journal_fd`] instead;
    /// a payload given here would be announced but never sent.
    #[must_use]
    pub fn new(message_type: MessageType, payload: &'a [u8], metadata: &'a [u8]) -> Self {
        Self {
            message_type,
            data_len: payload.len() as u64,
            payload: if message_type.carries_payload() { payload } else { &[] },
            metadata,
        }
    }

    /// A journal record whose `data_len` bytes are read from a passed descriptor
    #[must_use]
    pub fn journal_fd(data_len: u64, metadata: &'a [u8]) -> Self {
        Self {
            message_type: MessageType::JournalFd,
            data_len,
            payload: &[],
            metadata,
        }
    }

    /// Record kind
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Inline payload, empty for `JournalFd`
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Metadata block
    #[must_use]
    pub fn metadata(&self) -> &'a [u8] {
        self.metadata
    }

    /// The header announcing this record
    #[must_use]
    pub fn header(&self) -> ConnectionHeader {
        ConnectionHeader::new(self.message_type, self.data_len, self.metadata.len() as u64)
    }

    /// Ordered wire segments
    #[must_use]
    pub fn segments(&self) -> Vec<Segment<'a>> {
        let mut segments = vec![
            Segment::Short(PROTOCOL_VERSION),
            Segment::Short(self.message_type.as_u16()),
            Segment::Long(self.data_len),
            Segment::Long(self.metadata.len() as u64),
        ];
        if self.message_type.carries_payload() {
            segments.push(Segment::Bytes(self.payload));
            segments.push(Segment::Bytes(BREAK));
        }
        segments.push(Segment::Bytes(self.metadata));
        segments.push(Segment::Bytes(BREAK));
        segments
    }

    /// Bytes this record puts on the wire
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.segments().iter().map(Segment::encoded_len).sum()
    }
}

/// A record read off the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Fixed fields as received
    pub header: ConnectionHeader,
    /// Inline payload, empty for `JournalFd`
    pub payload: Vec<u8>,
    /// Metadata block
    pub metadata: Vec<u8>,
}

/// Size limits applied while decoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLimits {
    /// Largest accepted inline payload
    pub max_payload_len: u64,
    /// Largest accepted metadata block
    pub max_metadata_len: u64,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_FIELD_LEN,
            max_metadata_len: DEFAULT_MAX_FIELD_LEN,
        }
    }
}

/// Decoder state machine for streaming record parsing
///
/// Buffers incoming bytes and yields complete records. After an error the
/// stream position is unknown; discard the decoder and the connection.
#[derive(Debug)]
pub struct RecordDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    limits: RecordLimits,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDecoder {
    /// Create a decoder with the default limits
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(RecordLimits::default())
    }

    /// Create a decoder with explicit limits
    #[must_use]
    pub fn with_limits(limits: RecordLimits) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            limits,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next record
    ///
    /// Returns:
    /// - `Ok(Some(record))` if a complete record was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(UnknownMessageType)` for a type outside 1..=4
    /// - `Err(FrameTooLarge)` if a declared length exceeds its limit
    /// - `Err(MalformedFrame)` for a bad version or a missing delimiter
    pub fn decode(&mut self) -> Result<Option<DecodedRecord>, TransportError> {
        if self.available() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + HEADER_LEN]);
        let header = ConnectionHeader::from_bytes(&raw)?;
        self.check_limits(&header)?;

        let body_len = header.body_len();
        let needed = usize::try_from(body_len)
            .ok()
            .and_then(|body| body.checked_add(HEADER_LEN))
            .ok_or(TransportError::FrameTooLarge {
                field: "record",
                len: body_len,
                max: u64::try_from(usize::MAX - HEADER_LEN).unwrap_or(u64::MAX),
            })?;
        if self.available() < needed {
            return Ok(None);
        }

        let mut pos = self.read_pos + HEADER_LEN;
        let payload = if header.message_type.carries_payload() {
            let payload = self.take_delimited(&mut pos, field_len(header.data_len), "payload")?;
            payload.to_vec()
        } else {
            Vec::new()
        };
        let metadata = self
            .take_delimited(&mut pos, field_len(header.meta_len), "metadata")?
            .to_vec();

        self.read_pos = pos;

        Ok(Some(DecodedRecord {
            header,
            payload,
            metadata,
        }))
    }

    fn check_limits(&self, header: &ConnectionHeader) -> Result<(), TransportError> {
        if header.message_type.carries_payload() && header.data_len > self.limits.max_payload_len {
            return Err(TransportError::FrameTooLarge {
                field: "payload",
                len: header.data_len,
                max: self.limits.max_payload_len,
            });
        }
        if header.meta_len > self.limits.max_metadata_len {
            return Err(TransportError::FrameTooLarge {
                field: "metadata",
                len: header.meta_len,
                max: self.limits.max_metadata_len,
            });
        }
        Ok(())
    }

    fn take_delimited(
        &self,
        pos: &mut usize,
        len: usize,
        field: &str,
    ) -> Result<&[u8], TransportError> {
        let body = &self.buffer[*pos..*pos + len];
        let delimiter = &self.buffer[*pos + len..*pos + len + BREAK.len()];
        if delimiter != BREAK {
            return Err(TransportError::MalformedFrame(format!(
                "missing delimiter after {field}"
            )));
        }
        *pos += len + BREAK.len();
        Ok(body)
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// A field length already known to fit in the buffered record
fn field_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::to_wire_bytes;
    use pretty_assertions::assert_eq;

    fn wire(record: &Record<'_>) -> Vec<u8> {
        to_wire_bytes(&record.segments())
    }

    #[test]
    fn test_record_layout() {
        let record = Record::new(MessageType::Log, b"0123456789", b"meta!");
        let bytes = wire(&record);

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u16.to_ne_bytes());
        expected.extend_from_slice(&1u16.to_ne_bytes());
        expected.extend_from_slice(&10u64.to_ne_bytes());
        expected.extend_from_slice(&5u64.to_ne_bytes());
        expected.extend_from_slice(b"0123456789BREAKmeta!BREAK");

        assert_eq!(bytes, expected);
        assert_eq!(record.wire_len(), HEADER_LEN + 10 + 5 + 5 + 5);
        assert_eq!(&bytes[..HEADER_LEN], &record.header().to_bytes());
    }

    #[test]
    fn test_journal_fd_has_no_payload_section() {
        let record = Record::journal_fd(4096, b"meta");
        let bytes = wire(&record);

        assert_eq!(bytes.len(), HEADER_LEN + 4 + BREAK.len());
        assert_eq!(&bytes[HEADER_LEN..], b"metaBREAK");
        assert_eq!(record.header().data_len, 4096);
        assert_eq!(record.header().body_len(), 9);
    }

    #[test]
    fn test_message_type_parse() {
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Journal);
        assert!(matches!(
            MessageType::try_from(9),
            Err(TransportError::UnknownMessageType(9))
        ));
        assert_eq!("journal-fd".parse::<MessageType>().unwrap(), MessageType::JournalFd);
        assert!("bogus".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let record = Record::new(MessageType::Audit, b"payload", b"m");
        let bytes = wire(&record);

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes[..HEADER_LEN - 1]);
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.push(&bytes[HEADER_LEN - 1..bytes.len() - 1]);
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.push(&bytes[bytes.len() - 1..]);
        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.header, record.header());
        assert_eq!(decoded.payload, b"payload");
        assert_eq!(decoded.metadata, b"m");
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_decode_multiple_records() {
        let first = Record::new(MessageType::Log, b"one", b"");
        let second = Record::journal_fd(12, b"fd-meta");

        let mut bytes = wire(&first);
        bytes.extend(wire(&second));

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes);

        let a = decoder.decode().unwrap().unwrap();
        let b = decoder.decode().unwrap().unwrap();
        assert_eq!(a.payload, b"one");
        assert_eq!(b.header.message_type, MessageType::JournalFd);
        assert!(b.payload.is_empty());
        assert_eq!(b.metadata, b"fd-meta");
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_decode_missing_delimiter() {
        let mut bytes = wire(&Record::new(MessageType::Log, b"abc", b"xy"));
        // Corrupt the first delimiter.
        bytes[HEADER_LEN + 3] = b'X';

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.decode(), Err(TransportError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut bytes = wire(&Record::new(MessageType::Log, b"abc", b""));
        bytes[2..4].copy_from_slice(&7u16.to_ne_bytes());

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn test_decode_bad_version() {
        let mut bytes = wire(&Record::new(MessageType::Log, b"", b""));
        bytes[0..2].copy_from_slice(&2u16.to_ne_bytes());

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.decode(), Err(TransportError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let limits = RecordLimits {
            max_payload_len: 4,
            max_metadata_len: 4,
        };
        let mut decoder = RecordDecoder::with_limits(limits);
        // Only the header is needed to reject the record.
        decoder.push(&ConnectionHeader::new(MessageType::Journal, 5, 0).to_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::FrameTooLarge { field: "payload", len: 5, max: 4 })
        ));

        let mut decoder = RecordDecoder::with_limits(limits);
        decoder.push(&ConnectionHeader::new(MessageType::Log, 0, 1 << 40).to_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::FrameTooLarge { field: "metadata", .. })
        ));
    }

    #[test]
    fn test_decode_length_overflow_is_rejected() {
        let limits = RecordLimits {
            max_payload_len: u64::MAX,
            max_metadata_len: u64::MAX,
        };
        let mut decoder = RecordDecoder::with_limits(limits);
        decoder.push(&ConnectionHeader::new(MessageType::Log, u64::MAX - 4, 0).to_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::FrameTooLarge { field: "record", .. })
        ));

        let mut decoder = RecordDecoder::with_limits(limits);
        decoder.push(&ConnectionHeader::new(MessageType::Audit, 0, u64::MAX).to_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::FrameTooLarge { field: "record", .. })
        ));
    }

    #[test]
    fn test_journal_fd_data_len_not_limited() {
        let limits = RecordLimits {
            max_payload_len: 1,
            max_metadata_len: 16,
        };
        let mut decoder = RecordDecoder::with_limits(limits);
        decoder.push(&wire(&Record::journal_fd(1 << 30, b"m")));
        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.header.data_len, 1 << 30);
    }

    #[test]
    fn test_compaction_keeps_pending_bytes() {
        let payload = vec![7u8; MIN_BUFFER_CAPACITY];
        let record = Record::new(MessageType::Journal, &payload, b"");
        let bytes = wire(&record);

        let mut decoder = RecordDecoder::new();
        decoder.push(&bytes);
        decoder.push(&bytes[..10]);
        assert!(decoder.decode().unwrap().is_some());

        // This push compacts the consumed first record away.
        decoder.push(&bytes[10..]);
        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoder.available(), 0);
    }
}
