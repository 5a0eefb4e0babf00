//! Message Segments
//!
//! The five value kinds a message can be assembled from, and their byte
//! representation on the wire. Fixed-width values are sent in host byte
//! order; byte and text segments are sent as-is.
//!
//! Values coming from a dynamically typed marshalling layer are classified
//! with [`Segment::from_any`]; anything that is not one of the five kinds is
//! rejected before a single byte is sent.

use std::any::Any;

use crate::error::TransportError;

/// One piece of an outgoing message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    /// 2-byte value
    Short(u16),
    /// 4-byte value
    Int(u32),
    /// 8-byte value
    Long(u64),
    /// Borrowed bytes
    Bytes(&'a [u8]),
    /// Borrowed text, sent as its UTF-8 bytes without terminator
    Text(&'a str),
}

impl<'a> Segment<'a> {
    /// Number of bytes this segment puts on the wire
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Short(_) => 2,
            Self::Int(_) => 4,
            Self::Long(_) => 8,
            Self::Bytes(b) => b.len(),
            Self::Text(t) => t.len(),
        }
    }

    /// Classify a marshalled value.
    ///
    /// Accepted: `u16`/`i16`, `u32`/`i32`, `u64`/`i64`, `Vec<u8>`,
    /// `Box<[u8]>`, `&'static [u8]`, `String`, `&'static str`. Signed values
    /// keep their bit pattern.
    ///
    /// # Errors
    ///
    /// `UnsupportedSegmentType { index }` for any other type.
    pub fn from_any(value: &'a dyn Any, index: usize) -> Result<Self, TransportError> {
        if let Some(v) = value.downcast_ref::<u16>() {
            return Ok(Self::Short(*v));
        }
        if let Some(v) = value.downcast_ref::<i16>() {
            return Ok(Self::Short(*v as u16));
        }
        if let Some(v) = value.downcast_ref::<u32>() {
            return Ok(Self::Int(*v));
        }
        if let Some(v) = value.downcast_ref::<i32>() {
            return Ok(Self::Int(*v as u32));
        }
        if let Some(v) = value.downcast_ref::<u64>() {
            return Ok(Self::Long(*v));
        }
        if let Some(v) = value.downcast_ref::<i64>() {
            return Ok(Self::Long(*v as u64));
        }
        if let Some(v) = value.downcast_ref::<Vec<u8>>() {
            return Ok(Self::Bytes(v));
        }
        if let Some(v) = value.downcast_ref::<Box<[u8]>>() {
            return Ok(Self::Bytes(v));
        }
        if let Some(v) = value.downcast_ref::<&'static [u8]>() {
            return Ok(Self::Bytes(v));
        }
        if let Some(v) = value.downcast_ref::<String>() {
            return Ok(Self::Text(v));
        }
        if let Some(v) = value.downcast_ref::<&'static str>() {
            return Ok(Self::Text(v));
        }
        Err(TransportError::UnsupportedSegmentType { index })
    }

    /// Classify a whole list; fails on the first unsupported value
    ///
    /// # Errors
    ///
    /// `UnsupportedSegmentType` naming the first offending index.
    pub fn classify_all(values: &[&'a dyn Any]) -> Result<Vec<Self>, TransportError> {
        values
            .iter()
            .enumerate()
            .map(|(index, value)| Self::from_any(*value, index))
            .collect()
    }
}

/// Wire bytes of one segment: fixed values in an owned slot, the rest borrowed
#[derive(Clone, Copy, Debug)]
pub(crate) enum Encoded<'a> {
    Inline { slot: [u8; 8], len: usize },
    Borrowed(&'a [u8]),
}

impl<'a> Encoded<'a> {
    fn inline(bytes: &[u8]) -> Self {
        let mut slot = [0u8; 8];
        slot[..bytes.len()].copy_from_slice(bytes);
        Self::Inline {
            slot,
            len: bytes.len(),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Inline { slot, len } => &slot[..*len],
            Self::Borrowed(bytes) => bytes,
        }
    }
}

impl<'a> From<&Segment<'a>> for Encoded<'a> {
    fn from(segment: &Segment<'a>) -> Self {
        match *segment {
            Segment::Short(v) => Self::inline(&v.to_ne_bytes()),
            Segment::Int(v) => Self::inline(&v.to_ne_bytes()),
            Segment::Long(v) => Self::inline(&v.to_ne_bytes()),
            Segment::Bytes(b) => Self::Borrowed(b),
            Segment::Text(t) => Self::Borrowed(t.as_bytes()),
        }
    }
}

/// Backing storage for one send call.
///
/// Holds the encoded form of every segment; dropped when the call returns.
pub(crate) fn encode_all<'a>(segments: &[Segment<'a>]) -> Vec<Encoded<'a>> {
    segments.iter().map(Encoded::from).collect()
}

/// Contiguous wire bytes of `segments`
#[must_use]
pub fn to_wire_bytes(segments: &[Segment<'_>]) -> Vec<u8> {
    let total = segments.iter().map(Segment::encoded_len).sum();
    let mut out = Vec::with_capacity(total);
    for encoded in encode_all(segments) {
        out.extend_from_slice(encoded.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_bytes_in_order() {
        let segments = [Segment::Short(7), Segment::Bytes(b"ab"), Segment::Text("xy")];
        let mut expected = 7u16.to_ne_bytes().to_vec();
        expected.extend_from_slice(b"abxy");
        assert_eq!(to_wire_bytes(&segments), expected);
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(Segment::Short(1).encoded_len(), 2);
        assert_eq!(Segment::Int(1).encoded_len(), 4);
        assert_eq!(Segment::Long(1).encoded_len(), 8);
        assert_eq!(
            to_wire_bytes(&[Segment::Long(0x0102_0304_0506_0708)]),
            0x0102_0304_0506_0708u64.to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_from_any_classifies() {
        let short: u16 = 7;
        let signed: i32 = -1;
        let bytes: Vec<u8> = b"ab".to_vec();
        let text = String::from("xy");
        let literal: &'static str = "lit";

        let values: [&dyn Any; 5] = [&short, &signed, &bytes, &text, &literal];
        let segments = Segment::classify_all(&values).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Short(7),
                Segment::Int(u32::MAX),
                Segment::Bytes(b"ab"),
                Segment::Text("xy"),
                Segment::Text("lit"),
            ]
        );
    }

    #[test]
    fn test_from_any_rejects_unknown() {
        let float = 1.5f64;
        let short: u16 = 1;
        let values: [&dyn Any; 2] = [&short, &float];
        assert!(matches!(
            Segment::classify_all(&values),
            Err(TransportError::UnsupportedSegmentType { index: 1 })
        ));
    }
}
