//! Pending Vector
//!
//! The not-yet-accepted remainder of a scatter-gather message. After each
//! `sendmsg` the vector is advanced by the number of bytes the kernel took:
//! fully consumed segments become empty and the cursor moves past them, a
//! partly consumed segment is re-sliced in place. Nothing is copied.

use std::io::IoSlice;

/// Most slices passed to one `sendmsg` (`IOV_MAX` on Linux and the BSDs)
pub const MAX_IOVECS: usize = 1024;

/// Remaining views over a message's segments
#[derive(Debug)]
pub struct PendingVector<'a> {
    segments: Vec<&'a [u8]>,
    cursor: usize,
}

impl<'a> PendingVector<'a> {
    /// Start with every segment fully pending
    pub fn new(segments: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut pending = Self {
            segments: segments.into_iter().collect(),
            cursor: 0,
        };
        pending.skip_empty();
        pending
    }

    fn skip_empty(&mut self) {
        while self.segments.get(self.cursor).is_some_and(|s| s.is_empty()) {
            self.cursor += 1;
        }
    }

    /// Consume `accepted` bytes from the front.
    ///
    /// Returns the number of bytes that did not fit, which is zero unless
    /// the kernel reported more than was offered.
    pub fn advance(&mut self, mut accepted: usize) -> usize {
        while let Some(segment) = self.segments.get_mut(self.cursor) {
            if accepted >= segment.len() {
                accepted -= segment.len();
                *segment = &[];
                self.cursor += 1;
            } else {
                *segment = &segment[accepted..];
                accepted = 0;
                break;
            }
        }
        self.skip_empty();
        accepted
    }

    /// Whether every byte has been accepted
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.cursor >= self.segments.len()
    }

    /// Bytes still pending
    #[must_use]
    pub fn remaining_len(&self) -> usize {
        self.remaining().map(<[u8]>::len).sum()
    }

    /// Non-empty pending views, in order
    pub fn remaining(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.segments[self.cursor.min(self.segments.len())..]
            .iter()
            .copied()
            .filter(|s| !s.is_empty())
    }

    /// The slice table for the next `sendmsg`, capped at [`MAX_IOVECS`]
    #[must_use]
    pub fn io_slices(&self) -> Vec<IoSlice<'a>> {
        self.remaining().take(MAX_IOVECS).map(IoSlice::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(pending: &PendingVector<'_>) -> Vec<u8> {
        pending.remaining().flatten().copied().collect()
    }

    #[test]
    fn test_advance_within_segment() {
        let mut pending = PendingVector::new([&b"hello"[..], b"world"]);
        assert_eq!(pending.advance(2), 0);
        assert_eq!(flatten(&pending), b"lloworld");
        assert_eq!(pending.remaining_len(), 8);
    }

    #[test]
    fn test_advance_across_segments() {
        let mut pending = PendingVector::new([&b"ab"[..], b"cd", b"efg"]);
        pending.advance(5);
        assert_eq!(flatten(&pending), b"fg");
        assert_eq!(pending.io_slices().len(), 1);
    }

    #[test]
    fn test_advance_exact_boundary_drains() {
        let mut pending = PendingVector::new([&b"ab"[..], b"cd"]);
        pending.advance(2);
        assert_eq!(flatten(&pending), b"cd");
        pending.advance(2);
        assert!(pending.is_drained());
        assert!(pending.io_slices().is_empty());
    }

    #[test]
    fn test_empty_segments_skipped() {
        let mut pending = PendingVector::new([&b""[..], b"a", b"", b"", b"b"]);
        assert_eq!(pending.io_slices().len(), 2);
        pending.advance(1);
        assert_eq!(flatten(&pending), b"b");

        let empty = PendingVector::new([&b""[..], b""]);
        assert!(empty.is_drained());
    }

    #[test]
    fn test_zero_advance_keeps_everything() {
        let mut pending = PendingVector::new([&b"abc"[..]]);
        pending.advance(0);
        assert_eq!(flatten(&pending), b"abc");
    }

    #[test]
    fn test_overshoot_reported() {
        let mut pending = PendingVector::new([&b"abc"[..]]);
        assert_eq!(pending.advance(5), 2);
        assert!(pending.is_drained());
    }

    #[test]
    fn test_io_slices_capped() {
        let byte = [1u8];
        let pending = PendingVector::new(std::iter::repeat(&byte[..]).take(MAX_IOVECS + 10));
        assert_eq!(pending.io_slices().len(), MAX_IOVECS);
        assert_eq!(pending.remaining_len(), MAX_IOVECS + 10);
    }
}
