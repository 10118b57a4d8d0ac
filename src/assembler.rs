//! Reassembly of the CRYPTO stream from out-of-order frames
//!
//! The first handshake flight may be fragmented across several Initial packets arriving in any
//! order, each carrying CRYPTO bytes at an explicit offset. Unlike a generic stream assembler,
//! this one verifies that retransmitted bytes match what was first received: conflicting content
//! under one connection ID means two senders are racing for it, and the candidate must die rather
//! than guess which one is genuine.

use std::fmt;

use thiserror::Error;

/// Failures while inserting CRYPTO bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum AssembleError {
    /// An overlapping retransmission carried different bytes than first received
    #[error("inconsistent retransmitted handshake data")]
    Inconsistent,
    /// More data would be buffered than the configured bound
    #[error("handshake data exceeds buffer limit")]
    BufferExceeded,
}

/// Buffers CRYPTO bytes by offset and exposes the contiguous prefix
pub struct Assembler {
    buf: Vec<u8>,
    received: RangeSet,
    max_buffered: usize,
}

impl Assembler {
    /// An empty assembler retaining at most `max_buffered` bytes
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buf: Vec::new(),
            received: RangeSet::default(),
            max_buffered,
        }
    }

    /// Record `data` at `offset` in the stream
    ///
    /// Bytes already received at overlapping offsets must be identical.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), AssembleError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(AssembleError::BufferExceeded)?;
        if end > self.max_buffered as u64 {
            return Err(AssembleError::BufferExceeded);
        }
        let (offset, end) = (offset as usize, end as usize);
        // Verify every previously received overlap before committing anything
        for (start, stop) in self.received.overlapping(offset, end) {
            if self.buf[start..stop] != data[start - offset..stop - offset] {
                return Err(AssembleError::Inconsistent);
            }
        }
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        self.received.insert(offset, end);
        Ok(())
    }

    /// The contiguous bytes assembled from offset zero
    pub fn prefix(&self) -> &[u8] {
        &self.buf[..self.received.prefix_from_zero()]
    }
}

impl fmt::Debug for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assembler")
            .field("prefix_len", &self.received.prefix_from_zero())
            .field("buffered", &self.buf.len())
            .field("max_buffered", &self.max_buffered)
            .finish()
    }
}

/// Disjoint half-open ranges, kept sorted and coalesced
#[derive(Debug, Default)]
struct RangeSet(Vec<(usize, usize)>);

impl RangeSet {
    fn insert(&mut self, start: usize, end: usize) {
        debug_assert!(start < end);
        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.0.len() + 1);
        for &(a, b) in &self.0 {
            if b < merged.0 || merged.1 < a {
                out.push((a, b));
            } else {
                merged = (merged.0.min(a), merged.1.max(b));
            }
        }
        out.push(merged);
        out.sort_unstable();
        self.0 = out;
    }

    /// Received ranges clipped to `[start, end)`
    fn overlapping<'a>(
        &'a self,
        start: usize,
        end: usize,
    ) -> impl Iterator<Item = (usize, usize)> + 'a {
        self.0
            .iter()
            .filter(move |&&(a, b)| a < end && start < b)
            .map(move |&(a, b)| (a.max(start), b.min(end)))
    }

    /// Length of the contiguous prefix beginning at zero
    fn prefix_from_zero(&self) -> usize {
        match self.0.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(0, b"hello ").unwrap();
        assembler.insert(6, b"world").unwrap();
        assert_eq!(assembler.prefix(), b"hello world");
    }

    #[test]
    fn out_of_order() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(6, b"world").unwrap();
        assert_eq!(assembler.prefix(), b"");
        assembler.insert(0, b"hello ").unwrap();
        assert_eq!(assembler.prefix(), b"hello world");
    }

    #[test]
    fn hole_blocks_prefix() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(0, b"ab").unwrap();
        assembler.insert(3, b"d").unwrap();
        assert_eq!(assembler.prefix(), b"ab");
        assembler.insert(2, b"c").unwrap();
        assert_eq!(assembler.prefix(), b"abcd");
    }

    #[test]
    fn matching_overlap_accepted() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(0, b"hello world").unwrap();
        assembler.insert(6, b"world").unwrap();
        assembler.insert(0, b"hello world").unwrap();
        assert_eq!(assembler.prefix(), b"hello world");
    }

    #[test]
    fn conflicting_overlap_rejected() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(0, b"hello world").unwrap();
        assert_eq!(
            assembler.insert(6, b"earth"),
            Err(AssembleError::Inconsistent)
        );
        // Nothing was overwritten
        assert_eq!(assembler.prefix(), b"hello world");
    }

    #[test]
    fn conflict_detected_across_disjoint_ranges() {
        let mut assembler = Assembler::new(1024);
        assembler.insert(0, b"ab").unwrap();
        assembler.insert(4, b"ef").unwrap();
        // Spans both received ranges, differing in the second
        assert_eq!(
            assembler.insert(0, b"abcdEf"),
            Err(AssembleError::Inconsistent)
        );
        assert_eq!(assembler.insert(0, b"abcdef"), Ok(()));
        assert_eq!(assembler.prefix(), b"abcdef");
    }

    #[test]
    fn buffer_bound() {
        let mut assembler = Assembler::new(8);
        assembler.insert(0, b"12345678").unwrap();
        assert_eq!(
            assembler.insert(8, b"9"),
            Err(AssembleError::BufferExceeded)
        );
        assert_eq!(
            assembler.insert(u64::MAX, b"x"),
            Err(AssembleError::BufferExceeded)
        );
    }
}
