//! Frames carried by Initial packets
//!
//! Only a handful of frame types may legally appear before the handshake completes; this module
//! decodes exactly those and names everything else so violations can be reported precisely.
//! The ACK codec is complete (including ECN counts) because ACK validity must be checked even
//! though an ACK-bearing Initial never promotes a candidate.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{BufExt, BufMutExt};
use crate::transport_error::TransportError;

/// The exponent applied to ACK delays this endpoint encodes
///
/// Fixed at the protocol default regardless of what the peer advertises; the peer's declared
/// exponent applies only when decoding ACKs *from* that peer.
pub const ACK_DELAY_EXPONENT: u32 = 3;

/// A QUIC frame type identifier
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(u64);

impl From<Type> for u64 {
    fn from(x: Type) -> u64 {
        x.0
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub(crate) const $name: Type = Type($val);)*
        }

        impl fmt::Debug for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0),
                }
            }
        }

        impl fmt::Display for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x08..0x10).contains(&x) => f.write_str("STREAM"),
                    x if (0x30..0x32).contains(&x) => f.write_str("DATAGRAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

/// A frame decoded from an Initial packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// A contiguous run of PADDING bytes
    Padding(usize),
    /// Liveness probe
    Ping,
    /// Acknowledgements; legal in Initial packets but disqualifies a candidate from promotion
    Ack(Ack),
    /// Handshake bytes at an offset in the CRYPTO stream
    Crypto(Crypto),
    /// Connection teardown; disqualifies a candidate from promotion
    Close(Close),
    /// Path liveness challenge; path frames never appear in a legitimate first flight
    PathChallenge(u64),
    /// Path liveness response
    PathResponse(u64),
}

/// Handshake bytes at an offset in the CRYPTO stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Crypto {
    /// Byte offset in the stream
    pub offset: u64,
    /// The bytes themselves
    pub data: Bytes,
}

impl Crypto {
    /// Append this frame to `buf`
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(Type::CRYPTO.0);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

/// An inclusive range of acknowledged packet numbers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckRange {
    /// Smallest acknowledged packet number in the range
    pub smallest: u64,
    /// Largest acknowledged packet number in the range
    pub largest: u64,
}

/// ECN counts carried by an ACK_ECN frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EcnCounts {
    /// Packets received with the ECT(0) codepoint
    pub ect0: u64,
    /// Packets received with the ECT(1) codepoint
    pub ect1: u64,
    /// Packets received with the ECN-CE codepoint
    pub ce: u64,
}

/// Acknowledged packet numbers as descending inclusive ranges
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    /// The largest packet number acknowledged
    pub largest: u64,
    /// Raw delay value as carried on the wire
    pub delay: u64,
    /// Ranges in descending order, beginning with the one containing `largest`
    pub ranges: Vec<AckRange>,
    /// ECN counts, present iff this was an ACK_ECN frame
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    /// Decode an ACK body; the frame type byte has already been consumed
    ///
    /// Any computed packet number below zero is a `FRAME_ENCODING_ERROR`.
    pub fn decode<R: Buf>(ecn: bool, r: &mut R) -> Result<Self, TransportError> {
        let negative = || TransportError::FRAME_ENCODING_ERROR("negative packet number");
        let largest = r.get_var()?;
        let delay = r.get_var()?;
        let range_count = r.get_var()?;
        let first_range = r.get_var()?;
        let mut smallest = largest.checked_sub(first_range).ok_or_else(negative)?;
        let mut ranges = Vec::with_capacity(range_count.min(64) as usize + 1);
        ranges.push(AckRange { smallest, largest });
        for _ in 0..range_count {
            let gap = r.get_var()?;
            let len = r.get_var()?;
            let largest = smallest
                .checked_sub(gap)
                .and_then(|x| x.checked_sub(2))
                .ok_or_else(negative)?;
            smallest = largest.checked_sub(len).ok_or_else(negative)?;
            ranges.push(AckRange { smallest, largest });
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: r.get_var()?,
                ect1: r.get_var()?,
                ce: r.get_var()?,
            })
        } else {
            None
        };
        Ok(Self {
            largest,
            delay,
            ranges,
            ecn,
        })
    }

    /// Append this frame to `buf`
    ///
    /// `ranges` must be descending and non-adjacent, as maintained by decoding or by any sane
    /// ack tracker.
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(if self.ecn.is_some() {
            Type::ACK_ECN.0
        } else {
            Type::ACK.0
        });
        buf.write_var(self.largest);
        buf.write_var(self.delay);
        buf.write_var(self.ranges.len() as u64 - 1);
        let first = &self.ranges[0];
        debug_assert_eq!(first.largest, self.largest);
        buf.write_var(first.largest - first.smallest);
        let mut prev_smallest = first.smallest;
        for range in &self.ranges[1..] {
            buf.write_var(prev_smallest - range.largest - 2);
            buf.write_var(range.largest - range.smallest);
            prev_smallest = range.smallest;
        }
        if let Some(counts) = self.ecn {
            buf.write_var(counts.ect0);
            buf.write_var(counts.ect1);
            buf.write_var(counts.ce);
        }
    }

    /// Scale a delay measured locally into the wire encoding, using this endpoint's fixed
    /// exponent
    pub fn scale_delay(delay: std::time::Duration) -> u64 {
        (delay.as_micros() as u64) >> ACK_DELAY_EXPONENT
    }

    /// The delay in microseconds, given the exponent the *sender* of this frame advertised
    pub fn delay_micros(&self, ack_delay_exponent: u64) -> u64 {
        self.delay << ack_delay_exponent
    }

    /// Every acknowledged packet number
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges
            .iter()
            .flat_map(|range| range.smallest..=range.largest)
    }
}

/// Reason a peer is closing the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Close {
    /// The transport detected an error
    Connection(ConnectionClose),
    /// The application closed
    Application(ApplicationClose),
}

/// Transport-level close
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    /// A transport error code
    pub error_code: u64,
    /// The type of the frame that provoked the close, 0 when unknown
    pub frame_type: u64,
    /// Human-readable explanation
    pub reason: Bytes,
}

/// Application-level close
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    /// An application-defined error code
    pub error_code: u64,
    /// Human-readable explanation
    pub reason: Bytes,
}

/// Decodes the frames of an Initial packet payload
///
/// Yields an error for malformed frame bodies (`FRAME_ENCODING_ERROR`) and for frame types that
/// may not appear before the handshake completes (`PROTOCOL_VIOLATION`); iteration ends after
/// either.
pub struct Iter {
    bytes: Bytes,
}

impl Iter {
    /// Iterate over the frames in `payload`
    pub fn new(payload: Bytes) -> Self {
        Self { bytes: payload }
    }

    fn try_next(&mut self) -> Result<Frame, TransportError> {
        let ty = Type(self.bytes.get_var()?);
        Ok(match ty {
            Type::PADDING => {
                let mut len = 1;
                while self.bytes.first() == Some(&0) {
                    self.bytes.advance(1);
                    len += 1;
                }
                Frame::Padding(len)
            }
            Type::PING => Frame::Ping,
            Type::ACK => Frame::Ack(Ack::decode(false, &mut self.bytes)?),
            Type::ACK_ECN => Frame::Ack(Ack::decode(true, &mut self.bytes)?),
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let len = self.bytes.get_var()?;
                if offset.checked_add(len).map_or(true, |end| end >= 1 << 62) {
                    return Err(TransportError::FRAME_ENCODING_ERROR(
                        "CRYPTO frame overflows the stream",
                    ));
                }
                if len > self.bytes.remaining() as u64 {
                    return Err(TransportError::FRAME_ENCODING_ERROR(
                        "truncated CRYPTO frame",
                    ));
                }
                Frame::Crypto(Crypto {
                    offset,
                    data: self.bytes.split_to(len as usize),
                })
            }
            Type::CONNECTION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let frame_type = self.bytes.get_var()?;
                Frame::Close(Close::Connection(ConnectionClose {
                    error_code,
                    frame_type,
                    reason: self.reason()?,
                }))
            }
            Type::APPLICATION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                Frame::Close(Close::Application(ApplicationClose {
                    error_code,
                    reason: self.reason()?,
                }))
            }
            Type::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            Type::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            _ => {
                return Err(TransportError::PROTOCOL_VIOLATION(format!(
                    "{} frame not permitted in Initial packets",
                    ty
                )))
            }
        })
    }

    fn reason(&mut self) -> Result<Bytes, TransportError> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "truncated close reason",
            ));
        }
        Ok(self.bytes.split_to(len as usize))
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, TransportError>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                // Decoding is lost; don't return more frames
                self.bytes.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_error::Code;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn frames(payload: &'static [u8]) -> Result<Vec<Frame>, TransportError> {
        Iter::new(Bytes::from_static(payload)).collect()
    }

    fn acked(payload: &'static [u8]) -> Vec<u64> {
        match frames(payload).unwrap().pop().unwrap() {
            Frame::Ack(ack) => {
                let mut packets: Vec<_> = ack.iter().collect();
                packets.sort_unstable_by(|a, b| b.cmp(a));
                packets
            }
            frame => panic!("expected ACK, got {:?}", frame),
        }
    }

    #[test]
    fn ack_single_packet() {
        assert_eq!(acked(&[0x02, 0x00, 0x00, 0x00, 0x00]), vec![0]);
    }

    #[test]
    fn ack_multiple_ranges() {
        assert_eq!(
            acked(&[0x02, 0x0a, 0x00, 0x02, 0x02, 0x01, 0x01, 0x00, 0x02]),
            vec![10, 9, 8, 5, 4, 2, 1, 0]
        );
    }

    #[test]
    fn ack_ecn_negative_packet_number() {
        // Implied smallest-acked underflows to -1
        let err = frames(&[
            0x03, 0x02, 0x00, 0x01, 0x00, 0x01, 0x00, 0x70, 0x39, 0x70, 0x39, 0x70, 0x39,
        ])
        .unwrap_err();
        assert_eq!(err.code, Code::FRAME_ENCODING_ERROR);
        assert_eq!(err.reason, "negative packet number");
    }

    #[test]
    fn ack_round_trip() {
        let ack = Ack {
            largest: 10,
            delay: 1250,
            ranges: vec![
                AckRange {
                    smallest: 8,
                    largest: 10,
                },
                AckRange {
                    smallest: 4,
                    largest: 5,
                },
                AckRange {
                    smallest: 0,
                    largest: 2,
                },
            ],
            ecn: Some(EcnCounts {
                ect0: 12345,
                ect1: 12345,
                ce: 12345,
            }),
        };
        let mut buf = Vec::new();
        ack.encode(&mut buf);
        let mut iter = Iter::new(buf.into());
        assert_eq!(iter.next().unwrap().unwrap(), Frame::Ack(ack));
        assert!(iter.next().is_none());
    }

    #[test]
    fn ack_delay_scaling() {
        // delay of 10 ms on the wire: 10_000 us >> 3
        assert_eq!(Ack::scale_delay(Duration::from_millis(10)), 1250);
        let ack = Ack {
            largest: 0,
            delay: 1250,
            ranges: vec![AckRange {
                smallest: 0,
                largest: 0,
            }],
            ecn: None,
        };
        assert_eq!(ack.delay_micros(3), 10_000);
        // A peer advertising a different exponent changes only decoding
        assert_eq!(ack.delay_micros(4), 20_000);
    }

    #[test]
    fn padding_runs() {
        assert_eq!(
            frames(&[0x00, 0x00, 0x00, 0x01, 0x00]).unwrap(),
            vec![Frame::Padding(3), Frame::Ping, Frame::Padding(1)]
        );
    }

    #[test]
    fn crypto_frame() {
        let mut buf = Vec::new();
        Crypto {
            offset: 64,
            data: Bytes::from_static(b"hello"),
        }
        .encode(&mut buf);
        let decoded: Vec<_> = Iter::new(buf.into()).collect::<Result<_, _>>().unwrap();
        assert_matches!(
            &decoded[..],
            [Frame::Crypto(Crypto { offset: 64, data })] if &data[..] == b"hello"
        );
    }

    #[test]
    fn truncated_crypto_frame() {
        // Declares five bytes, carries two
        let err = frames(&[0x06, 0x00, 0x05, 0xaa, 0xbb]).unwrap_err();
        assert_eq!(err.code, Code::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn connection_close() {
        let mut buf = vec![0x1c];
        buf.write_var(0x0a); // PROTOCOL_VIOLATION
        buf.write_var(0x06); // offending frame type
        buf.write_var(3);
        buf.extend_from_slice(b"bye");
        let decoded: Vec<_> = Iter::new(buf.into()).collect::<Result<_, _>>().unwrap();
        assert_matches!(
            &decoded[..],
            [Frame::Close(Close::Connection(ConnectionClose { error_code: 0x0a, frame_type: 0x06, reason }))]
                if &reason[..] == b"bye"
        );
    }

    #[test]
    fn forbidden_frame_types() {
        // STREAM with offset+length bits
        let err = frames(&[0x0e, 0x00, 0x00, 0x01, 0xaa]).unwrap_err();
        assert_eq!(err.code, Code::PROTOCOL_VIOLATION);
        // NEW_TOKEN must never originate from a client at all
        let err = frames(&[0x07, 0x01, 0xaa]).unwrap_err();
        assert_eq!(err.code, Code::PROTOCOL_VIOLATION);
    }

    #[test]
    fn unknown_frame_type() {
        let err = frames(&[0x42, 0x21]).unwrap_err();
        assert_eq!(err.code, Code::PROTOCOL_VIOLATION);
    }
}
