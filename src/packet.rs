//! Initial packet coding
//!
//! Covers exactly the packets the admission path must read and write: RFC 9000 long headers of
//! type Initial, sealed with the deterministic keys of [`crate::crypto::ring::InitialKeys`].
//! Handshake, 0-RTT and short-header packets arriving before a connection exists are opaque here;
//! the candidate retains them as trailing bytes for the connection to consume after promotion.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::crypto::ring::InitialKeys;
use crate::crypto::{HeaderKey, PacketKey};
use crate::shared::ConnectionId;
use crate::{is_supported_version, Side, MAX_CID_SIZE};

const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// Long packet types under v1 bit assignments
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    /// Carries the first flight of the cryptographic handshake
    Initial,
    /// Carries early data
    ZeroRtt,
    /// Carries the remainder of the cryptographic handshake
    Handshake,
    /// Carries a retry token; never processed before a connection exists
    Retry,
}

/// Whether `first` opens a long header
pub fn is_long_header(first: u8) -> bool {
    first & LONG_HEADER_FORM != 0
}

/// Classify a long header's packet type from its first byte
pub fn long_packet_type(first: u8) -> Option<LongType> {
    if !is_long_header(first) {
        return None;
    }
    Some(match (first >> 4) & 0b11 {
        0b00 => LongType::Initial,
        0b01 => LongType::ZeroRtt,
        0b10 => LongType::Handshake,
        _ => LongType::Retry,
    })
}

/// Errors surfaced while reading a packet
///
/// Before a connection exists every one of these is handled by silently dropping the datagram;
/// `UnsupportedVersion` is distinguished so a version-negotiation responder could act on it.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PacketDecodeError {
    /// The packet's version is not processed by this endpoint
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        /// The version the peer asked for
        version: u32,
    },
    /// The header violates the wire format
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// The packet names a connection other than the expected one
    #[error("packet destined for a different connection")]
    UnexpectedDcid,
    /// The payload did not authenticate under the Initial keys
    #[error("failed to authenticate packet")]
    Decrypt,
}

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

/// An Initial packet's header fields, read without touching packet protection
#[derive(Debug, Clone)]
pub struct ProtectedHeader {
    version: u32,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    token: Bytes,
    /// The Length field: packet number plus sealed payload
    length: usize,
    pn_offset: usize,
}

impl ProtectedHeader {
    /// Parse the header of the Initial packet at the front of `buf`
    ///
    /// `buf` may extend past the packet; coalesced packets are untouched.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketDecodeError> {
        let mut r = buf;
        let first = BufExt::get::<u8>(&mut r)?;
        if !is_long_header(first) {
            return Err(PacketDecodeError::InvalidHeader("not a long header"));
        }
        let version = BufExt::get::<u32>(&mut r)?;
        if !is_supported_version(version) {
            return Err(PacketDecodeError::UnsupportedVersion { version });
        }
        if first & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        if long_packet_type(first) != Some(LongType::Initial) {
            return Err(PacketDecodeError::InvalidHeader("not an Initial packet"));
        }
        let dst_cid_len = BufExt::get::<u8>(&mut r)? as usize;
        if dst_cid_len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        let dst_cid = ConnectionId::from_buf(&mut r, dst_cid_len)?;
        let src_cid_len = BufExt::get::<u8>(&mut r)? as usize;
        if src_cid_len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        let src_cid = ConnectionId::from_buf(&mut r, src_cid_len)?;
        let token_len = r.get_var()?;
        if token_len > r.remaining() as u64 {
            return Err(PacketDecodeError::InvalidHeader("malformed token"));
        }
        let token = Bytes::copy_from_slice(&r[..token_len as usize]);
        r.advance(token_len as usize);
        let length = r.get_var()?;
        let pn_offset = buf.len() - r.remaining();
        if length > r.remaining() as u64 {
            return Err(PacketDecodeError::InvalidHeader(
                "packet length longer than datagram",
            ));
        }
        Ok(Self {
            version,
            dst_cid,
            src_cid,
            token,
            length: length as usize,
            pn_offset,
        })
    }

    /// The version the client is speaking
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The connection the packet is addressed to
    pub fn dst_cid(&self) -> &ConnectionId {
        &self.dst_cid
    }

    /// Total bytes the sealed packet occupies in its datagram
    pub fn packet_len(&self) -> usize {
        self.pn_offset + self.length
    }
}

/// An Initial packet's header after header-protection removal
#[derive(Debug, Clone)]
pub struct InitialHeader {
    /// The version the client is speaking
    pub version: u32,
    /// The connection the packet is addressed to
    pub dst_cid: ConnectionId,
    /// The sender's chosen connection ID
    pub src_cid: ConnectionId,
    /// Address-validation token; empty unless a Retry or NEW_TOKEN preceded this attempt
    pub token: Bytes,
    /// Expanded packet number
    pub number: u64,
}

/// A fully unsealed Initial packet
#[derive(Debug, Clone)]
pub struct InitialPacket {
    /// Unprotected header fields
    pub header: InitialHeader,
    /// Decrypted frame bytes
    pub payload: Bytes,
    /// Bytes the sealed packet occupied in its datagram, exposing any coalesced remainder
    pub packet_len: usize,
}

/// Remove header protection and decrypt the packet described by `header`
///
/// `expected_pn` is the next packet number the caller anticipates from this peer, used to expand
/// the truncated wire form.
pub fn unseal(
    header: ProtectedHeader,
    datagram: &[u8],
    keys: &InitialKeys,
    expected_pn: u64,
) -> Result<InitialPacket, PacketDecodeError> {
    let total = header.packet_len();
    debug_assert!(total <= datagram.len());
    let sample_end = header.pn_offset + 4 + keys.header.remote.sample_size();
    if sample_end > total {
        return Err(PacketDecodeError::InvalidHeader(
            "packet too short to sample",
        ));
    }
    let mut packet = BytesMut::from(&datagram[..total]);
    keys.header.remote.decrypt(header.pn_offset, &mut packet);
    let first = packet[0];
    let pn_len = (first & 0b11) as usize + 1;
    if header.length < pn_len + keys.packet.remote.tag_len() {
        return Err(PacketDecodeError::Decrypt);
    }
    let mut truncated = 0u64;
    for &byte in &packet[header.pn_offset..header.pn_offset + pn_len] {
        truncated = truncated << 8 | u64::from(byte);
    }
    let number = expand_pn(truncated, 8 * pn_len as u32, expected_pn);

    let mut payload = packet.split_off(header.pn_offset + pn_len);
    keys.packet
        .remote
        .decrypt(number, &packet, &mut payload)
        .map_err(|_| PacketDecodeError::Decrypt)?;
    // Only authenticated packets may be treated as protocol violations
    if first & 0b0000_1100 != 0 {
        return Err(PacketDecodeError::InvalidHeader("reserved bits set"));
    }
    Ok(InitialPacket {
        header: InitialHeader {
            version: header.version,
            dst_cid: header.dst_cid,
            src_cid: header.src_cid,
            token: header.token,
            number,
        },
        payload: payload.freeze(),
        packet_len: total,
    })
}

/// Validate, unprotect and decrypt the Initial packet at the front of `datagram`
///
/// Initial keys are derived from the packet's own DCID, or from `expected_dcid` when the caller
/// has already bound one; a mismatch fails with [`PacketDecodeError::UnexpectedDcid`] before any
/// key derivation. `packet_len` of the result tells the caller where any coalesced packets begin.
pub fn parse_initial(
    datagram: &[u8],
    expected_dcid: Option<&ConnectionId>,
) -> Result<InitialPacket, PacketDecodeError> {
    let header = ProtectedHeader::decode(datagram)?;
    if let Some(expected) = expected_dcid {
        if header.dst_cid != *expected {
            return Err(PacketDecodeError::UnexpectedDcid);
        }
    }
    let keys = InitialKeys::new(&header.dst_cid, Side::Server);
    unseal(header, datagram, &keys, 0)
}

/// Expand a truncated packet number received on the wire (RFC 9000 Appendix A.3)
pub(crate) fn expand_pn(truncated: u64, bits: u32, expected: u64) -> u64 {
    let win = 1u64 << bits;
    let hwin = win >> 1;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate + hwin <= expected && candidate < (1u64 << 62) - win {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Build and seal an Initial packet
///
/// The packet number is written in its full four-byte form. When `min_datagram_size` is given the
/// payload is extended with PADDING frames so a datagram carrying only this packet reaches that
/// size, as clients must for their first flight.
pub fn seal_initial(
    keys: &InitialKeys,
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    token: &[u8],
    number: u64,
    payload: &[u8],
    min_datagram_size: Option<usize>,
) -> Vec<u8> {
    let tag_len = keys.packet.local.tag_len();
    let mut buf = Vec::new();
    buf.put_u8(LONG_HEADER_FORM | FIXED_BIT | 0b11); // Initial, 4-byte packet number
    buf.put_u32(version);
    buf.put_u8(dst_cid.len() as u8);
    buf.put_slice(dst_cid);
    buf.put_u8(src_cid.len() as u8);
    buf.put_slice(src_cid);
    buf.write_var(token.len() as u64);
    buf.put_slice(token);

    // Length and packet number fields still to come
    let pad = min_datagram_size
        .map(|min| min.saturating_sub(buf.len() + 2 + 4 + payload.len() + tag_len))
        .unwrap_or(0);
    let length = 4 + payload.len() + pad + tag_len;
    debug_assert!(length < 1 << 14);
    buf.put_u16(0x4000 | length as u16); // 2-byte varint
    let pn_offset = buf.len();
    buf.put_u32(number as u32);
    buf.put_slice(payload);
    buf.resize(buf.len() + pad, 0); // PADDING frames

    keys.packet.local.encrypt(number, &mut buf, pn_offset + 4);
    keys.header.local.encrypt(pn_offset, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MIN_INITIAL_SIZE, VERSION_1};
    use assert_matches::assert_matches;

    fn cids() -> (ConnectionId, ConnectionId) {
        (
            ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]),
            ConnectionId::new(&[0x01, 0x02, 0x03, 0x04]),
        )
    }

    #[test]
    fn seal_parse_round_trip() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let payload = b"\x01\x01\x01\x01"; // PING PING PING PING
        let datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            &[],
            0,
            payload,
            Some(MIN_INITIAL_SIZE),
        );
        assert_eq!(datagram.len(), MIN_INITIAL_SIZE);

        let packet = parse_initial(&datagram, None).unwrap();
        assert_eq!(packet.header.version, VERSION_1);
        assert_eq!(packet.header.dst_cid, dst_cid);
        assert_eq!(packet.header.src_cid, src_cid);
        assert_eq!(packet.header.number, 0);
        assert!(packet.header.token.is_empty());
        assert_eq!(packet.packet_len, MIN_INITIAL_SIZE);
        assert_eq!(&packet.payload[..4], payload);
        // The padding that filled the datagram out
        assert!(packet.payload[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn coalesced_remainder() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let mut datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            &[],
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        let initial_len = datagram.len();
        datagram.extend_from_slice(&[0xe5; 300]);

        let packet = parse_initial(&datagram, None).unwrap();
        assert_eq!(packet.packet_len, initial_len);
        assert_eq!(&datagram[packet.packet_len..], &[0xe5; 300][..]);
    }

    #[test]
    fn foreign_dcid_rejected_before_unsealing() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            &[],
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        let other = ConnectionId::new(&[0xff; 8]);
        assert_matches!(
            parse_initial(&datagram, Some(&other)),
            Err(PacketDecodeError::UnexpectedDcid)
        );
    }

    #[test]
    fn tampered_payload_dropped() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let mut datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            &[],
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        let last = datagram.len() - 1;
        datagram[last] ^= 0x40;
        assert_matches!(
            parse_initial(&datagram, None),
            Err(PacketDecodeError::Decrypt)
        );
    }

    #[test]
    fn unknown_version() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let datagram = seal_initial(
            &client,
            0x0a1a_2a3a,
            &dst_cid,
            &src_cid,
            &[],
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        assert_matches!(
            parse_initial(&datagram, None),
            Err(PacketDecodeError::UnsupportedVersion { version: 0x0a1a_2a3a })
        );
    }

    #[test]
    fn malformed_headers() {
        // Truncated mid-DCID
        let buf = [0xc3, 0, 0, 0, 1, 18, 0xab, 0xcd];
        assert_matches!(
            ProtectedHeader::decode(&buf),
            Err(PacketDecodeError::InvalidHeader(_))
        );
        // Short header
        assert_matches!(
            ProtectedHeader::decode(&[0x43, 0xab, 0xcd]),
            Err(PacketDecodeError::InvalidHeader("not a long header"))
        );
        // Length field overrunning the datagram
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            &[],
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        assert_matches!(
            ProtectedHeader::decode(&datagram[..MIN_INITIAL_SIZE / 2]),
            Err(PacketDecodeError::InvalidHeader(
                "packet length longer than datagram"
            ))
        );
    }

    #[test]
    fn retained_token() {
        let (dst_cid, src_cid) = cids();
        let client = InitialKeys::new(&dst_cid, Side::Client);
        let datagram = seal_initial(
            &client,
            VERSION_1,
            &dst_cid,
            &src_cid,
            b"ticket",
            0,
            b"\x01",
            Some(MIN_INITIAL_SIZE),
        );
        let packet = parse_initial(&datagram, None).unwrap();
        assert_eq!(&packet.header.token[..], b"ticket");
    }

    // RFC 9000 Appendix A.3 worked example
    #[test]
    fn packet_number_expansion() {
        assert_eq!(expand_pn(0x9b32, 16, 0xa82f_30eb), 0xa82f_9b32);
        // Wrap upward across the window edge
        assert_eq!(expand_pn(0x00, 8, 0x1ff), 0x200);
        // Small numbers stay put
        assert_eq!(expand_pn(0x01, 8, 0), 0x01);
    }
}
