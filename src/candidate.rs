//! Pre-connection state for a single connection attempt
//!
//! A [`ConnectionCandidate`] exists between the first datagram naming an unknown DCID and the
//! moment enough validated CRYPTO bytes arrive to parse a complete ClientHello. It accumulates
//! handshake bytes across however many Initial packets the client needed, enforces the
//! pre-handshake frame rules, and detects spoofing across datagrams. Every failure is a silent
//! drop: no reply channel exists yet, and answering would hand attackers an amplification
//! surface.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::amplification::AntiAmplification;
use crate::assembler::Assembler;
use crate::crypto::ring::InitialKeys;
use crate::crypto::{ClientHelloScanner, ClientHelloStatus, HandshakeReader};
use crate::frame::{self, Frame};
use crate::packet::{self, InitialPacket, LongType, ProtectedHeader};
use crate::shared::ConnectionId;
use crate::transport_parameters::TransportParameters;
use crate::{Side, MIN_INITIAL_SIZE};

/// Externally observable lifecycle state of a candidate
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CandidateState {
    /// Waiting for more CRYPTO bytes
    Buffering,
    /// Handed off to a connection; terminal
    Promoted,
    /// Discarded without a reply; terminal
    Dropped,
}

/// Everything a freshly created connection needs to take over the handshake
pub struct IncomingConnection {
    /// The version the client is speaking
    pub version: u32,
    /// The client's address, not yet validated
    pub remote: SocketAddr,
    /// The DCID of the client's first Initial; Initial keys and the server's
    /// `original_destination_connection_id` transport parameter derive from it
    pub orig_dst_cid: ConnectionId,
    /// The client's chosen connection ID
    pub src_cid: ConnectionId,
    /// Every accepted Initial packet, in arrival order, for replay into the connection
    pub packets: Vec<InitialPacket>,
    /// Unconsumed coalesced bytes from the final datagram
    pub trailing: Option<Bytes>,
    /// The complete ClientHello, ready for the TLS engine
    pub client_hello: Bytes,
    /// The client's transport parameters, already validated
    pub transport_parameters: TransportParameters,
    /// Send-budget ledger for the still-unvalidated path
    pub amplification: Arc<AntiAmplification>,
}

/// The admission state machine for one connection attempt
pub struct ConnectionCandidate {
    state: CandidateState,
    remote: SocketAddr,
    version: u32,
    orig_dst_cid: ConnectionId,
    /// Bound by the first accepted packet; later packets must match
    src_cid: Option<ConnectionId>,
    keys: InitialKeys,
    assembler: Assembler,
    hello: ClientHelloScanner,
    /// `(packet number, length)` of every accepted Initial, for replay suppression
    seen: FxHashSet<(u64, usize)>,
    packets: Vec<InitialPacket>,
    largest_pn: Option<u64>,
    /// Cumulative length of accepted datagrams
    datagram_bytes: u64,
    /// Whether any accepted packet carried CRYPTO unaccompanied by disqualifying frames
    promotable: bool,
    amplification: Arc<AntiAmplification>,
    last_datagram: Instant,
}

impl ConnectionCandidate {
    /// Fresh state for the attempt opening `orig_dst_cid`
    pub fn new(
        now: Instant,
        remote: SocketAddr,
        orig_dst_cid: ConnectionId,
        version: u32,
        crypto_buffer_size: usize,
        amplification: Arc<AntiAmplification>,
    ) -> Self {
        Self {
            state: CandidateState::Buffering,
            remote,
            version,
            orig_dst_cid,
            src_cid: None,
            keys: InitialKeys::new(&orig_dst_cid, Side::Server),
            assembler: Assembler::new(crypto_buffer_size),
            hello: ClientHelloScanner::new(version),
            seen: FxHashSet::default(),
            packets: Vec::new(),
            largest_pn: None,
            datagram_bytes: 0,
            promotable: false,
            amplification,
            last_datagram: now,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> CandidateState {
        self.state
    }

    /// The bound remote address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The shared anti-amplification ledger for this attempt
    pub fn amplification(&self) -> &AntiAmplification {
        &self.amplification
    }

    /// Whether the candidate has seen no traffic for `timeout`
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_datagram) >= timeout
    }

    /// Consume one datagram addressed to this candidate's DCID
    ///
    /// Returns the promotion payload once a complete ClientHello has been validated; `None`
    /// means the candidate is still buffering, or silently dropped the input, or died; check
    /// [`state`](Self::state).
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        data: BytesMut,
    ) -> Option<IncomingConnection> {
        if self.state != CandidateState::Buffering {
            return None;
        }
        if remote != self.remote {
            debug!(candidate = %self.orig_dst_cid, %remote, "ignoring datagram from unexpected address");
            return None;
        }
        // Bytes from the claimed address count whether or not the packets inside survive
        // validation
        self.amplification.on_datagram_received(data.len());
        if data.len() < MIN_INITIAL_SIZE {
            trace!(candidate = %self.orig_dst_cid, len = data.len(), "ignoring underpadded datagram");
            return None;
        }
        self.last_datagram = now;
        self.datagram_bytes += data.len() as u64;

        let data = data.freeze();
        let mut cursor = 0;
        let mut trailing = None;
        while cursor < data.len() {
            let rest = &data[cursor..];
            if packet::long_packet_type(rest[0]) != Some(LongType::Initial) {
                // Sealed with keys this candidate does not have; saved for the connection
                trailing = Some(data.slice(cursor..));
                break;
            }
            let header = match ProtectedHeader::decode(rest) {
                Ok(header) => header,
                Err(e) => {
                    trace!(candidate = %self.orig_dst_cid, %e, "stopping at undecodable packet");
                    break;
                }
            };
            if *header.dst_cid() != self.orig_dst_cid {
                trailing = Some(data.slice(cursor..));
                break;
            }
            let expected_pn = self.largest_pn.map_or(0, |pn| pn + 1);
            let packet = match packet::unseal(header, rest, &self.keys, expected_pn) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!(candidate = %self.orig_dst_cid, %e, "stopping at unreadable packet");
                    break;
                }
            };
            cursor += packet.packet_len;
            self.admit(packet);
            if self.state == CandidateState::Dropped {
                return None;
            }
        }
        self.try_promote(trailing)
    }

    /// Validate one unsealed packet and fold it into the candidate
    fn admit(&mut self, packet: InitialPacket) {
        if packet.header.version != self.version {
            debug!(candidate = %self.orig_dst_cid, "discarding Initial with changed version");
            return;
        }
        if let Some(bound) = self.src_cid {
            if bound != packet.header.src_cid {
                debug!(candidate = %self.orig_dst_cid, "discarding Initial with changed source CID");
                return;
            }
        }
        let key = (packet.header.number, packet.packet_len);
        if self.seen.contains(&key) {
            trace!(candidate = %self.orig_dst_cid, number = packet.header.number, "discarding duplicate Initial");
            return;
        }

        let mut crypto = Vec::new();
        let mut disqualified = false;
        for frame in frame::Iter::new(packet.payload.clone()) {
            match frame {
                Ok(Frame::Padding(_)) | Ok(Frame::Ping) => {}
                Ok(Frame::Crypto(f)) => crypto.push(f),
                // Legal in Initial packets, but no honest first flight carries them; the
                // packet still counts toward amplification credit
                Ok(Frame::Ack(_))
                | Ok(Frame::Close(_))
                | Ok(Frame::PathChallenge(_))
                | Ok(Frame::PathResponse(_)) => disqualified = true,
                Err(e) => {
                    debug!(candidate = %self.orig_dst_cid, %e, "discarding Initial");
                    return;
                }
            }
        }
        for f in &crypto {
            if let Err(e) = self.assembler.insert(f.offset, &f.data) {
                debug!(candidate = %self.orig_dst_cid, %e, "destroying candidate");
                self.state = CandidateState::Dropped;
                return;
            }
        }

        self.src_cid.get_or_insert(packet.header.src_cid);
        self.largest_pn = Some(
            self.largest_pn
                .map_or(packet.header.number, |pn| pn.max(packet.header.number)),
        );
        self.seen.insert(key);
        self.promotable |= !crypto.is_empty() && !disqualified;
        self.packets.push(packet);
    }

    /// Promote if a complete, well-formed ClientHello is available
    fn try_promote(&mut self, trailing: Option<Bytes>) -> Option<IncomingConnection> {
        if !self.promotable || self.datagram_bytes < MIN_INITIAL_SIZE as u64 {
            return None;
        }
        let status = match self.hello.feed_client_hello(self.assembler.prefix()) {
            Ok(status) => status,
            Err(e) => {
                debug!(candidate = %self.orig_dst_cid, %e, "destroying candidate: handshake rejected");
                self.state = CandidateState::Dropped;
                return None;
            }
        };
        let (hello_len, ext) = match status {
            ClientHelloStatus::Incomplete => return None,
            ClientHelloStatus::Complete {
                len,
                transport_parameters,
            } => (len, transport_parameters),
        };
        let ext = match ext {
            Some(ext) => ext,
            None => {
                debug!(candidate = %self.orig_dst_cid, "destroying candidate: ClientHello lacks transport parameters");
                self.state = CandidateState::Dropped;
                return None;
            }
        };
        let transport_parameters = match TransportParameters::read(Side::Server, &mut &ext[..]) {
            Ok(params) => params,
            Err(e) => {
                debug!(candidate = %self.orig_dst_cid, %e, "destroying candidate: invalid transport parameters");
                self.state = CandidateState::Dropped;
                return None;
            }
        };
        let src_cid = self.src_cid?;
        // RFC 9000 §7.3: the declared initial SCID must match the one on the wire
        if transport_parameters.initial_src_cid != Some(src_cid) {
            debug!(candidate = %self.orig_dst_cid, "destroying candidate: initial_source_connection_id mismatch");
            self.state = CandidateState::Dropped;
            return None;
        }

        let client_hello = Bytes::copy_from_slice(&self.assembler.prefix()[..hello_len]);
        self.state = CandidateState::Promoted;
        debug!(candidate = %self.orig_dst_cid, remote = %self.remote, "promoting candidate");
        Some(IncomingConnection {
            version: self.version,
            remote: self.remote,
            orig_dst_cid: self.orig_dst_cid,
            src_cid,
            packets: mem::take(&mut self.packets),
            trailing,
            client_hello,
            transport_parameters,
            amplification: self.amplification.clone(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::MIN_INITIAL_SIZE;

    #[test]
    fn single_datagram_promotes() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello)], &[]);

        let incoming = candidate
            .handle_datagram(now, addr(1111), datagram)
            .expect("one complete datagram must promote");
        assert_eq!(candidate.state(), CandidateState::Promoted);
        assert_eq!(incoming.orig_dst_cid, dcid());
        assert_eq!(incoming.src_cid, scid());
        assert_eq!(&incoming.client_hello[..], &hello[..]);
        assert_eq!(incoming.packets.len(), 1);
        assert!(incoming.trailing.is_none());
        assert_eq!(
            incoming.transport_parameters.initial_src_cid,
            Some(scid())
        );
        // anti-amplification credit for exactly the bytes received
        assert_eq!(incoming.amplification.budget(), Some(3 * 1200));
    }

    #[test]
    fn split_hello_buffers_then_promotes() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let (first, second) = hello.split_at(40);

        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, first)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Buffering);
        assert_eq!(candidate.amplification().budget(), Some(3600));

        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(40, second)], &[]);
        let incoming = candidate
            .handle_datagram(now, addr(1111), datagram)
            .expect("second half must complete the hello");
        assert_eq!(incoming.packets.len(), 2);
        assert_eq!(incoming.packets[0].header.number, 0);
        assert_eq!(incoming.packets[1].header.number, 1);
        assert!(incoming.amplification.budget() >= Some(3 * 2400));
    }

    #[test]
    fn out_of_order_halves_promote() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let (first, second) = hello.split_at(40);

        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(40, second)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, first)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_some());
    }

    #[test]
    fn proper_prefix_never_promotes() {
        let hello = client_hello_for(&scid());
        for &cut in &[1usize, 4, hello.len() / 2, hello.len() - 1] {
            let now = Instant::now();
            let mut candidate = candidate(now);
            let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello[..cut])], &[]);
            assert!(
                candidate.handle_datagram(now, addr(1111), datagram).is_none(),
                "prefix of {} bytes must not promote",
                cut
            );
            assert_eq!(candidate.state(), CandidateState::Buffering);
        }
    }

    #[test]
    fn changed_scid_is_discarded() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let (first, second) = hello.split_at(40);

        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, first)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());

        let imposter = ConnectionId::new(&[0xee; 4]);
        let datagram = initial_datagram(&dcid(), &imposter, 1, &[(40, second)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Buffering);

        // The honest client's retransmission still completes the handshake
        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(40, second)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_some());
    }

    #[test]
    fn changed_address_is_ignored() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let (first, second) = hello.split_at(40);

        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, first)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());

        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(40, second)], &[]);
        assert!(candidate
            .handle_datagram(now, addr(2222), datagram)
            .is_none());
        assert_eq!(candidate.state(), CandidateState::Buffering);
        // Off-path bytes earn no amplification credit
        assert_eq!(candidate.amplification().bytes_received(), 1200);

        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(40, second)], &[]);
        assert!(candidate
            .handle_datagram(now, addr(1111), datagram)
            .is_some());
    }

    #[test]
    fn ack_bearing_initial_never_promotes() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        // CRYPTO immediately followed by an ACK of packet 0
        let datagram = initial_datagram(
            &dcid(),
            &scid(),
            0,
            &[(0, &hello)],
            &[0x02, 0x00, 0x00, 0x00, 0x00],
        );
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Buffering);
        // Accounting still happened
        assert_eq!(candidate.amplification().bytes_received(), 1200);

        // A clean retransmission of the same CRYPTO bytes promotes
        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(0, &hello)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_some());
    }

    #[test]
    fn stream_frame_is_a_protocol_violation() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        // STREAM(0x0e) tucked in after the CRYPTO frame
        let datagram = initial_datagram(
            &dcid(),
            &scid(),
            0,
            &[(0, &hello)],
            &[0x0e, 0x00, 0x00, 0x01, 0xaa],
        );
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Buffering);
        assert!(candidate.packets.is_empty());
    }

    #[test]
    fn conflicting_retransmission_destroys() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello[..40])], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());

        let mut conflicting = hello[..40].to_vec();
        conflicting[10] ^= 0xff;
        let datagram = initial_datagram(&dcid(), &scid(), 1, &[(0, &conflicting)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Dropped);
    }

    #[test]
    fn coalesced_trailing_bytes_reach_the_connection() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let mut datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello)], &[]);
        assert_eq!(datagram.len(), MIN_INITIAL_SIZE);
        // A coalesced Handshake packet the candidate cannot read
        datagram.extend_from_slice(&[0xe5; 300]);

        let incoming = candidate
            .handle_datagram(now, addr(1111), datagram)
            .expect("valid Initial with trailing bytes must promote");
        let trailing = incoming.trailing.expect("trailing bytes must be retained");
        assert_eq!(&trailing[..], &[0xe5; 300][..]);
        assert_eq!(incoming.packets[0].packet_len, MIN_INITIAL_SIZE);
    }

    #[test]
    fn hello_without_transport_parameters_destroys() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = crate::crypto::hello::test_util::client_hello(&[]);
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Dropped);
    }

    #[test]
    fn lying_initial_source_cid_destroys() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        // ClientHello declares a different SCID than the packet carries
        let hello = client_hello_for(&ConnectionId::new(&[0x99; 4]));
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, &hello)], &[]);
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.state(), CandidateState::Dropped);
    }

    #[test]
    fn duplicate_packet_replay_is_suppressed() {
        let now = Instant::now();
        let mut candidate = candidate(now);
        let hello = client_hello_for(&scid());
        let (first, _) = hello.split_at(40);
        let datagram = initial_datagram(&dcid(), &scid(), 0, &[(0, first)], &[]);
        assert!(candidate
            .handle_datagram(now, addr(1111), datagram.clone())
            .is_none());
        assert!(candidate.handle_datagram(now, addr(1111), datagram).is_none());
        assert_eq!(candidate.packets.len(), 1);
        // Replayed bytes still count toward the budget
        assert_eq!(candidate.amplification().bytes_received(), 2400);
    }

    #[test]
    fn expiry() {
        let now = Instant::now();
        let candidate = candidate(now);
        let timeout = Duration::from_secs(1);
        assert!(!candidate.expired(now, timeout));
        assert!(candidate.expired(now + Duration::from_secs(2), timeout));
    }
}
