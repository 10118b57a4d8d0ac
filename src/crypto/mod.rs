//! Packet protection and the TLS boundary for Initial packets
//!
//! The admission logic is written against the traits in this module; [`ring`] supplies the single
//! production implementation. The full TLS 1.3 engine is an external collaborator; only
//! ClientHello completeness detection and extension location live here, behind
//! [`HandshakeReader`].

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::transport_error::TransportError;

pub(crate) mod hello;
pub mod ring;

pub use self::hello::ClientHelloScanner;

/// Keys used to protect packet payloads
pub trait PacketKey {
    /// Encrypt the packet payload with the given packet number
    ///
    /// `buf` contains the unprotected header followed by the plaintext payload; the AEAD tag is
    /// appended.
    fn encrypt(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize);
    /// Decrypt the packet payload with the given packet number
    ///
    /// On success `payload` is truncated to the plaintext.
    fn decrypt(&self, packet: u64, header: &[u8], payload: &mut BytesMut)
        -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
}

/// Keys used to protect packet headers
pub trait HeaderKey {
    /// Decrypt the given packet's header
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Protects outgoing data
    pub local: T,
    /// Unprotects incoming data
    pub remote: T,
}

/// Error indicating that a packet payload failed to decrypt or authenticate
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("decryption error")]
pub struct CryptoError;

/// Result of offering reassembled CRYPTO bytes to the TLS boundary
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientHelloStatus {
    /// More CRYPTO bytes are needed before the first handshake message is complete
    Incomplete,
    /// A complete ClientHello is available
    Complete {
        /// Bytes the message occupies at the front of the CRYPTO stream, header included
        len: usize,
        /// Payload of the `quic_transport_parameters` extension, if the message carried one
        transport_parameters: Option<Bytes>,
    },
}

/// Boundary to the TLS 1.3 engine for pre-connection processing
///
/// Promotion only requires knowing when a complete ClientHello has been reassembled and where its
/// transport-parameters extension lives; everything else about the handshake runs in the external
/// TLS engine once a connection exists.
pub trait HandshakeReader {
    /// Inspect the contiguous prefix of the CRYPTO stream received so far
    fn feed_client_hello(&mut self, buf: &[u8]) -> Result<ClientHelloStatus, TransportError>;
}
