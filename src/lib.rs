//! Server-side QUIC connection admission
//!
//! This library implements the pre-connection half of a QUIC (RFC 9000/9001) server: it consumes
//! raw datagrams addressed to connection IDs that no established connection owns, validates them
//! against the packet-format and anti-amplification rules, reassembles the client's first
//! handshake flight, and decides whether a long-lived connection object should be created.
//!
//! The [`Endpoint`] performs no I/O whatsoever. A backend feeds it inbound datagrams via
//! [`Endpoint::handle`] and acts on the returned [`DatagramEvent`]s; everything past promotion
//! (streams, flow control, loss recovery, the real TLS engine) lives in the connection object
//! produced by the caller's [`ConnectionFactory`].

mod assembler;
mod candidate;
mod coding;
mod config;
mod endpoint;
mod shared;

pub mod amplification;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod transport_parameters;

mod varint;
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};

pub use crate::{
    candidate::{CandidateState, ConnectionCandidate, IncomingConnection},
    config::{ConfigError, EndpointConfig, ServerConfig, TransportConfig},
    endpoint::{ConnectionFactory, ConnectionHandle, DatagramEvent, Endpoint},
    shared::{ConnectionId, ResetToken},
    transport_parameters::{TransportParameters, TransportParametersBuilder},
};

/// The QUIC version implemented on the wire
pub const VERSION_1: u32 = 0x0000_0001;

/// Versions advertised by default in the `version_information` transport parameter
pub const DEFAULT_SUPPORTED_VERSIONS: &[u32] = &[VERSION_1];

/// Whether packets carrying `version` can be processed
///
/// Draft versions share v1's transport-parameter extension logic but use different initial salts,
/// so they are negotiable in the extension without being accepted on the wire.
pub(crate) fn is_supported_version(version: u32) -> bool {
    version == VERSION_1
}

/// IETF draft versions, `0xff00_00xx`
pub(crate) fn is_draft_version(version: u32) -> bool {
    version & 0xff00_0000 == 0xff00_0000
}

/// Whether a participant is at the client or server end of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client,
    /// The acceptor of a connection
    Server,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// The maximum connection ID length permitted by RFC 9000
pub const MAX_CID_SIZE: usize = 20;

/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;

/// Clients must pad datagrams carrying Initial packets to at least this size
pub const MIN_INITIAL_SIZE: usize = 1200;
