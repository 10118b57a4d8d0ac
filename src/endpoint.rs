//! Datagram routing and the candidate registry
//!
//! The [`Endpoint`] is the admission entry point. It performs no I/O whatsoever: a backend feeds
//! it every inbound datagram and acts on the returned events. Datagrams for established
//! connections are routed by connection ID; datagrams for unknown IDs either seed a
//! [`ConnectionCandidate`] or are silently dropped.
//!
//! The endpoint is not internally synchronized. Drive it from a single thread or behind a mutex,
//! feeding datagrams in arrival order; that ordering is what the candidate state machine relies
//! on. Only the per-attempt [`AntiAmplification`] ledgers are safe to share across threads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use slab::Slab;
use tracing::{debug, trace};

use crate::amplification::AntiAmplification;
use crate::candidate::{CandidateState, ConnectionCandidate, IncomingConnection};
use crate::config::{EndpointConfig, ServerConfig};
use crate::packet::{self, PacketDecodeError, ProtectedHeader};
use crate::shared::ConnectionId;
use crate::MIN_INITIAL_SIZE;

/// Stable handle for a promoted connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle(pub usize);

/// Creates connection objects at promotion time
///
/// Injected into the [`Endpoint`] at construction; the dependency only points one way, and
/// nothing here ever reaches back into the admission state.
pub trait ConnectionFactory {
    /// The connection type produced
    type Connection;
    /// Build a connection from a validated first flight
    fn create_connection(&mut self, incoming: IncomingConnection) -> Self::Connection;
}

/// What the caller should do with a datagram it fed to [`Endpoint::handle`]
pub enum DatagramEvent<C> {
    /// A candidate completed its ClientHello and was promoted
    NewConnection(ConnectionHandle, C),
    /// The datagram belongs to an established connection
    ConnectionEvent(ConnectionHandle, BytesMut),
}

/// Routing bookkeeping for one promoted connection
struct ConnectionMeta {
    init_cid: ConnectionId,
    cids: Vec<ConnectionId>,
    remote: SocketAddr,
}

/// The admission entry point
pub struct Endpoint<F: ConnectionFactory> {
    config: Arc<EndpointConfig>,
    server_config: Arc<ServerConfig>,
    factory: F,
    candidates: FxHashMap<ConnectionId, ConnectionCandidate>,
    connection_ids: FxHashMap<ConnectionId, ConnectionHandle>,
    connections: Slab<ConnectionMeta>,
}

impl<F: ConnectionFactory> Endpoint<F> {
    /// An endpoint accepting connections through `factory`
    pub fn new(config: Arc<EndpointConfig>, server_config: Arc<ServerConfig>, factory: F) -> Self {
        Self {
            config,
            server_config,
            factory,
            candidates: FxHashMap::default(),
            connection_ids: FxHashMap::default(),
            connections: Slab::new(),
        }
    }

    /// Process an incoming UDP datagram
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        data: BytesMut,
    ) -> Option<DatagramEvent<F::Connection>> {
        self.evict_idle(now);

        let dst_cid = match self.peek_dst_cid(&data) {
            Some(cid) => cid,
            None => {
                trace!("dropping unparseable datagram");
                return None;
            }
        };

        if let Some(&handle) = self.connection_ids.get(&dst_cid) {
            return Some(DatagramEvent::ConnectionEvent(handle, data));
        }

        if let Some(candidate) = self.candidates.get_mut(&dst_cid) {
            let promoted = candidate.handle_datagram(now, remote, data);
            if candidate.state() == CandidateState::Dropped {
                self.candidates.remove(&dst_cid);
            }
            let incoming = promoted?;
            self.candidates.remove(&dst_cid);
            return Some(self.promote(incoming));
        }

        //
        // Potentially create a new candidate
        //

        let header = match ProtectedHeader::decode(&data) {
            Ok(header) => header,
            Err(PacketDecodeError::UnsupportedVersion { version }) => {
                // A version-negotiation responder would answer here; we only admit v1
                debug!(version, "dropping packet with unsupported version");
                return None;
            }
            Err(e) => {
                trace!(%e, "dropping packet for unknown connection");
                return None;
            }
        };
        if data.len() < MIN_INITIAL_SIZE {
            debug!(connection = %header.dst_cid(), "ignoring underpadded first Initial");
            return None;
        }
        if self.connections.len() + self.candidates.len()
            >= self.server_config.concurrent_connections as usize
        {
            // Pre-connection, refusal must be silent: a CONNECTION_CLOSE would spend
            // unvalidated amplification budget
            debug!("refusing connection attempt: at capacity");
            return None;
        }

        let mut candidate = ConnectionCandidate::new(
            now,
            remote,
            *header.dst_cid(),
            header.version(),
            self.server_config.transport.crypto_buffer_size,
            Arc::new(AntiAmplification::new()),
        );
        match candidate.handle_datagram(now, remote, data) {
            Some(incoming) => Some(self.promote(incoming)),
            None => {
                if candidate.state() == CandidateState::Buffering {
                    self.candidates.insert(dst_cid, candidate);
                }
                None
            }
        }
    }

    fn promote(&mut self, incoming: IncomingConnection) -> DatagramEvent<F::Connection> {
        let init_cid = incoming.orig_dst_cid;
        let remote = incoming.remote;
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(ConnectionMeta {
            init_cid,
            cids: Vec::new(),
            remote,
        });
        let connection = self.factory.create_connection(incoming);
        // Replace the registry entry so later datagrams for this DCID route onward
        self.connection_ids.insert(init_cid, handle);
        debug!(connection = %init_cid, %remote, "connection promoted");
        DatagramEvent::NewConnection(handle, connection)
    }

    /// Route future datagrams carrying `cid` to `handle`
    ///
    /// Connections issue their own IDs after promotion; the endpoint must learn them to route
    /// short-header packets.
    pub fn register_connection_id(&mut self, handle: ConnectionHandle, cid: ConnectionId) {
        debug_assert_eq!(cid.len(), self.config.local_cid_len);
        self.connection_ids.insert(cid, handle);
        self.connections[handle.0].cids.push(cid);
    }

    /// Discard all state for a closed connection
    pub fn forget(&mut self, handle: ConnectionHandle) {
        let meta = self.connections.remove(handle.0);
        self.connection_ids.remove(&meta.init_cid);
        for cid in &meta.cids {
            self.connection_ids.remove(cid);
        }
    }

    /// Drop candidates that have gone quiet without completing a ClientHello
    ///
    /// Runs opportunistically on every [`handle`](Self::handle) call as well; eviction is
    /// silent, like every other pre-connection failure.
    pub fn evict_idle(&mut self, now: Instant) {
        let timeout = self.server_config.transport.initial_rtt * 3;
        self.candidates.retain(|cid, candidate| {
            let keep = !candidate.expired(now, timeout);
            if !keep {
                debug!(connection = %cid, "evicting idle candidate");
            }
            keep
        });
    }

    /// The address a promoted connection was accepted from
    pub fn remote_address(&self, handle: ConnectionHandle) -> SocketAddr {
        self.connections[handle.0].remote
    }

    /// Number of candidates currently buffering
    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Number of promoted connections being routed
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The DCID the datagram is addressed to, long or short header alike
    fn peek_dst_cid(&self, data: &[u8]) -> Option<ConnectionId> {
        let first = *data.first()?;
        if packet::is_long_header(first) {
            let len = *data.get(5)? as usize;
            if len > crate::MAX_CID_SIZE {
                return None;
            }
            Some(ConnectionId::new(data.get(6..6 + len)?))
        } else {
            Some(ConnectionId::new(
                data.get(1..1 + self.config.local_cid_len)?,
            ))
        }
    }
}
