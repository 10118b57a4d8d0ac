use std::{convert::TryInto, fmt, num::TryFromIntError, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{VarInt, VarIntBoundsExceeded, DEFAULT_SUPPORTED_VERSIONS, VERSION_1};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications. Applications protocols which
/// forbid remotely-initiated streams should set `max_concurrent_bidi_streams` and
/// `max_concurrent_uni_streams` to zero.
///
/// In some cases, performance or resource requirements can be improved by tuning these values to
/// suit a particular application and/or network connection. Data window sizes can be tuned for a
/// particular expected round trip time, link capacity, and memory availability; tuning for higher
/// bandwidths and latencies increases worst-case memory consumption, but does not impair
/// performance at lower bandwidths and latencies.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<Duration>,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) receive_window: VarInt,

    pub(crate) initial_rtt: Duration,
    pub(crate) crypto_buffer_size: usize,

    pub(crate) ack_delay_exponent: VarInt,
    pub(crate) max_ack_delay: Duration,

    pub(crate) datagram_receive_buffer_size: Option<usize>,
}

impl TransportConfig {
    /// Maximum number of bidirectional streams that may be open concurrently
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub fn max_concurrent_bidi_streams(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.max_concurrent_bidi_streams = value.try_into()?;
        Ok(self)
    }

    /// Variant of `max_concurrent_bidi_streams` affecting unidirectional streams
    pub fn max_concurrent_uni_streams(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.max_concurrent_uni_streams = value.try_into()?;
        Ok(self)
    }

    /// Maximum duration of inactivity to accept before timing out the connection.
    ///
    /// The true idle timeout is the minimum of this and the peer's own max idle timeout. `None`
    /// represents an infinite timeout.
    ///
    /// **WARNING**: If a peer or its network path malfunctions or acts maliciously, an infinite
    /// idle timeout can result in permanently hung connections!
    pub fn max_idle_timeout(&mut self, value: Option<Duration>) -> Result<&mut Self, ConfigError> {
        if value.map_or(false, |x| x.as_millis() > VarInt::MAX.0 as u128) {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_idle_timeout = value;
        Ok(self)
    }

    /// Maximum number of bytes the peer may transmit without acknowledgement on any one stream
    /// before becoming blocked.
    ///
    /// This should be set to at least the expected connection latency multiplied by the maximum
    /// desired throughput. Setting this smaller than `receive_window` helps ensure that a single
    /// stream doesn't monopolize receive buffers, which may otherwise occur if the application
    /// chooses not to read from a large stream for a time while still requiring data on other
    /// streams.
    pub fn stream_receive_window(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.stream_receive_window = value.try_into()?;
        Ok(self)
    }

    /// Maximum number of bytes the peer may transmit across all streams of a connection before
    /// becoming blocked.
    ///
    /// This should be set to at least the expected connection latency multiplied by the maximum
    /// desired throughput. Larger values can be useful to allow maximum throughput within a
    /// stream while another is blocked.
    pub fn receive_window(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.receive_window = value.try_into()?;
        Ok(self)
    }

    /// The RTT used before an RTT sample is taken
    ///
    /// Also bounds how long an incomplete handshake may hold pre-connection state: candidates
    /// idle for three times this value are evicted.
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Maximum quantity of out-of-order crypto layer data to buffer
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value;
        self
    }

    /// Exponent the peer must apply when decoding ACK delays from this endpoint
    ///
    /// ACK frames are always *encoded* with the protocol default of 3; this knob only changes the
    /// advertised transport parameter.
    pub fn ack_delay_exponent(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        if value > 20 {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_delay_exponent = value.try_into()?;
        Ok(self)
    }

    /// Maximum delay this endpoint will apply before acknowledging packets
    pub fn max_ack_delay(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.as_millis() >= 1 << 14 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_ack_delay = value;
        Ok(self)
    }

    /// Maximum number of incoming application datagram bytes to buffer, or None to disable
    /// incoming datagrams
    ///
    /// Governs the advertised `max_datagram_frame_size`: the peer is forbidden to send single
    /// datagrams larger than this size.
    pub fn datagram_receive_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.datagram_receive_buffer_size = value;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
                                                        // Window size needed to avoid pipeline
                                                        // stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        TransportConfig {
            max_concurrent_bidi_streams: 100u32.into(),
            max_concurrent_uni_streams: 100u32.into(),
            max_idle_timeout: Some(Duration::from_millis(10_000)),
            stream_receive_window: STREAM_RWND.into(),
            receive_window: VarInt::MAX,

            initial_rtt: Duration::from_millis(333), // per RFC 9002, intentionally distinct from EXPECTED_RTT
            crypto_buffer_size: 16 * 1024,

            ack_delay_exponent: 3u32.into(),
            max_ack_delay: Duration::from_millis(25),

            datagram_receive_buffer_size: Some(STREAM_RWND as usize),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TransportConfig")
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("initial_rtt", &self.initial_rtt)
            .field("crypto_buffer_size", &self.crypto_buffer_size)
            .field("ack_delay_exponent", &self.ack_delay_exponent)
            .field("max_ack_delay", &self.max_ack_delay)
            .field(
                "datagram_receive_buffer_size",
                &self.datagram_receive_buffer_size,
            )
            .finish()
    }
}

/// Global configuration for the endpoint, affecting all connections
///
/// Default values should be suitable for most internet applications.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) max_udp_payload_size: VarInt,
    pub(crate) supported_versions: Vec<u32>,
    pub(crate) initial_version: u32,
    /// Length of connection IDs issued by this endpoint
    pub(crate) local_cid_len: usize,
}

impl EndpointConfig {
    /// Maximum UDP payload size accepted from peers. Excludes UDP and IP overhead.
    ///
    /// The default is suitable for typical internet applications. Applications which expect to run
    /// on networks supporting Ethernet jumbo frames or similar should set this appropriately.
    pub fn max_udp_payload_size(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        if value < crate::MIN_INITIAL_SIZE as u64 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_udp_payload_size = value.try_into()?;
        Ok(self)
    }

    /// Override supported QUIC versions
    pub fn supported_versions(
        &mut self,
        supported_versions: Vec<u32>,
        initial_version: u32,
    ) -> Result<&mut Self, ConfigError> {
        if !supported_versions.contains(&initial_version) {
            return Err(ConfigError::OutOfBounds);
        }
        self.supported_versions = supported_versions;
        self.initial_version = initial_version;
        Ok(self)
    }

    /// Length of the connection IDs this endpoint issues for incoming packets
    ///
    /// This must be either 0 or between 4 and 20 inclusive. The length of the local connection IDs
    /// constrains the amount of simultaneous connections the endpoint can maintain.
    pub fn local_cid_len(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value != 0 && !(4..=crate::MAX_CID_SIZE).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.local_cid_len = value;
        Ok(self)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_udp_payload_size: 1480u32.into(), // Typical internet MTU minus IPv4 and UDP overhead, rounded up to a multiple of 8
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            initial_version: VERSION_1,
            local_cid_len: 8,
        }
    }
}

/// Parameters governing incoming connections
///
/// Default values should be suitable for most internet applications.
pub struct ServerConfig {
    /// Transport configuration to use for incoming connections
    pub transport: Arc<TransportConfig>,

    /// Maximum number of concurrent handshakes and connections
    pub(crate) concurrent_connections: u32,

    /// Whether to allow clients to migrate to new addresses
    ///
    /// Improves behavior for clients that move between different internet connections or suffer NAT
    /// rebinding. Enabled by default.
    pub(crate) migration: bool,

    /// Size in bytes of the `discard` transport parameter appended to advertise oversized
    /// handshake tolerance, 0 to omit it
    pub(crate) discard_transport_parameter_size: u16,
}

impl ServerConfig {
    /// Maximum number of simultaneous connections to accept.
    ///
    /// New incoming connections are only accepted if the total number of incoming or outgoing
    /// connections is less than this. Outgoing connections are unaffected.
    pub fn concurrent_connections(&mut self, value: u32) -> &mut Self {
        self.concurrent_connections = value;
        self
    }

    /// Whether to allow clients to migrate to new addresses
    pub fn migration(&mut self, value: bool) -> &mut Self {
        self.migration = value;
        self
    }

    /// Append a `discard` transport parameter of `value` zero bytes
    ///
    /// Inflates the server's extension payload, exercising peers' tolerance for the larger
    /// ClientHello/EncryptedExtensions sizes expected of post-quantum handshakes.
    pub fn discard_transport_parameter_size(&mut self, value: u16) -> &mut Self {
        self.discard_transport_parameter_size = value;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            concurrent_connections: 100_000,
            migration: true,
            discard_transport_parameter_size: 0,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ServerConfig")
            .field("transport", &self.transport)
            .field("concurrent_connections", &self.concurrent_connections)
            .field("migration", &self.migration)
            .field(
                "discard_transport_parameter_size",
                &self.discard_transport_parameter_size,
            )
            .finish()
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}

impl From<TryFromIntError> for ConfigError {
    fn from(_: TryFromIntError) -> Self {
        ConfigError::OutOfBounds
    }
}

impl From<VarIntBoundsExceeded> for ConfigError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        ConfigError::OutOfBounds
    }
}
