//! The QUIC `quic_transport_parameters` TLS extension
//!
//! Each endpoint declares its per-connection configuration (flow-control windows, timers,
//! connection-ID material) in an opaque extension carried by the ClientHello and
//! EncryptedExtensions messages. Every parameter is optional on the wire; absent parameters take
//! spec-defined defaults. The record produced here is immutable: values are assembled through
//! [`TransportParametersBuilder`], which enforces role restrictions and value bounds before a
//! record exists at all.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::config::{EndpointConfig, ServerConfig};
use crate::shared::{ConnectionId, ResetToken};
use crate::transport_error::{Code, TransportError};
use crate::varint::{VarInt, VarIntBoundsExceeded};
use crate::{is_draft_version, Side, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Streams are limited to 2^60 by the encoding of stream IDs
const MAX_STREAM_COUNT: u64 = 1 << 60;

/// TLS extension codepoint registered for QUIC v1 and v2
pub const EXTENSION_CODEPOINT: u16 = 0x0039;
/// Provisional TLS extension codepoint used by pre-RFC drafts
pub const EXTENSION_CODEPOINT_DRAFT: u16 = 0xffa5;

/// The extension codepoint carrying transport parameters under `version`
pub fn extension_codepoint(version: u32) -> u16 {
    if is_draft_version(version) {
        EXTENSION_CODEPOINT_DRAFT
    } else {
        EXTENSION_CODEPOINT
    }
}

// Apply a given macro to a list of all the transport parameters having integer types, along with
// their codes and default values. Using this helps us avoid error-prone duplication of the
// contained information across decoding, encoding, the builder, and the `Default` impl. Whenever
// we want to do something with transport parameters, we'll handle the bulk of cases by writing a
// macro that takes a list of arguments in this form, then passing it to this macro.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // name (id) = default,
            max_idle_timeout(0x0001) = 0,
            max_udp_payload_size(0x0003) = 65527,

            initial_max_data(0x0004) = 0,
            initial_max_stream_data_bidi_local(0x0005) = 0,
            initial_max_stream_data_bidi_remote(0x0006) = 0,
            initial_max_stream_data_uni(0x0007) = 0,

            initial_max_streams_bidi(0x0008) = 0,
            initial_max_streams_uni(0x0009) = 0,

            ack_delay_exponent(0x000a) = 3,
            max_ack_delay(0x000b) = 25,
            active_connection_id_limit(0x000e) = 2,

            max_datagram_frame_size(0x0020) = 0,
        }
    };
}

macro_rules! make_struct {
    {$($name:ident ($code:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $(pub(crate) $name: VarInt,)*

            /// Does the endpoint support active connection migration
            pub(crate) disable_active_migration: bool,

            /// The DCID from the first Initial packet; must be present in parameters sent by a
            /// server
            pub(crate) original_dst_cid: Option<ConnectionId>,
            /// The value the endpoint included in the Source Connection ID field of the first
            /// Initial packet it sends for the connection; required
            pub(crate) initial_src_cid: Option<ConnectionId>,
            /// The value of the Source Connection ID field from the first Retry packet sent by
            /// the server
            pub(crate) retry_src_cid: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset from the server
            pub(crate) stateless_reset_token: Option<ResetToken>,
            /// The server's preferred address for communication after handshake completion
            pub(crate) preferred_address: Option<PreferredAddress>,
            /// Compatible-version negotiation material
            pub(crate) version_information: Option<VersionInformation>,

            /// Number of zero bytes emitted under the `discard` codepoint; write-only, skipped by
            /// the parser like any other unrecognized parameter
            pub(crate) discard_len: u16,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: VarInt($default),)*

                    disable_active_migration: false,

                    original_dst_cid: None,
                    initial_src_cid: None,
                    retry_src_cid: None,
                    stateless_reset_token: None,
                    preferred_address: None,
                    version_information: None,

                    discard_len: 0,
                }
            }
        }

        impl TransportParameters {
            $(
                #[doc = concat!("The effective `", stringify!($name), "` value")]
                pub fn $name(&self) -> VarInt {
                    self.$name
                }
            )*
        }
    }
}

apply_params!(make_struct);

macro_rules! make_builder_setters {
    {$($name:ident ($code:expr) = $default:expr,)*} => {
        impl TransportParametersBuilder {
            $(
                #[doc = concat!("Set `", stringify!($name), "`")]
                pub fn $name(&mut self, value: VarInt) -> &mut Self {
                    self.params.$name = value;
                    self
                }
            )*
        }
    }
}

apply_params!(make_builder_setters);

/// Assembles an immutable [`TransportParameters`] record
///
/// Parameters a client must not send (`original_destination_connection_id`,
/// `stateless_reset_token`, `retry_source_connection_id`, `preferred_address`) are rejected when
/// the builder was created for [`Side::Client`]; all value bounds are checked by
/// [`build`](TransportParametersBuilder::build).
#[derive(Debug)]
pub struct TransportParametersBuilder {
    side: Side,
    params: TransportParameters,
}

impl TransportParametersBuilder {
    /// Start assembling the parameters `side` will send
    pub fn new(side: Side) -> Self {
        Self {
            side,
            params: TransportParameters::default(),
        }
    }

    /// Declare that this endpoint does not support connection migration
    pub fn disable_active_migration(&mut self) -> &mut Self {
        self.params.disable_active_migration = true;
        self
    }

    /// The Source Connection ID of the first Initial packet this endpoint sends
    pub fn initial_source_connection_id(&mut self, cid: ConnectionId) -> &mut Self {
        self.params.initial_src_cid = Some(cid);
        self
    }

    /// The version in use plus every other version this endpoint would accept
    pub fn version_information(&mut self, chosen: u32, available: &[u32]) -> &mut Self {
        self.params.version_information = Some(VersionInformation {
            chosen,
            available: available.to_vec(),
        });
        self
    }

    /// Append `len` zero bytes under the `discard` codepoint to inflate the extension
    pub fn discard_padding(&mut self, len: u16) -> &mut Self {
        self.params.discard_len = len;
        self
    }

    /// The DCID the client used for its first Initial packet; servers only
    pub fn original_destination_connection_id(
        &mut self,
        cid: ConnectionId,
    ) -> Result<&mut Self, Error> {
        self.server_only()?;
        self.params.original_dst_cid = Some(cid);
        Ok(self)
    }

    /// Token the client may use to recognize a stateless reset; servers only
    pub fn stateless_reset_token(&mut self, token: ResetToken) -> Result<&mut Self, Error> {
        self.server_only()?;
        self.params.stateless_reset_token = Some(token);
        Ok(self)
    }

    /// The SCID of the Retry packet that preceded this connection attempt; servers only
    pub fn retry_source_connection_id(&mut self, cid: ConnectionId) -> Result<&mut Self, Error> {
        self.server_only()?;
        self.params.retry_src_cid = Some(cid);
        Ok(self)
    }

    /// Address the server would prefer the client migrate to after the handshake; servers only
    pub fn preferred_address(&mut self, address: PreferredAddress) -> Result<&mut Self, Error> {
        self.server_only()?;
        self.params.preferred_address = Some(address);
        Ok(self)
    }

    /// Validate the assembled values and produce the record
    pub fn build(self) -> Result<TransportParameters, Error> {
        validate(&self.params, self.side)?;
        Ok(self.params)
    }

    fn server_only(&self) -> Result<(), Error> {
        if self.side.is_client() {
            return Err(Error::IllegalValue);
        }
        Ok(())
    }
}

/// Check the bounds RFC 9000 §18.2 imposes, plus role restrictions for parameters `sent_by` may
/// not send
fn validate(params: &TransportParameters, sent_by: Side) -> Result<(), Error> {
    if params.ack_delay_exponent.0 > 20
        || params.max_ack_delay.0 >= 1 << 14
        || params.active_connection_id_limit.0 < 2
        || params.max_udp_payload_size.0 < 1200
        || params.initial_max_streams_bidi.0 > MAX_STREAM_COUNT
        || params.initial_max_streams_uni.0 > MAX_STREAM_COUNT
        || params.initial_src_cid.is_none()
    {
        return Err(Error::IllegalValue);
    }
    if sent_by.is_client()
        && (params.original_dst_cid.is_some()
            || params.stateless_reset_token.is_some()
            || params.retry_src_cid.is_some()
            || params.preferred_address.is_some())
    {
        return Err(Error::IllegalValue);
    }
    Ok(())
}

/// A server's preferred address
///
/// This is communicated as a transport parameter during TLS session establishment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PreferredAddress {
    /// IPv4 endpoint, all-zero address on the wire when absent
    pub address_v4: Option<SocketAddrV4>,
    /// IPv6 endpoint, all-zero address on the wire when absent
    pub address_v6: Option<SocketAddrV6>,
    /// Connection ID to use when contacting the preferred address
    pub connection_id: ConnectionId,
    /// Reset token paired with `connection_id`
    pub stateless_reset_token: ResetToken,
}

impl PreferredAddress {
    fn wire_size(&self) -> u16 {
        4 + 2 + 16 + 2 + 1 + self.connection_id.len() as u16 + 16
    }

    fn write<W: BufMut>(&self, w: &mut W) {
        w.write(self.address_v4.map_or(Ipv4Addr::UNSPECIFIED, |x| *x.ip()));
        w.write::<u16>(self.address_v4.map_or(0, |x| x.port()));
        w.write(self.address_v6.map_or(Ipv6Addr::UNSPECIFIED, |x| *x.ip()));
        w.write::<u16>(self.address_v6.map_or(0, |x| x.port()));
        w.write::<u8>(self.connection_id.len() as u8);
        w.put_slice(&self.connection_id);
        w.put_slice(&self.stateless_reset_token);
    }

    fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        let ip_v4 = r.get::<Ipv4Addr>()?;
        let port_v4 = r.get::<u16>()?;
        let ip_v6 = r.get::<Ipv6Addr>()?;
        let port_v6 = r.get::<u16>()?;
        let cid_len = r.get::<u8>()? as usize;
        if cid_len > MAX_CID_SIZE {
            return Err(Error::Malformed);
        }
        let cid = ConnectionId::from_buf(r, cid_len)?;
        if r.remaining() < RESET_TOKEN_SIZE {
            return Err(Error::Malformed);
        }
        let mut token = [0; RESET_TOKEN_SIZE];
        r.copy_to_slice(&mut token);
        let address_v4 = if ip_v4.is_unspecified() {
            None
        } else {
            Some(SocketAddrV4::new(ip_v4, port_v4))
        };
        let address_v6 = if ip_v6.is_unspecified() {
            None
        } else {
            Some(SocketAddrV6::new(ip_v6, port_v6, 0, 0))
        };
        if address_v4.is_none() && address_v6.is_none() {
            return Err(Error::Malformed);
        }
        Ok(Self {
            address_v4,
            address_v6,
            connection_id: cid,
            stateless_reset_token: token.into(),
        })
    }
}

/// The negotiated version plus every other version the sender would have accepted
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionInformation {
    /// The version the sender chose for this connection
    pub chosen: u32,
    /// Other versions the sender supports, in preference order
    pub available: Vec<u32>,
}

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Parameter had a forbidden or out-of-bounds value, or a mandatory parameter was missing
    #[error("parameter had illegal value")]
    IllegalValue,
    /// A parameter id appeared more than once
    #[error("parameter appeared more than once")]
    Duplicate,
    /// Parameters could not be decoded
    #[error("parameters were malformed")]
    Malformed,
    /// Version information did not describe a usable version
    #[error("version information was inconsistent")]
    VersionNegotiation,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            // decode_error(50) TLS alert; the TLS stack reports this once a channel exists
            Error::Malformed => TransportError {
                code: Code::crypto(0x32),
                reason: "malformed transport parameters".into(),
            },
            Error::IllegalValue => TransportError::TRANSPORT_PARAMETER_ERROR("illegal value"),
            Error::Duplicate => TransportError::TRANSPORT_PARAMETER_ERROR("duplicate parameter"),
            Error::VersionNegotiation => {
                TransportError::VERSION_NEGOTIATION_ERROR("inconsistent version information")
            }
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

impl From<VarIntBoundsExceeded> for Error {
    fn from(_: VarIntBoundsExceeded) -> Self {
        Error::Malformed
    }
}

/// Best-effort names for parameter ids this implementation skips
fn parameter_name(id: u64) -> Option<&'static str> {
    Some(match id {
        0x173e => "discard",
        0x2ab2 => "grease_quic_bit",
        0xff04_de1b => "min_ack_delay",
        _ => return None,
    })
}

impl TransportParameters {
    /// Standard parameters for a server accepting `original_dst_cid`, derived from configuration
    pub fn from_server_config(
        server_config: &ServerConfig,
        endpoint_config: &EndpointConfig,
        initial_src_cid: ConnectionId,
        original_dst_cid: ConnectionId,
        stateless_reset_token: Option<ResetToken>,
    ) -> Result<Self, Error> {
        let transport = &server_config.transport;
        let mut builder = TransportParametersBuilder::new(Side::Server);
        builder
            .initial_max_data(transport.receive_window)
            .initial_max_stream_data_bidi_local(transport.stream_receive_window)
            .initial_max_stream_data_bidi_remote(transport.stream_receive_window)
            .initial_max_stream_data_uni(transport.stream_receive_window)
            .initial_max_streams_bidi(transport.max_concurrent_bidi_streams)
            .initial_max_streams_uni(transport.max_concurrent_uni_streams)
            .ack_delay_exponent(transport.ack_delay_exponent)
            .max_ack_delay(VarInt::from_u64(transport.max_ack_delay.as_millis() as u64)?)
            .max_udp_payload_size(endpoint_config.max_udp_payload_size)
            .initial_source_connection_id(initial_src_cid)
            .version_information(
                endpoint_config.initial_version,
                &endpoint_config.supported_versions,
            );
        if let Some(timeout) = transport.max_idle_timeout {
            builder.max_idle_timeout(VarInt::from_u64(timeout.as_millis() as u64)?);
        }
        if let Some(size) = transport.datagram_receive_buffer_size {
            builder.max_datagram_frame_size(VarInt::from_u64(size.min(65535) as u64)?);
        }
        if !server_config.migration {
            builder.disable_active_migration();
        }
        builder.original_destination_connection_id(original_dst_cid)?;
        if let Some(token) = stateless_reset_token {
            builder.stateless_reset_token(token)?;
        }
        if server_config.discard_transport_parameter_size > 0 {
            builder.discard_padding(server_config.discard_transport_parameter_size);
        }
        builder.build()
    }

    /// Encode the extension payload: a sequence of `(id, length, value)` triples
    ///
    /// Each id is emitted at most once; parameters still at their default are omitted.
    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($name:ident ($code:expr) = $default:expr,)*} => {
                $(
                    if self.$name.0 != $default {
                        w.write_var($code);
                        w.write_var(self.$name.size() as u64);
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if let Some(ref x) = self.original_dst_cid {
            w.write_var(0x0000);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }

        if let Some(ref x) = self.stateless_reset_token {
            w.write_var(0x0002);
            w.write_var(RESET_TOKEN_SIZE as u64);
            w.put_slice(x);
        }

        if self.disable_active_migration {
            w.write_var(0x000c);
            w.write_var(0);
        }

        if let Some(ref x) = self.preferred_address {
            w.write_var(0x000d);
            w.write_var(x.wire_size() as u64);
            x.write(w);
        }

        if let Some(ref x) = self.initial_src_cid {
            w.write_var(0x000f);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }

        if let Some(ref x) = self.retry_src_cid {
            w.write_var(0x0010);
            w.write_var(x.len() as u64);
            w.put_slice(x);
        }

        if let Some(ref x) = self.version_information {
            w.write_var(0x0011);
            w.write_var(4 * (1 + x.available.len()) as u64);
            w.write::<u32>(x.chosen);
            for &version in &x.available {
                w.write::<u32>(version);
            }
        }

        if self.discard_len > 0 {
            w.write_var(0x173e);
            w.write_var(self.discard_len as u64);
            for _ in 0..self.discard_len {
                w.write::<u8>(0);
            }
        }
    }

    /// Decode an extension payload sent by `!side`
    ///
    /// Unknown parameter ids are skipped; every recognized id may appear at most once, and the
    /// bytes a value occupies must match its declared length exactly.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        // Initialize to protocol-specified defaults
        let mut params = TransportParameters::default();

        // State to check for duplicate transport parameters.
        macro_rules! param_state {
            {$($name:ident ($code:expr) = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }

                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);
        let mut skipped = Vec::new();

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let len = len as usize;

            match id {
                0x0000 => {
                    if params.original_dst_cid.is_some() {
                        return Err(Error::Duplicate);
                    }
                    if len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    params.original_dst_cid = Some(ConnectionId::from_buf(r, len)?);
                }
                0x0002 => {
                    if params.stateless_reset_token.is_some() {
                        return Err(Error::Duplicate);
                    }
                    if len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token.into());
                }
                0x000c => {
                    if params.disable_active_migration {
                        return Err(Error::Duplicate);
                    }
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x000d => {
                    if params.preferred_address.is_some() {
                        return Err(Error::Duplicate);
                    }
                    let mut sub = r.take(len);
                    let address = PreferredAddress::read(&mut sub)?;
                    if sub.has_remaining() {
                        return Err(Error::Malformed);
                    }
                    params.preferred_address = Some(address);
                }
                0x000f => {
                    if params.initial_src_cid.is_some() {
                        return Err(Error::Duplicate);
                    }
                    if len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    params.initial_src_cid = Some(ConnectionId::from_buf(r, len)?);
                }
                0x0010 => {
                    if params.retry_src_cid.is_some() {
                        return Err(Error::Duplicate);
                    }
                    if len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    params.retry_src_cid = Some(ConnectionId::from_buf(r, len)?);
                }
                0x0011 => {
                    if params.version_information.is_some() {
                        return Err(Error::Duplicate);
                    }
                    if len == 0 || len % 4 != 0 {
                        return Err(Error::Malformed);
                    }
                    let chosen = r.get::<u32>()?;
                    let mut available = Vec::with_capacity(len / 4 - 1);
                    for _ in 0..len / 4 - 1 {
                        available.push(r.get::<u32>()?);
                    }
                    if chosen == 0 || available.contains(&0) {
                        return Err(Error::VersionNegotiation);
                    }
                    params.version_information = Some(VersionInformation { chosen, available });
                }
                _ => {
                    macro_rules! parse {
                        {$($name:ident ($code:expr) = $default:expr,)*} => {
                            match id {
                                $($code => {
                                    if got.$name {
                                        return Err(Error::Duplicate);
                                    }
                                    let value = r.get_var()?;
                                    if len != VarInt(value).size() {
                                        return Err(Error::Malformed);
                                    }
                                    params.$name = VarInt(value);
                                    got.$name = true;
                                })*
                                _ => {
                                    if skipped.contains(&id) {
                                        return Err(Error::Duplicate);
                                    }
                                    skipped.push(id);
                                    match parameter_name(id) {
                                        Some(name) => debug!(id, name, "skipping transport parameter"),
                                        None if id % 31 == 27 => trace!(id, "skipping reserved transport parameter"),
                                        None => debug!(id, "skipping unknown transport parameter"),
                                    }
                                    r.advance(len);
                                }
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        validate(&params, !side)?;
        Ok(params)
    }

    /// Encode the complete TLS extension: codepoint, 2-byte length, then the payload
    pub fn write_extension<W: BufMut>(&self, version: u32, w: &mut W) {
        let mut payload = Vec::new();
        self.write(&mut payload);
        w.write::<u16>(extension_codepoint(version));
        w.write::<u16>(payload.len() as u16);
        w.put_slice(&payload);
    }

    /// Decode a complete TLS extension produced by `write_extension`
    pub fn read_extension<R: Buf>(side: Side, version: u32, r: &mut R) -> Result<Self, Error> {
        let codepoint = r.get::<u16>()?;
        if codepoint != extension_codepoint(version) {
            return Err(Error::Malformed);
        }
        let len = r.get::<u16>()? as usize;
        if r.remaining() < len {
            return Err(Error::Malformed);
        }
        let mut sub = r.take(len);
        let params = Self::read(side, &mut sub)?;
        debug_assert!(!sub.has_remaining());
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VERSION_1;
    use assert_matches::assert_matches;

    fn base_params(side: Side) -> TransportParametersBuilder {
        let mut builder = TransportParametersBuilder::new(side);
        builder.initial_source_connection_id(ConnectionId::new(&[0xcc; 8]));
        builder
    }

    #[test]
    fn coding() {
        let mut builder = base_params(Side::Server);
        builder
            .initial_max_streams_bidi(VarInt(16))
            .initial_max_streams_uni(VarInt(16))
            .ack_delay_exponent(VarInt(2))
            .max_udp_payload_size(VarInt(1200))
            .disable_active_migration()
            .version_information(VERSION_1, &[VERSION_1, 0xff00_001d]);
        builder
            .original_destination_connection_id(ConnectionId::new(&[0xab; 8]))
            .unwrap()
            .stateless_reset_token(ResetToken::from([0xab; RESET_TOKEN_SIZE]))
            .unwrap()
            .preferred_address(PreferredAddress {
                address_v4: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 42)),
                address_v6: None,
                connection_id: ConnectionId::new(&[0x01, 0x02]),
                stateless_reset_token: [0xab; RESET_TOKEN_SIZE].into(),
            })
            .unwrap();
        let params = builder.build().unwrap();

        let mut buf = Vec::new();
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap(),
            params
        );
    }

    #[test]
    fn extension_framing() {
        let params = base_params(Side::Client).build().unwrap();
        let mut buf = Vec::new();
        params.write_extension(VERSION_1, &mut buf);
        assert_eq!(&buf[..2], &[0x00, 0x39]);
        assert_eq!(
            TransportParameters::read_extension(Side::Server, VERSION_1, &mut buf.as_slice())
                .unwrap(),
            params
        );
        // A draft version selects the provisional codepoint, which v1 then refuses
        let mut draft = Vec::new();
        params.write_extension(0xff00_001d, &mut draft);
        assert_eq!(&draft[..2], &[0xff, 0xa5]);
        assert_matches!(
            TransportParameters::read_extension(Side::Server, VERSION_1, &mut draft.as_slice()),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut buf = Vec::new();
        // initial_max_data twice
        for _ in 0..2 {
            buf.write_var(0x0004);
            buf.write_var(1);
            buf.write_var(42);
        }
        assert_matches!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::Duplicate)
        );
    }

    #[test]
    fn duplicate_unknown_id_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(0x4321);
            buf.write_var(2);
            buf.put_slice(&[0; 2]);
        }
        assert_matches!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::Duplicate)
        );
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut buf = Vec::new();
        // value occupies one byte but two are declared
        buf.write_var(0x0004);
        buf.write_var(2);
        buf.write_var(42);
        buf.write::<u8>(0);
        assert_matches!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_id_skipped() {
        let params = base_params(Side::Client).build().unwrap();
        let mut buf = Vec::new();
        buf.write_var(0x4321);
        buf.write_var(3);
        buf.put_slice(&[1, 2, 3]);
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()).unwrap(),
            params
        );
    }

    #[test]
    fn discard_emitted_and_skipped() {
        let mut builder = base_params(Side::Client);
        builder.discard_padding(64);
        let params = builder.build().unwrap();
        let mut buf = Vec::new();
        params.write(&mut buf);

        let parsed = TransportParameters::read(Side::Server, &mut buf.as_slice()).unwrap();
        assert_eq!(parsed.discard_len, 0);
        assert_eq!(parsed.initial_src_cid, params.initial_src_cid);
        // id 0x173e as a two-byte varint, followed by the declared run of zeros
        let marker = [0x57, 0x3e, 0x40, 0x40];
        assert!(buf
            .windows(marker.len())
            .any(|window| window == marker));
    }

    #[test]
    fn server_only_params_refused_from_client() {
        let mut buf = Vec::new();
        let mut server = base_params(Side::Server);
        server
            .stateless_reset_token(ResetToken::from([0xab; RESET_TOKEN_SIZE]))
            .unwrap();
        server.build().unwrap().write(&mut buf);
        // Reading the same bytes as though a client had sent them must fail
        assert_matches!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::IllegalValue)
        );
        assert_matches!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()),
            Ok(_)
        );
    }

    #[test]
    fn builder_enforces_role() {
        let mut builder = TransportParametersBuilder::new(Side::Client);
        assert_matches!(
            builder.stateless_reset_token(ResetToken::from([0; RESET_TOKEN_SIZE])),
            Err(Error::IllegalValue)
        );
        assert_matches!(
            builder.original_destination_connection_id(ConnectionId::new(&[1; 4])),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn bounds_validated() {
        let mut buf = Vec::new();
        let mut params = base_params(Side::Client).build().unwrap();
        params.ack_delay_exponent = VarInt(21);
        params.write(&mut buf);
        assert_matches!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::IllegalValue)
        );

        let mut builder = base_params(Side::Client);
        builder.max_ack_delay(VarInt(1 << 14));
        assert_matches!(builder.build(), Err(Error::IllegalValue));
    }

    #[test]
    fn missing_initial_source_connection_id() {
        assert_matches!(
            TransportParametersBuilder::new(Side::Client).build(),
            Err(Error::IllegalValue)
        );
        assert_matches!(
            TransportParameters::read(Side::Server, &mut &[][..]),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn version_information_length() {
        for &bad_len in &[0x3u64, 0x6] {
            let mut buf = Vec::new();
            buf.write_var(0x0011);
            buf.write_var(bad_len);
            buf.put_slice(&vec![0x01; bad_len as usize]);
            assert_matches!(
                TransportParameters::read(Side::Server, &mut buf.as_slice()),
                Err(Error::Malformed)
            );
        }
    }

    #[test]
    fn preferred_address_requires_a_family()  {
        let absent = PreferredAddress {
            address_v4: None,
            address_v6: None,
            connection_id: ConnectionId::new(&[]),
            stateless_reset_token: [0xab; RESET_TOKEN_SIZE].into(),
        };
        let mut buf = Vec::new();
        absent.write(&mut buf);
        assert_matches!(
            PreferredAddress::read(&mut buf.as_slice()),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn from_server_config_round_trips() {
        let server_config = ServerConfig::default();
        let endpoint_config = EndpointConfig::default();
        let params = TransportParameters::from_server_config(
            &server_config,
            &endpoint_config,
            ConnectionId::new(&[0x11; 8]),
            ConnectionId::new(&[0x22; 8]),
            Some([0x5a; RESET_TOKEN_SIZE].into()),
        )
        .unwrap();
        let mut buf = Vec::new();
        params.write(&mut buf);
        let parsed = TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap();
        assert_eq!(parsed, params);
        assert_eq!(parsed.original_dst_cid, Some(ConnectionId::new(&[0x22; 8])));
        assert_eq!(
            parsed.version_information.as_ref().unwrap().chosen,
            VERSION_1
        );
    }
}
