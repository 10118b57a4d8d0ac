//! ClientHello completeness detection
//!
//! A framing-level scan of the TLS 1.3 handshake stream, not a TLS implementation: it finds the
//! end of the first handshake message and the location of the `quic_transport_parameters`
//! extension, leaving cipher-suite selection, key exchange and everything else to the external
//! TLS engine.

use bytes::{Buf, Bytes};

use super::{ClientHelloStatus, HandshakeReader};
use crate::coding::BufExt;
use crate::transport_error::{Code, TransportError};
use crate::transport_parameters::extension_codepoint;

/// TLS 1.3 handshake message type opening every connection attempt
const CLIENT_HELLO: u8 = 0x01;

/// Default [`HandshakeReader`]: detects ClientHello completeness and locates the
/// transport-parameters extension
#[derive(Debug)]
pub struct ClientHelloScanner {
    extension: u16,
}

impl ClientHelloScanner {
    /// Scanner for handshakes negotiated under `version`
    pub fn new(version: u32) -> Self {
        Self {
            extension: extension_codepoint(version),
        }
    }

    fn extract_transport_parameters(
        &self,
        body: &[u8],
    ) -> Result<Option<Bytes>, TransportError> {
        let mut r = body;
        // legacy_version + random
        skip(&mut r, 2 + 32)?;
        let session_id_len = BufExt::get::<u8>(&mut r).map_err(|_| malformed())? as usize;
        skip(&mut r, session_id_len)?;
        let cipher_suites_len = BufExt::get::<u16>(&mut r).map_err(|_| malformed())? as usize;
        skip(&mut r, cipher_suites_len)?;
        let compression_len = BufExt::get::<u8>(&mut r).map_err(|_| malformed())? as usize;
        skip(&mut r, compression_len)?;
        if !r.has_remaining() {
            return Ok(None);
        }
        let extensions_len = BufExt::get::<u16>(&mut r).map_err(|_| malformed())? as usize;
        // The extension list is the final field; trailing bytes are not tolerated
        if r.remaining() != extensions_len {
            return Err(malformed());
        }
        let mut found = None;
        while r.has_remaining() {
            let ty = BufExt::get::<u16>(&mut r).map_err(|_| malformed())?;
            let len = BufExt::get::<u16>(&mut r).map_err(|_| malformed())? as usize;
            if r.remaining() < len {
                return Err(malformed());
            }
            if ty == self.extension {
                if found.is_some() {
                    return Err(malformed());
                }
                found = Some(Bytes::copy_from_slice(&r[..len]));
            }
            r.advance(len);
        }
        Ok(found)
    }
}

impl HandshakeReader for ClientHelloScanner {
    fn feed_client_hello(&mut self, buf: &[u8]) -> Result<ClientHelloStatus, TransportError> {
        if buf.len() < 4 {
            return Ok(ClientHelloStatus::Incomplete);
        }
        if buf[0] != CLIENT_HELLO {
            // unexpected_message(10) TLS alert
            return Err(TransportError {
                code: Code::crypto(0x0a),
                reason: "handshake did not begin with a ClientHello".into(),
            });
        }
        let body_len = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + body_len {
            return Ok(ClientHelloStatus::Incomplete);
        }
        let transport_parameters = self.extract_transport_parameters(&buf[4..4 + body_len])?;
        Ok(ClientHelloStatus::Complete {
            len: 4 + body_len,
            transport_parameters,
        })
    }
}

fn skip(r: &mut &[u8], n: usize) -> Result<(), TransportError> {
    if r.remaining() < n {
        return Err(malformed());
    }
    r.advance(n);
    Ok(())
}

// decode_error(50) TLS alert
fn malformed() -> TransportError {
    TransportError {
        code: Code::crypto(0x32),
        reason: "malformed ClientHello".into(),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use bytes::BufMut;

    /// Assemble a syntactically valid ClientHello carrying `extensions` as `(type, payload)`
    pub(crate) fn client_hello(extensions: &[(u16, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u16(0x0303); // legacy_version
        body.put_slice(&[0x2a; 32]); // random
        body.put_u8(0); // legacy_session_id
        body.put_u16(2);
        body.put_u16(0x1301); // TLS_AES_128_GCM_SHA256
        body.put_u8(1);
        body.put_u8(0); // null compression

        let mut exts = Vec::new();
        // supported_versions: TLS 1.3 only
        exts.put_u16(0x002b);
        exts.put_u16(3);
        exts.put_u8(2);
        exts.put_u16(0x0304);
        for &(ty, payload) in extensions {
            exts.put_u16(ty);
            exts.put_u16(payload.len() as u16);
            exts.put_slice(payload);
        }
        body.put_u16(exts.len() as u16);
        body.put_slice(&exts);

        let mut msg = Vec::with_capacity(4 + body.len());
        msg.put_u8(super::CLIENT_HELLO);
        msg.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.put_slice(&body);
        msg
    }
}
