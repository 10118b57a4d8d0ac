use std::fmt;

use bytes::Buf;
use rand::RngCore;

use crate::coding::{self, UnexpectedEnd};
use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    ///
    /// # Panics
    /// - if `bytes.len() > MAX_CID_SIZE`
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random CID of the given length
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Read a CID of known length out of a buffer
    pub(crate) fn from_buf<B: Buf>(buf: &mut B, len: usize) -> coding::Result<Self> {
        debug_assert!(len <= MAX_CID_SIZE);
        if buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res.bytes[..len]);
        Ok(res)
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Used by an endpoint to securely communicate that it has lost state for a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetToken(pub(crate) [u8; RESET_TOKEN_SIZE]);

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ::std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_round_trip() {
        let cid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        assert_eq!(cid.len(), 8);
        assert_eq!(cid.to_string(), "8394c8f03e515708");
        let mut buf = &cid[..];
        let decoded = ConnectionId::from_buf(&mut buf, 8).unwrap();
        assert_eq!(decoded, cid);
    }

    #[test]
    fn random_cid_length() {
        let mut rng = rand::thread_rng();
        let cid = ConnectionId::random(&mut rng, MAX_CID_SIZE);
        assert_eq!(cid.len(), MAX_CID_SIZE);
        let empty = ConnectionId::random(&mut rng, 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn cid_short_buffer() {
        let bytes = [0xab; 4];
        assert_eq!(
            ConnectionId::from_buf(&mut &bytes[..], 8),
            Err(UnexpectedEnd)
        );
    }
}
