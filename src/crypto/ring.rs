//! Initial packet protection based on *ring*
//!
//! Initial keys are derived deterministically from the client's first Destination Connection ID
//! (RFC 9001 §5.2), so the server can unseal a client's first flight without any per-connection
//! state, and any on-path observer could do the same; they provide no confidentiality, only
//! protection against off-path spoofing.

use bytes::{BufMut, BytesMut};
use ring::{aead, hkdf};

use super::{CryptoError, HeaderKey, KeyPair, PacketKey};
use crate::shared::ConnectionId;
use crate::Side;

/// Salt prepended to the client's DCID when extracting v1 Initial secrets
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Complete packet protection state for the Initial encryption level
pub struct InitialKeys {
    /// Header protection keys
    pub header: KeyPair<RingHeaderKey>,
    /// Payload protection keys
    pub packet: KeyPair<RingPacketKey>,
}

impl InitialKeys {
    /// Derive `side`'s keys for the connection opened with `dst_cid`
    pub fn new(dst_cid: &ConnectionId, side: Side) -> Self {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
        let initial_secret = salt.extract(dst_cid);
        let client = DirectionKeys::new(&initial_secret, b"client in");
        let server = DirectionKeys::new(&initial_secret, b"server in");
        let (local, remote) = match side {
            Side::Client => (client, server),
            Side::Server => (server, client),
        };
        Self {
            header: KeyPair {
                local: local.header,
                remote: remote.header,
            },
            packet: KeyPair {
                local: local.packet,
                remote: remote.packet,
            },
        }
    }
}

struct DirectionKeys {
    packet: RingPacketKey,
    header: RingHeaderKey,
}

impl DirectionKeys {
    fn new(initial_secret: &hkdf::Prk, label: &[u8]) -> Self {
        let (key, iv, hp) = key_material(initial_secret, label);
        Self {
            packet: RingPacketKey::new(key, iv),
            header: RingHeaderKey::new(hp),
        }
    }
}

/// Expand the AES-128-GCM key, IV and header-protection key for one direction
fn key_material(initial_secret: &hkdf::Prk, label: &[u8]) -> ([u8; 16], [u8; 12], [u8; 16]) {
    let mut secret = [0; 32];
    hkdf_expand(initial_secret, label, &mut secret);
    let secret = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret);
    let mut key = [0; 16];
    hkdf_expand(&secret, b"quic key", &mut key);
    let mut iv = [0; 12];
    hkdf_expand(&secret, b"quic iv", &mut iv);
    let mut hp = [0; 16];
    hkdf_expand(&secret, b"quic hp", &mut hp);
    (key, iv, hp)
}

/// HKDF-Expand-Label as defined by TLS 1.3, with an empty context
fn hkdf_expand(key: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const BASE_LABEL: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + BASE_LABEL.len() + label.len() + 1);
    info.put_u16(out.len() as u16);
    info.put_u8((BASE_LABEL.len() + label.len()) as u8);
    info.extend_from_slice(BASE_LABEL);
    info.extend_from_slice(label);
    info.put_u8(0);
    key.expand(&[&info], OutLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// AES-128-GCM payload protection for one direction
pub struct RingPacketKey {
    key: aead::LessSafeKey,
    iv: [u8; 12],
}

impl RingPacketKey {
    fn new(key: [u8; 16], iv: [u8; 12]) -> Self {
        Self {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap(),
            ),
            iv,
        }
    }

    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = [0; 12];
        nonce[4..].copy_from_slice(&packet.to_be_bytes());
        for (nonce, iv) in nonce.iter_mut().zip(self.iv.iter()) {
            *nonce ^= iv;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl PacketKey for RingPacketKey {
    fn encrypt(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize) {
        let (header, payload) = buf.split_at_mut(header_len);
        let aad = aead::Aad::from(&*header);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet), aad, payload)
            .unwrap();
        buf.extend_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain = self
            .key
            .open_in_place(self.nonce(packet), aead::Aad::from(header), payload.as_mut())
            .map_err(|_| CryptoError)?;
        let plain_len = plain.len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

/// AES-based header protection for one direction
pub struct RingHeaderKey(aead::quic::HeaderProtectionKey);

impl RingHeaderKey {
    fn new(hp: [u8; 16]) -> Self {
        Self(aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp).unwrap())
    }

    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        self.0.new_mask(sample).unwrap()
    }
}

impl HeaderKey for RingHeaderKey {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let sample_start = pn_offset + 4;
        let mask = self.mask(&packet[sample_start..sample_start + self.sample_size()]);
        // Long headers protect the low four bits of the first byte, short headers five
        if packet[0] & 0x80 != 0 {
            packet[0] ^= mask[0] & 0x0f;
        } else {
            packet[0] ^= mask[0] & 0x1f;
        }
        let pn_length = (packet[0] & 0x03) as usize + 1;
        for (out, inp) in packet[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let pn_length = (packet[0] & 0x03) as usize + 1;
        let sample_start = pn_offset + 4;
        let mask = self.mask(&packet[sample_start..sample_start + self.sample_size()]);
        if packet[0] & 0x80 != 0 {
            packet[0] ^= mask[0] & 0x0f;
        } else {
            packet[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in packet[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }
}
