//! Encryption seams.
//!
//! Two independent choices feed a connection's cipher:
//! - a [`KeyExchange`] produces the public key to send and the shared
//!   [`KeyMaterial`] to use;
//! - a [`CipherSuite`] turns key material into [`Encryptor`]s, one per
//!   direction.
//!
//! # Implementors
//!
//! - `ChaChaSuite` (questnet-module): ChaCha20 keystream cipher.
//! - `PresharedExchange` (questnet-module): fixed key material, no math.

use crate::error::{NetError, NetResult};

/// How ciphertext is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// One continuous keystream across all frames in a direction.
    Stream,
    /// Each frame enciphered independently and prefixed with its
    /// 4-byte little-endian ciphertext length.
    Package,
}

/// In-place cipher for one direction of one connection.
///
/// **Contract:**
/// - output length equals input length;
/// - in `Package` mode each call is independent;
/// - in `Stream` mode successive calls continue the same keystream.
pub trait Encryptor: Send {
    fn encrypt(&mut self, data: &mut [u8]);
    fn decrypt(&mut self, data: &mut [u8]);
}

/// Shared secret negotiated for one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl core::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KeyMaterial {{ key: {} bytes, iv: {} bytes }}", self.key.len(), self.iv.len())
    }
}

/// Builds encryptors from key material.
pub trait CipherSuite: Send + Sync {
    fn create(&self, material: &KeyMaterial, mode: CipherMode) -> NetResult<Box<dyn Encryptor>>;
}

/// Result of one key negotiation.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Sent to the peer in the `*key` quest.
    pub public_key: Vec<u8>,
    pub material: KeyMaterial,
}

/// Produces per-connection key material.
pub trait KeyExchange: Send + Sync {
    /// Key size announced to the peer.
    fn key_bits(&self) -> u16;

    fn negotiate(&self) -> NetResult<Handshake>;
}

/// Payload of the `*key` quest.
///
/// Layout: flags u8 (bit 0 = stream mode), key bits u16 LE, public key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandshake {
    pub public_key: Vec<u8>,
    pub stream_mode: bool,
    pub bits: u16,
}

impl KeyHandshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.public_key.len());
        out.push(self.stream_mode as u8);
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn decode(payload: &[u8]) -> NetResult<Self> {
        if payload.len() < 3 {
            return Err(NetError::Codec(format!(
                "key handshake too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            stream_mode: payload[0] & 1 == 1,
            bits: u16::from_le_bytes([payload[1], payload[2]]),
            public_key: payload[3..].to_vec(),
        })
    }

    pub fn mode(&self) -> CipherMode {
        if self.stream_mode {
            CipherMode::Stream
        } else {
            CipherMode::Package
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_handshake_layout() {
        let hs = KeyHandshake {
            public_key: vec![0xAA, 0xBB],
            stream_mode: true,
            bits: 256,
        };
        let bytes = hs.encode();
        assert_eq!(bytes, vec![1, 0x00, 0x01, 0xAA, 0xBB]);
        let back = KeyHandshake::decode(&bytes).unwrap();
        assert_eq!(back, hs);
        assert_eq!(back.mode(), CipherMode::Stream);
    }

    #[test]
    fn test_key_handshake_too_short() {
        assert!(matches!(KeyHandshake::decode(&[1, 2]), Err(NetError::Codec(_))));
    }

    #[test]
    fn test_key_material_debug_hides_bytes() {
        let m = KeyMaterial {
            key: vec![7; 32],
            iv: vec![9; 16],
        };
        let s = format!("{:?}", m);
        assert!(s.contains("32 bytes"));
        assert!(!s.contains('7'.to_string().repeat(2).as_str()));
    }
}
