//! `ChaChaSuite` - default `CipherSuite`, and `PresharedExchange` - a
//! `KeyExchange` that hands out fixed key material.
//!
//! The cipher XORs data with a ChaCha20 keystream. The 32-byte seed is the
//! key repeated to length; the first 8 IV bytes (little-endian) select the
//! stream. In `Package` mode every call restarts the keystream; in `Stream`
//! mode the keystream continues across calls, so both ends must process the
//! same bytes in the same order.

use questnet_core::encryptor::{CipherMode, CipherSuite, Encryptor, Handshake, KeyExchange, KeyMaterial};
use questnet_core::{NetError, NetResult};

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

const BLOCK: usize = 64;

pub struct ChaChaEncryptor {
    seed: [u8; 32],
    stream: u64,
    mode: CipherMode,
    rng: ChaCha20Rng,
    block: [u8; BLOCK],
    pos: usize,
}

impl ChaChaEncryptor {
    pub fn new(material: &KeyMaterial, mode: CipherMode) -> NetResult<Self> {
        if material.key.is_empty() {
            return Err(NetError::Config("empty cipher key".into()));
        }
        let mut seed = [0u8; 32];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = material.key[i % material.key.len()];
        }
        let mut iv = [0u8; 8];
        for (dst, src) in iv.iter_mut().zip(material.iv.iter()) {
            *dst = *src;
        }
        let stream = u64::from_le_bytes(iv);
        Ok(Self {
            seed,
            stream,
            mode,
            rng: Self::keystream(&seed, stream),
            block: [0u8; BLOCK],
            pos: BLOCK,
        })
    }

    fn keystream(seed: &[u8; 32], stream: u64) -> ChaCha20Rng {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        rng.set_stream(stream);
        rng
    }

    fn restart(&mut self) {
        self.rng = Self::keystream(&self.seed, self.stream);
        self.pos = BLOCK;
    }

    fn apply(&mut self, data: &mut [u8]) {
        if self.mode == CipherMode::Package {
            self.restart();
        }
        for b in data.iter_mut() {
            if self.pos == BLOCK {
                self.rng.fill_bytes(&mut self.block);
                self.pos = 0;
            }
            *b ^= self.block[self.pos];
            self.pos += 1;
        }
    }
}

impl Encryptor for ChaChaEncryptor {
    fn encrypt(&mut self, data: &mut [u8]) {
        self.apply(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        self.apply(data);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaSuite;

impl CipherSuite for ChaChaSuite {
    fn create(&self, material: &KeyMaterial, mode: CipherMode) -> NetResult<Box<dyn Encryptor>> {
        Ok(Box::new(ChaChaEncryptor::new(material, mode)?))
    }
}

/// Key exchange with out-of-band shared material. The public key sent to
/// the peer is an identifier the peer uses to look the material up.
#[derive(Debug, Clone)]
pub struct PresharedExchange {
    key_id: Vec<u8>,
    material: KeyMaterial,
}

impl PresharedExchange {
    pub fn new(key_id: Vec<u8>, key: Vec<u8>, iv: Vec<u8>) -> Self {
        Self {
            key_id,
            material: KeyMaterial { key, iv },
        }
    }
}

impl KeyExchange for PresharedExchange {
    fn key_bits(&self) -> u16 {
        (self.material.key.len() * 8).min(u16::MAX as usize) as u16
    }

    fn negotiate(&self) -> NetResult<Handshake> {
        Ok(Handshake {
            public_key: self.key_id.clone(),
            material: self.material.clone(),
        })
    }
}
