//! AES-128 session encryption.
//!
//! An encrypted full frame keeps its first four bytes (the call-number
//! words) in the clear; everything after is CBC-chained AES-128 with a zero
//! IV. The plaintext is prefixed with a random pad of 16 to 31 bytes whose
//! length, minus 16, sits in the low nibble of pad byte 15, sizing the whole
//! plaintext to a block multiple.
//!
//! Session keys come from the MD5 digest of `challenge || secret`. With key
//! rotation negotiated, RTKEY installs a fresh digest mid-call; the old key
//! is kept around so queued retransmissions can be decrypted, re-stamped and
//! re-encrypted under the new one.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::{EngineError, EngineResult};

pub const BLOCK_LEN: usize = 16;
pub const MIN_PAD: usize = 16;
pub const MAX_PAD: usize = 31;

/// Bytes of an encrypted datagram that stay in the clear.
pub const CLEAR_PREFIX: usize = 4;

/// Derives a 16-byte session key from an auth exchange.
pub fn derive_key(challenge: &str, secret: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Digests raw rotation material into the installable key.
pub fn rotate_key(raw: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(raw);
    hasher.finalize().into()
}

fn cbc_encrypt(cipher: &Aes128, buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % BLOCK_LEN, 0);
    let mut last = [0u8; BLOCK_LEN];
    for block in buf.chunks_exact_mut(BLOCK_LEN) {
        for (b, l) in block.iter_mut().zip(last.iter()) {
            *b ^= l;
        }
        let ga = GenericArray::from_mut_slice(block);
        cipher.encrypt_block(ga);
        last.copy_from_slice(block);
    }
}

fn cbc_decrypt(cipher: &Aes128, buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % BLOCK_LEN, 0);
    let mut last = [0u8; BLOCK_LEN];
    for block in buf.chunks_exact_mut(BLOCK_LEN) {
        let mut cipher_block = [0u8; BLOCK_LEN];
        cipher_block.copy_from_slice(block);
        let ga = GenericArray::from_mut_slice(block);
        cipher.decrypt_block(ga);
        for (b, l) in block.iter_mut().zip(last.iter()) {
            *b ^= l;
        }
        last = cipher_block;
    }
}

/// Per-call encryption context.
#[derive(Default)]
pub struct EncryptionState {
    /// ENCRYPT_* bits both sides agreed on. Zero means cleartext.
    pub methods: u16,
    encrypt_key: Option<[u8; 16]>,
    decrypt_key: Option<[u8; 16]>,
    /// The encrypt key in force before the last rotation, for decrypting our
    /// own pre-rotation retransmit queue.
    previous_encrypt_key: Option<[u8; 16]>,
}

impl std::fmt::Debug for EncryptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionState")
            .field("methods", &self.methods)
            .field("encrypt_key", &self.encrypt_key.is_some())
            .field("decrypt_key", &self.decrypt_key.is_some())
            .field("previous_encrypt_key", &self.previous_encrypt_key.is_some())
            .finish()
    }
}

impl EncryptionState {
    pub fn active(&self) -> bool {
        self.encrypt_key.is_some()
    }

    pub fn keyrotate_enabled(&self) -> bool {
        self.methods & iax2_proto::constants::ENCRYPT_KEYROTATE != 0
    }

    /// Installs the initial session keys after authentication.
    pub fn set_keys(&mut self, key: [u8; 16]) {
        self.encrypt_key = Some(key);
        self.decrypt_key = Some(key);
        self.previous_encrypt_key = None;
    }

    /// Installs a rotated transmit key (we sent RTKEY).
    pub fn install_tx_key(&mut self, key: [u8; 16]) {
        self.previous_encrypt_key = self.encrypt_key.take();
        self.encrypt_key = Some(key);
    }

    /// Installs a rotated receive key (peer sent RTKEY).
    pub fn install_rx_key(&mut self, key: [u8; 16]) {
        self.decrypt_key = Some(key);
    }

    /// Encrypts an encoded full frame for the wire.
    pub fn encrypt_full(&self, frame: &[u8], rng: &mut dyn RngCore) -> EngineResult<Vec<u8>> {
        let key = self.encrypt_key.ok_or(EngineError::EncryptionRequired)?;
        let cipher = Aes128::new(GenericArray::from_slice(&key));

        let body = &frame[CLEAR_PREFIX..];
        let pad = MIN_PAD + (BLOCK_LEN - (body.len() + MIN_PAD) % BLOCK_LEN) % BLOCK_LEN;
        debug_assert!((MIN_PAD..=MAX_PAD).contains(&pad));

        let mut plain = vec![0u8; pad + body.len()];
        rng.fill_bytes(&mut plain[..pad]);
        plain[15] = (plain[15] & 0xF0) | (pad - MIN_PAD) as u8;
        plain[pad..].copy_from_slice(body);

        cbc_encrypt(&cipher, &mut plain);

        let mut out = Vec::with_capacity(CLEAR_PREFIX + plain.len());
        out.extend_from_slice(&frame[..CLEAR_PREFIX]);
        out.extend_from_slice(&plain);
        Ok(out)
    }

    /// Decrypts an inbound datagram back into full-frame bytes.
    pub fn decrypt_full(&self, datagram: &[u8]) -> EngineResult<Vec<u8>> {
        let key = self.decrypt_key.ok_or(EngineError::DecryptFailed)?;
        self.decrypt_full_with(&key, datagram)
    }

    /// Decrypts one of our own queued frames so it can be re-stamped for
    /// retransmission. Tries the current transmit key, then the
    /// pre-rotation one.
    pub fn decrypt_own(&self, datagram: &[u8]) -> EngineResult<Vec<u8>> {
        let current = self.encrypt_key.ok_or(EngineError::DecryptFailed)?;
        match self.decrypt_full_with(&current, datagram) {
            Ok(plain) => Ok(plain),
            Err(e) => match self.previous_encrypt_key {
                Some(old) => self.decrypt_full_with(&old, datagram),
                None => Err(e),
            },
        }
    }

    fn decrypt_full_with(&self, key: &[u8; 16], datagram: &[u8]) -> EngineResult<Vec<u8>> {
        if datagram.len() < CLEAR_PREFIX + BLOCK_LEN
            || (datagram.len() - CLEAR_PREFIX) % BLOCK_LEN != 0
        {
            return Err(EngineError::DecryptFailed);
        }
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut body = datagram[CLEAR_PREFIX..].to_vec();
        cbc_decrypt(&cipher, &mut body);

        let pad = MIN_PAD + (body[15] & 0x0F) as usize;
        if body.len() < pad {
            return Err(EngineError::DecryptFailed);
        }

        let mut out = Vec::with_capacity(CLEAR_PREFIX + body.len() - pad);
        out.extend_from_slice(&datagram[..CLEAR_PREFIX]);
        out.extend_from_slice(&body[pad..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state_with_key(key: [u8; 16]) -> EncryptionState {
        let mut st = EncryptionState {
            methods: iax2_proto::constants::ENCRYPT_AES128,
            ..Default::default()
        };
        st.set_keys(key);
        st
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let st = state_with_key(derive_key("338429", "s3cret"));
        let mut rng = StdRng::seed_from_u64(1);
        let frame: Vec<u8> = (0..40).collect();
        let wire = st.encrypt_full(&frame, &mut rng).unwrap();
        assert_eq!(&wire[..4], &frame[..4]);
        assert_eq!((wire.len() - 4) % 16, 0);
        assert_eq!(st.decrypt_full(&wire).unwrap(), frame);
    }

    #[test]
    fn pad_is_between_16_and_31() {
        let st = state_with_key([9; 16]);
        let mut rng = StdRng::seed_from_u64(2);
        for body_len in 0..48usize {
            let frame: Vec<u8> = (0..4 + body_len as u8).collect();
            let wire = st.encrypt_full(&frame, &mut rng).unwrap();
            let pad = wire.len() - frame.len();
            assert!((16..=31).contains(&pad), "pad {pad} for body {body_len}");
        }
    }

    #[test]
    fn wrong_key_garbles() {
        let st = state_with_key([1; 16]);
        let other = state_with_key([2; 16]);
        let mut rng = StdRng::seed_from_u64(3);
        let frame: Vec<u8> = (0..32).collect();
        let wire = st.encrypt_full(&frame, &mut rng).unwrap();
        // Wrong key either errors on the pad nibble or yields different bytes.
        match other.decrypt_full(&wire) {
            Ok(plain) => assert_ne!(plain, frame),
            Err(_) => {}
        }
    }

    #[test]
    fn rotation_keeps_old_queue_decryptable() {
        let k0 = derive_key("ch1", "secret");
        let mut st = state_with_key(k0);
        let mut rng = StdRng::seed_from_u64(4);

        let frame: Vec<u8> = (0..36).collect();
        let queued = st.encrypt_full(&frame, &mut rng).unwrap();

        let k1 = rotate_key(&[0xAB; 16]);
        st.install_tx_key(k1);

        // Old queued frame still recoverable for re-encryption.
        assert_eq!(st.decrypt_own(&queued).unwrap(), frame);

        // New transmissions use the rotated key.
        let wire = st.encrypt_full(&frame, &mut rng).unwrap();
        let mut receiver = state_with_key(k0);
        receiver.install_rx_key(k1);
        assert_eq!(receiver.decrypt_full(&wire).unwrap(), frame);
    }
}
