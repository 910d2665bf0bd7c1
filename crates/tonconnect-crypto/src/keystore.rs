use crate::error::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const STORE_KEY_BYTES: usize = 32;
const SEAL_NONCE_BYTES: usize = 12;
const STORE_KEY_LABEL: &[u8] = b"tonconnect-session-store-v1";

/// Key-encryption key for secrets persisted by the session store.
///
/// Sealed values are `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext`.
pub struct StoreKey {
    key: Zeroizing<[u8; STORE_KEY_BYTES]>,
}

impl StoreKey {
    /// Derive the store key from raw key material via SHA-256.
    pub fn derive(material: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(STORE_KEY_LABEL);
        hasher.update(material);
        let digest = hasher.finalize();
        let mut key = Zeroizing::new([0u8; STORE_KEY_BYTES]);
        key.copy_from_slice(&digest[..STORE_KEY_BYTES]);
        Self { key }
    }

    /// Fresh random key material suitable for [`StoreKey::derive`].
    pub fn generate_material() -> Result<Zeroizing<[u8; STORE_KEY_BYTES]>, CryptoError> {
        let mut material = Zeroizing::new([0u8; STORE_KEY_BYTES]);
        OsRng
            .try_fill_bytes(&mut material[..])
            .map_err(|e| CryptoError::Unavailable(e.to_string()))?;
        Ok(material)
    }

    pub fn seal(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..]).map_err(|_| CryptoError::Seal)?;
        let mut nonce = [0u8; SEAL_NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::Unavailable(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret)
            .map_err(|_| CryptoError::Seal)?;
        let mut out = Vec::with_capacity(SEAL_NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if sealed.len() < SEAL_NONCE_BYTES {
            return Err(CryptoError::Open);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..]).map_err(|_| CryptoError::Open)?;
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_BYTES);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Open)
    }
}
