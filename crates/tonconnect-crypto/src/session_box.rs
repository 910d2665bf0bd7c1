//! Per-session box encryption between the wallet and a dApp.
//!
//! Keys are X25519, the cipher is XSalsa20-Poly1305 (NaCl `crypto_box`).
//! A sealed message on the wire is `nonce (24 bytes) || ciphertext`.

use crate::error::CryptoError;
use crypto_box::aead::Aead;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;

/// Secret key bytes, wiped from memory when dropped.
pub type SecretKeyBytes = Zeroizing<[u8; KEY_BYTES]>;

/// Ephemeral wallet-side key pair for one dApp session.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: [u8; KEY_BYTES],
    pub secret_key: SecretKeyBytes,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh key pair from the OS randomness source.
pub fn generate_keypair() -> Result<KeyPair, CryptoError> {
    let mut secret = Zeroizing::new([0u8; KEY_BYTES]);
    OsRng
        .try_fill_bytes(&mut secret[..])
        .map_err(|e| CryptoError::Unavailable(e.to_string()))?;
    let public_key = SecretKey::from(*secret).public_key();
    Ok(KeyPair {
        public_key: *public_key.as_bytes(),
        secret_key: secret,
    })
}

/// Authenticated-encrypt `plaintext` for `peer_public_key`.
///
/// Returns `nonce || ciphertext`. Only key lengths are validated; any 32 bytes
/// form a usable X25519 key.
pub fn encrypt(
    plaintext: &[u8],
    peer_public_key: &[u8],
    own_secret_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = salsa_box(peer_public_key, own_secret_key)?;
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::Unavailable(e.to_string()))?;
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_BYTES + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a `nonce || ciphertext` message from `peer_public_key`.
///
/// Returns `None` for anything that does not authenticate, including short
/// input and malformed keys.
pub fn decrypt(ciphertext: &[u8], peer_public_key: &[u8], own_secret_key: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.len() < NONCE_BYTES {
        return None;
    }
    let cipher = salsa_box(peer_public_key, own_secret_key).ok()?;
    let (nonce, sealed) = ciphertext.split_at(NONCE_BYTES);
    cipher.decrypt(GenericArray::from_slice(nonce), sealed).ok()
}

fn salsa_box(peer_public_key: &[u8], own_secret_key: &[u8]) -> Result<SalsaBox, CryptoError> {
    let peer: [u8; KEY_BYTES] =
        peer_public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey {
                what: "peer public key",
                len: peer_public_key.len(),
            })?;
    if own_secret_key.len() != KEY_BYTES {
        return Err(CryptoError::InvalidKey {
            what: "own secret key",
            len: own_secret_key.len(),
        });
    }
    let mut own = Zeroizing::new([0u8; KEY_BYTES]);
    own.copy_from_slice(own_secret_key);
    let secret = SecretKey::from(*own);
    Ok(SalsaBox::new(&PublicKey::from(peer), &secret))
}
