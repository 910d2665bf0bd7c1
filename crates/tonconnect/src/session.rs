use crate::AccountId;
use crate::error::BridgeError;
use crate::protocol::{AppRequest, BridgeMessage};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt;
use tonconnect_crypto::{CryptoError, KEY_BYTES, KeyPair, SecretKeyBytes};
use zeroize::Zeroizing;

/// Cryptographic and ordering state of one (account, dApp) pair.
#[derive(Clone)]
pub struct ConnectionSession {
    pub account_id: AccountId,
    /// The dApp's public key (hex); also its routing address on the relay.
    pub peer_client_id: String,
    pub wallet_public_key: [u8; KEY_BYTES],
    pub wallet_secret_key: SecretKeyBytes,
    /// Highest accepted request id, `-1` when none has been processed.
    pub last_request_id: i64,
}

impl ConnectionSession {
    pub fn new(account_id: AccountId, peer_client_id: &str, keypair: KeyPair) -> Self {
        Self {
            account_id,
            peer_client_id: peer_client_id.to_string(),
            wallet_public_key: keypair.public_key,
            wallet_secret_key: keypair.secret_key,
            last_request_id: -1,
        }
    }

    /// The wallet's address on the relay (`client_id` query parameter).
    pub fn wallet_client_id(&self) -> String {
        hex::encode(self.wallet_public_key)
    }

    pub fn peer_public_key(&self) -> Result<[u8; KEY_BYTES], BridgeError> {
        decode_key_hex(&self.peer_client_id)
            .ok_or_else(|| BridgeError::Crypto(CryptoError::InvalidKey {
                what: "peer client id",
                len: self.peer_client_id.len() / 2,
            }))
    }

    /// Encrypt `payload` for the peer; returns the base64 body for the relay.
    pub fn seal(&self, payload: &[u8]) -> Result<String, BridgeError> {
        let peer = self.peer_public_key()?;
        let ciphertext = tonconnect_crypto::encrypt(payload, &peer, &self.wallet_secret_key[..])?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Decode and decrypt an SSE `data` payload addressed to this session.
    ///
    /// Anything that is not a well-formed request from this session's peer
    /// yields `None`.
    pub fn open_envelope(&self, data: &str) -> Option<AppRequest> {
        let message: BridgeMessage = serde_json::from_str(data).ok()?;
        if !message.from.eq_ignore_ascii_case(&self.peer_client_id) {
            return None;
        }
        let ciphertext = BASE64.decode(message.message.trim()).ok()?;
        let peer = self.peer_public_key().ok()?;
        let plaintext = Zeroizing::new(tonconnect_crypto::decrypt(
            &ciphertext,
            &peer,
            &self.wallet_secret_key[..],
        )?);
        serde_json::from_slice(&plaintext).ok()
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("account_id", &self.account_id)
            .field("peer_client_id", &self.peer_client_id)
            .field("wallet_public_key", &hex::encode(self.wallet_public_key))
            .field("wallet_secret_key", &"<redacted>")
            .field("last_request_id", &self.last_request_id)
            .finish()
    }
}

pub(crate) fn decode_key_hex(value: &str) -> Option<[u8; KEY_BYTES]> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonconnect_crypto::generate_keypair;

    fn dapp_envelope(dapp: &KeyPair, wallet_public: &[u8], plaintext: &[u8]) -> String {
        let sealed = tonconnect_crypto::encrypt(plaintext, wallet_public, &dapp.secret_key[..]).unwrap();
        serde_json::to_string(&BridgeMessage {
            from: hex::encode(dapp.public_key),
            message: BASE64.encode(sealed),
        })
        .unwrap()
    }

    #[test]
    fn open_envelope_from_peer() {
        let dapp = generate_keypair().unwrap();
        let session = ConnectionSession::new(1, &hex::encode(dapp.public_key), generate_keypair().unwrap());

        let data = dapp_envelope(
            &dapp,
            &session.wallet_public_key,
            br#"{"id":"4","method":"sendTransaction","params":[]}"#,
        );
        let request = session.open_envelope(&data).unwrap();
        assert_eq!(request.id, 4);
        assert_eq!(request.method, "sendTransaction");
    }

    #[test]
    fn envelope_from_other_sender_is_dropped() {
        let dapp = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let session = ConnectionSession::new(1, &hex::encode(dapp.public_key), generate_keypair().unwrap());

        let data = dapp_envelope(&other, &session.wallet_public_key, br#"{"id":1,"method":"x"}"#);
        assert!(session.open_envelope(&data).is_none());
    }

    #[test]
    fn garbage_envelopes_are_dropped() {
        let dapp = generate_keypair().unwrap();
        let session = ConnectionSession::new(1, &hex::encode(dapp.public_key), generate_keypair().unwrap());
        let from = hex::encode(dapp.public_key);

        assert!(session.open_envelope("not json").is_none());
        assert!(session.open_envelope(&format!(r#"{{"from":"{from}","message":"%%%"}}"#)).is_none());
        assert!(session.open_envelope(&format!(r#"{{"from":"{from}","message":"AAAA"}}"#)).is_none());

        // Authentic ciphertext, but the plaintext is not a request.
        let data = dapp_envelope(&dapp, &session.wallet_public_key, b"[1,2,3]");
        assert!(session.open_envelope(&data).is_none());
    }

    #[test]
    fn seal_is_readable_by_peer() {
        let dapp = generate_keypair().unwrap();
        let session = ConnectionSession::new(1, &hex::encode(dapp.public_key), generate_keypair().unwrap());

        let body = session.seal(br#"{"id":"1"}"#).unwrap();
        let ciphertext = BASE64.decode(body).unwrap();
        let plaintext =
            tonconnect_crypto::decrypt(&ciphertext, &session.wallet_public_key, &dapp.secret_key[..]).unwrap();
        assert_eq!(plaintext, br#"{"id":"1"}"#);
    }

    #[test]
    fn malformed_peer_id_is_a_crypto_error() {
        let session = ConnectionSession::new(1, "not-hex", generate_keypair().unwrap());
        assert!(matches!(session.seal(b"x"), Err(BridgeError::Crypto(_))));
    }

    #[test]
    fn debug_hides_secret_key() {
        let session = ConnectionSession::new(9, "ab", generate_keypair().unwrap());
        let rendered = format!("{session:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("last_request_id: -1"));
    }
}
