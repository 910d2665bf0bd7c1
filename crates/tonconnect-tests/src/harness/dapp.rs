use super::relay::MemoryRelay;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tonconnect_crypto::KeyPair;

/// The dApp end of a bridge session.
pub struct TestDapp {
    keypair: KeyPair,
    /// Hex public key; the `peer_client_id` seen by the wallet.
    pub client_id: String,
}

impl Default for TestDapp {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDapp {
    pub fn new() -> Self {
        let keypair = tonconnect_crypto::generate_keypair().unwrap();
        let client_id = hex::encode(keypair.public_key);
        Self { keypair, client_id }
    }

    /// Encrypt `payload` for the wallet session `wallet_client_id`; returns base64.
    pub fn seal_for(&self, wallet_client_id: &str, payload: &[u8]) -> String {
        let wallet_public = hex::decode(wallet_client_id).unwrap();
        let sealed =
            tonconnect_crypto::encrypt(payload, &wallet_public, &self.keypair.secret_key[..]).unwrap();
        BASE64.encode(sealed)
    }

    /// Deliver a JSON request to the wallet through the relay. Returns the SSE id.
    pub fn send_request(
        &self,
        relay: &MemoryRelay,
        wallet_client_id: &str,
        request: &serde_json::Value,
    ) -> u64 {
        let body = serde_json::to_vec(request).unwrap();
        let message = self.seal_for(wallet_client_id, &body);
        relay.deliver(wallet_client_id, &self.client_id, &message)
    }

    pub fn send_transfer(
        &self,
        relay: &MemoryRelay,
        wallet_client_id: &str,
        id: i64,
        address: &str,
        amount: u64,
    ) -> u64 {
        self.send_request(relay, wallet_client_id, &super::transfer_request(id, address, amount))
    }

    /// Decrypt every message the wallet posted to this dApp, oldest first.
    pub fn replies(&self, relay: &MemoryRelay) -> Vec<serde_json::Value> {
        relay
            .posts()
            .into_iter()
            .filter(|post| post.to == self.client_id)
            .filter_map(|post| {
                let wallet_public = hex::decode(&post.client_id).ok()?;
                let ciphertext = BASE64.decode(post.body).ok()?;
                let plaintext = tonconnect_crypto::decrypt(
                    &ciphertext,
                    &wallet_public,
                    &self.keypair.secret_key[..],
                )?;
                serde_json::from_slice(&plaintext).ok()
            })
            .collect()
    }
}
