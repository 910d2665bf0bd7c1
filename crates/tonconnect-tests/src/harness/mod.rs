pub mod dapp;
pub mod relay;

use relay::MemoryRelay;
use std::path::Path;
use std::time::Duration;
use tonconnect::{
    AccountId, BridgeConfig, ConnectionManager, DomainEvent, EventSubscription, LinkState,
    SessionStore,
};
use tonconnect_crypto::StoreKey;

pub type TestManager = ConnectionManager<MemoryRelay>;

pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Key material shared by every store a test opens, so reopened files decrypt.
pub fn store_key() -> StoreKey {
    StoreKey::derive(b"tonconnect-tests")
}

pub fn open_store(path: Option<&Path>) -> SessionStore {
    SessionStore::open(path, store_key()).unwrap()
}

/// Manager over an in-memory store and `relay`.
pub fn manager(relay: &MemoryRelay, config: BridgeConfig) -> TestManager {
    ConnectionManager::new(config, open_store(None), relay.clone())
}

pub fn manager_with_store(relay: &MemoryRelay, config: BridgeConfig, store: SessionStore) -> TestManager {
    ConnectionManager::new(config, store, relay.clone())
}

/// A `sendTransaction` request carrying one message.
pub fn transfer_request(id: i64, address: &str, amount: u64) -> serde_json::Value {
    let payload = serde_json::json!({
        "valid_until": 1_900_000_000,
        "messages": [{ "address": address, "amount": amount.to_string() }],
    });
    serde_json::json!({
        "id": id.to_string(),
        "method": "sendTransaction",
        "params": [payload.to_string()],
    })
}

/// Wallet-side relay address of a live or stored session.
pub async fn wallet_id(manager: &TestManager, account_id: AccountId, peer: &str) -> String {
    manager
        .session_info(account_id, peer)
        .await
        .unwrap()
        .expect("session exists")
        .wallet_public_key
}

pub async fn next_event(sub: &mut EventSubscription, timeout: Duration) -> Option<DomainEvent> {
    tokio::time::timeout(timeout, sub.recv()).await.ok().flatten()
}

/// Wait for the next `TransferRequested`, skipping connection notices.
/// Returns its request id.
pub async fn next_transfer(sub: &mut EventSubscription, timeout: Duration) -> Option<i64> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(sub, remaining).await? {
            DomainEvent::TransferRequested { request_id, .. } => return Some(request_id),
            DomainEvent::ConnectionOpened { .. } => continue,
        }
    }
}

/// Assert that no transfer arrives within `window`.
pub async fn expect_no_transfer(sub: &mut EventSubscription, window: Duration) {
    if let Some(id) = next_transfer(sub, window).await {
        panic!("unexpected transfer request {id}");
    }
}

pub async fn wait_for_state(
    manager: &TestManager,
    account_id: AccountId,
    peer: &str,
    state: LinkState,
) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if manager.link_state(account_id, peer) == state {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("tonconnect=debug,tonconnect_tests=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
