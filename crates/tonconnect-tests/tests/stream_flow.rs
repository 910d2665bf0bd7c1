use std::time::Duration;
use tonconnect::{BridgeConfig, LinkState};
use tonconnect_tests::harness::dapp::TestDapp;
use tonconnect_tests::harness::relay::MemoryRelay;
use tonconnect_tests::harness::{
    TIMEOUT, expect_no_transfer, init_tracing, manager, next_transfer, wait_for_state, wallet_id,
};

fn buffered() -> BridgeConfig {
    BridgeConfig {
        event_buffer: 8,
        ..BridgeConfig::default()
    }
}

#[tokio::test]
async fn dropped_stream_reconnects_and_resumes() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, buffered());
    let dapp = TestDapp::new();
    let mut events = manager.subscribe(1);

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;
    let first_event = dapp.send_transfer(&relay, &wallet, 1, "0:aa", 1);
    assert_eq!(next_transfer(&mut events, TIMEOUT).await, Some(1));

    assert_eq!(relay.drop_client(&wallet, "connection reset"), 1);
    dapp.send_transfer(&relay, &wallet, 2, "0:aa", 1);

    assert_eq!(next_transfer(&mut events, TIMEOUT).await, Some(2));
    assert!(wait_for_state(&manager, 1, &dapp.client_id, LinkState::Streaming).await);

    let opens = relay.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1].client_id, wallet);
    assert_eq!(opens[1].last_event_id, Some(first_event.to_string()));
    assert_ne!(opens[0].handle, opens[1].handle);
}

#[tokio::test]
async fn reconnect_waits_for_configured_delay() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(
        &relay,
        BridgeConfig {
            reconnect_delay_ms: 200,
            ..BridgeConfig::default()
        },
    );
    let dapp = TestDapp::new();

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;
    relay.drop_client(&wallet, "reset");

    assert!(wait_for_state(&manager, 1, &dapp.client_id, LinkState::Reconnecting).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.opens().len(), 1);
    assert!(wait_for_state(&manager, 1, &dapp.client_id, LinkState::Streaming).await);
    assert_eq!(relay.opens().len(), 2);
}

#[tokio::test]
async fn disconnect_during_backoff_stops_reconnecting() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(
        &relay,
        BridgeConfig {
            reconnect_delay_ms: 200,
            ..BridgeConfig::default()
        },
    );
    let dapp = TestDapp::new();

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;
    relay.drop_client(&wallet, "reset");
    assert!(wait_for_state(&manager, 1, &dapp.client_id, LinkState::Reconnecting).await);

    assert!(manager.disconnect(1, &dapp.client_id));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.opens().len(), 1);
    assert_eq!(manager.link_state(1, &dapp.client_id), LinkState::Idle);
}

#[tokio::test]
async fn heartbeats_are_ignored() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, buffered());
    let dapp = TestDapp::new();
    let mut events = manager.subscribe(1);

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;
    relay.heartbeat(&wallet);
    relay.heartbeat(&wallet);
    dapp.send_transfer(&relay, &wallet, 1, "0:aa", 1);

    assert_eq!(next_transfer(&mut events, TIMEOUT).await, Some(1));
    assert_eq!(manager.link_state(1, &dapp.client_id), LinkState::Streaming);
}

#[tokio::test]
async fn tampered_envelope_is_dropped_without_consuming_id() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, buffered());
    let dapp = TestDapp::new();
    let mut events = manager.subscribe(1);

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;

    let body = serde_json::to_vec(&tonconnect_tests::harness::transfer_request(1, "0:evil", 9)).unwrap();
    let sealed = dapp.seal_for(&wallet, &body);
    let mut bytes = base64_decode(&sealed);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    relay.deliver(&wallet, &dapp.client_id, &base64_encode(&bytes));
    relay.deliver_raw(&wallet, "not json at all");

    dapp.send_transfer(&relay, &wallet, 1, "0:good", 1);
    assert_eq!(next_transfer(&mut events, TIMEOUT).await, Some(1));
    expect_no_transfer(&mut events, Duration::from_millis(100)).await;
    assert_eq!(manager.link_state(1, &dapp.client_id), LinkState::Streaming);
}

#[tokio::test]
async fn envelope_from_another_dapp_is_dropped() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, buffered());
    let dapp = TestDapp::new();
    let intruder = TestDapp::new();
    let mut events = manager.subscribe(1);

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;

    intruder.send_transfer(&relay, &wallet, 100, "0:evil", 9);
    dapp.send_transfer(&relay, &wallet, 1, "0:good", 1);

    assert_eq!(next_transfer(&mut events, TIMEOUT).await, Some(1));
    expect_no_transfer(&mut events, Duration::from_millis(100)).await;
}

fn base64_decode(value: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(value).unwrap()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
