use tonconnect::protocol::{ConnectAck, DeviceInfo, NETWORK_MAINNET, SendResult, TonAddressItem};
use tonconnect::{BridgeConfig, BridgeError};
use tonconnect_tests::harness::dapp::TestDapp;
use tonconnect_tests::harness::relay::MemoryRelay;
use tonconnect_tests::harness::{TIMEOUT, init_tracing, manager, next_transfer, wallet_id};

fn ack() -> ConnectAck {
    ConnectAck::new(
        TonAddressItem {
            address: "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8".into(),
            public_key: "ab".repeat(32),
            network: NETWORK_MAINNET.into(),
            wallet_state_init: "te6cckEBAQEAAgAAAEysuc0=".into(),
        },
        DeviceInfo::current("1.0.0"),
    )
}

#[tokio::test]
async fn send_without_session_makes_no_network_call() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, BridgeConfig::default());
    let dapp = TestDapp::new();

    let err = manager.send(1, &dapp.client_id, b"{}").await.unwrap_err();
    assert!(matches!(err, BridgeError::NoSuchSession { account_id: 1, .. }));
    assert!(relay.posts().is_empty());
    assert!(relay.opens().is_empty());
}

#[tokio::test]
async fn approve_delivers_connect_ack() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, BridgeConfig::default());
    let dapp = TestDapp::new();

    manager.approve(1, &dapp.client_id, &ack()).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;

    let posts = relay.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].client_id, wallet);
    assert_eq!(posts[0].to, dapp.client_id);
    assert_eq!(posts[0].ttl_secs, 300);

    let replies = dapp.replies(&relay);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], 0);
    assert_eq!(replies[0]["payload"]["items"][0]["network"], "-239");
    assert_eq!(replies[0]["payload"]["device"]["appVersion"], "1.0.0");
}

#[tokio::test]
async fn transfer_answers_reach_the_dapp() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, BridgeConfig::default());
    let dapp = TestDapp::new();
    let mut events = manager.subscribe(1);

    manager.connect(1, &dapp.client_id).await.unwrap();
    let wallet = wallet_id(&manager, 1, &dapp.client_id).await;
    dapp.send_transfer(&relay, &wallet, 12, "0:aa", 5);
    let request_id = next_transfer(&mut events, TIMEOUT).await.unwrap();

    manager
        .send_json(1, &dapp.client_id, &SendResult::user_declined(request_id))
        .await
        .unwrap();
    manager
        .send_json(1, &dapp.client_id, &SendResult::success(request_id))
        .await
        .unwrap();

    let replies = dapp.replies(&relay);
    assert_eq!(
        replies,
        vec![
            serde_json::json!({
                "id": "12",
                "error": { "code": 300, "message": "User declined the transaction" }
            }),
            serde_json::json!({ "id": "12" }),
        ]
    );
}

#[tokio::test]
async fn send_works_from_persisted_session_without_stream() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, BridgeConfig::default());
    let dapp = TestDapp::new();

    manager.connect(1, &dapp.client_id).await.unwrap();
    assert!(manager.disconnect(1, &dapp.client_id));

    manager.send(1, &dapp.client_id, br#"{"id":"1"}"#).await.unwrap();
    assert_eq!(dapp.replies(&relay), vec![serde_json::json!({ "id": "1" })]);
}

#[tokio::test]
async fn transport_failure_is_returned_not_retried() {
    init_tracing();
    let relay = MemoryRelay::new();
    let manager = manager(&relay, BridgeConfig::default());
    let dapp = TestDapp::new();
    manager.connect(1, &dapp.client_id).await.unwrap();

    relay.fail_posts(true);
    let err = manager.send(1, &dapp.client_id, b"{}").await.unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));

    relay.fail_posts(false);
    assert!(relay.posts().is_empty());
}
