//! End-to-end tests for `ConnectionManager` against an in-process server.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use support::{unused_url, wait_for_state, RecordingBridge, TestServer};
use trigger::{
    AuthContext, ConnectionManager, ConnectionState, StaticAuthProvider, TriggerConfig,
    TriggerError,
};

const SHORT_DELAY: Duration = Duration::from_millis(300);
/// Lower bound on the observed gap between a close and the next accept.
/// The server notices the close a little after the client does.
const MIN_GAP: Duration = Duration::from_millis(250);

fn config(url: &str) -> TriggerConfig {
    TriggerConfig::new(url).with_reconnect_delay(SHORT_DELAY)
}

fn manager(config: TriggerConfig, bridge: &Arc<RecordingBridge>) -> ConnectionManager {
    ConnectionManager::new(config, bridge.clone())
}

// ============================================================
// Inbound frames
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn ack_sent_on_open_is_emitted() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    conn.send_text(r#"{"action":"ack"}"#).await;

    assert_eq!(bridge.next_event().await, json!({ "action": "ack" }));
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_frames_are_emitted_as_character_maps() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    conn.send_text("ab").await;
    conn.send_binary(br#"{"binary":true}"#).await;
    conn.send_binary(&[0x68, 0xff]).await;

    assert_eq!(bridge.next_event().await, json!({ "0": "a", "1": "b" }));
    assert_eq!(bridge.next_event().await, json!({ "binary": true }));
    assert_eq!(bridge.next_event().await, json!({ "0": "h", "1": "\u{ff}" }));
    // Decode fallbacks are silent.
    assert!(bridge.errors().is_empty());
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_host_still_sees_every_frame_in_order() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::slow(json!({}), Duration::from_millis(2));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    for seq in 0..50 {
        conn.send_text(&json!({ "seq": seq }).to_string()).await;
    }

    for seq in 0..50 {
        assert_eq!(bridge.next_event().await, json!({ "seq": seq }));
    }
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn host_can_send_and_await_while_handling_a_frame() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = Arc::new(manager(config(&server.url), &bridge));
    bridge.attach(&manager);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    conn.send_text(r#"{"ask":"status?"}"#).await;

    // The host's request goes out while its emit is still running.
    assert_eq!(conn.recv_text().await, "status?");
    conn.send_text(r#"{"status":"green"}"#).await;

    assert_eq!(
        bridge.next_event().await,
        json!({ "ask": "status?", "reply": { "status": "green" } })
    );
    // The awaited frame is still emitted afterwards, in order.
    assert_eq!(bridge.next_event().await, json!({ "status": "green" }));
    assert_eq!(manager.state(), ConnectionState::Open);
    manager.deactivate().await;
}

// ============================================================
// Open-script
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn frames_wait_for_the_open_script() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({ "topic": "invoices" }));
    let script = r#"
        send({ command = "subscribe", topic = get_parameter("topic") })
        local first = send("ready", true)
        static_data.set("first", first)
        static_data.set("done", true)
    "#;
    let manager = manager(config(&server.url).with_open_script(script), &bridge);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    assert_eq!(
        serde_json::from_str::<Value>(&conn.recv_text().await).unwrap(),
        json!({ "command": "subscribe", "topic": "invoices" })
    );
    assert_eq!(conn.recv_text().await, "ready");
    conn.send_text(r#"{"n":1}"#).await;
    conn.send_text(r#"{"n":2}"#).await;

    // The awaited reply is the first frame; every frame still reaches the
    // host, and only after the script finished.
    let first = bridge.next_emitted().await;
    let second = bridge.next_emitted().await;
    assert_eq!(first.value, json!({ "n": 1 }));
    assert_eq!(second.value, json!({ "n": 2 }));
    assert_eq!(first.static_data["done"], json!(true));
    assert_eq!(first.static_data["first"], json!({ "n": 1 }));
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn script_fault_does_not_block_messages() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(
        config(&server.url).with_open_script(r#"error("kaput")"#),
        &bridge,
    );

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    conn.send_text(r#"{"after":"fault"}"#).await;

    assert_eq!(bridge.next_event().await, json!({ "after": "fault" }));
    let message = bridge.wait_for_error("script").await;
    assert!(message.contains("kaput"));
    assert_eq!(manager.state(), ConnectionState::Open);
    manager.deactivate().await;
}

async fn assert_timed_out_script_releases_frames(script: &str) {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(
        config(&server.url)
            .with_open_script(script)
            .with_script_timeout(Duration::from_millis(300)),
        &bridge,
    );

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    for seq in 0..3 {
        conn.send_text(&json!({ "seq": seq }).to_string()).await;
    }

    for seq in 0..3 {
        assert_eq!(bridge.next_event().await, json!({ "seq": seq }));
    }
    let message = bridge.wait_for_error("script").await;
    assert!(message.contains("deadline"), "unexpected error: {message}");
    assert_eq!(manager.state(), ConnectionState::Open);
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn runaway_script_times_out_and_held_frames_follow() {
    assert_timed_out_script_releases_frames("while true do end").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn script_catching_its_own_timeout_still_releases_frames() {
    assert_timed_out_script_releases_frames(
        "while true do pcall(function() while true do end end) end",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn credentials_reach_the_script_and_the_handshake() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let mut config = config(&server.url).with_open_script(
        r#"send({ token = credentials.access_token, secret = credentials.client_secret })"#,
    );
    config.bearer_auth = true;
    let auth = AuthContext::new(Some("tok".into()), Some("id".into()), Some("shh".into()));
    let manager = ConnectionManager::new(config, bridge.clone())
        .with_auth_provider(Arc::new(StaticAuthProvider(auth)));

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;
    assert_eq!(conn.authorization.as_deref(), Some("Bearer tok"));
    assert_eq!(
        serde_json::from_str::<Value>(&conn.recv_text().await).unwrap(),
        json!({ "token": "tok", "secret": "shh" })
    );
    manager.deactivate().await;
}

// ============================================================
// send / await
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn send_requires_an_open_connection() {
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config("ws://127.0.0.1:1"), &bridge);
    assert!(matches!(
        manager.send(json!("hi"), false).await,
        Err(TriggerError::NotOpen)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn send_writes_strings_verbatim_and_values_as_json() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    wait_for_state(&manager, ConnectionState::Open).await;
    let mut conn = server.next_connection().await;

    assert!(manager.send(json!("plain"), false).await.unwrap().is_none());
    manager.send(json!({ "k": [1, 2] }), false).await.unwrap();
    assert_eq!(conn.recv_text().await, "plain");
    assert_eq!(conn.recv_text().await, r#"{"k":[1,2]}"#);
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_awaits_partition_the_inbound_stream() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = Arc::new(manager(config(&server.url), &bridge));

    manager.activate().await.expect("activate");
    wait_for_state(&manager, ConnectionState::Open).await;
    let mut conn = server.next_connection().await;

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.send(json!("q"), true).await })
        })
        .collect();

    for _ in 0..3 {
        assert_eq!(conn.recv_text().await, "q");
    }
    for n in 0..3 {
        conn.send_text(&json!({ "r": n }).to_string()).await;
    }

    let mut replies = Vec::new();
    for caller in callers {
        let reply = caller.await.unwrap().unwrap().expect("awaited a reply");
        replies.push(reply.into_value()["r"].as_i64().unwrap());
    }
    replies.sort_unstable();
    assert_eq!(replies, vec![0, 1, 2]);

    // The host still sees all three.
    for n in 0..3 {
        assert_eq!(bridge.next_event().await, json!({ "r": n }));
    }
    manager.deactivate().await;
}

// ============================================================
// Reconnection
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn abnormal_close_reconnects_on_a_fresh_socket() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let first = server.next_connection().await;
    let first_peer = first.peer;
    let closed_at = first.close().await;

    let mut second = server.next_connection().await;
    assert!(second.accepted_at.duration_since(closed_at) >= MIN_GAP);
    assert_ne!(second.peer, first_peer);
    assert_eq!(manager.retry_count(), 1);
    assert_eq!(bridge.error_kinds(), vec!["closed"]);

    second.send_text(r#"{"back":true}"#).await;
    assert_eq!(bridge.next_event().await, json!({ "back": true }));
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn three_abnormal_closes_make_three_spaced_reconnects() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(
        config(&server.url).with_open_script(r#"send("hello")"#),
        &bridge,
    );

    manager.activate().await.expect("activate");
    let mut peers = Vec::new();
    let mut accepted = Vec::new();
    let mut closed = Vec::new();

    for _ in 0..3 {
        let mut conn = server.next_connection().await;
        // The open-script runs again on every connection.
        assert_eq!(conn.recv_text().await, "hello");
        peers.push(conn.peer);
        accepted.push(conn.accepted_at);
        closed.push(conn.close().await);
    }
    let mut last = server.next_connection().await;
    assert_eq!(last.recv_text().await, "hello");
    peers.push(last.peer);
    accepted.push(last.accepted_at);

    for i in 0..3 {
        assert!(accepted[i + 1].duration_since(closed[i]) >= MIN_GAP);
    }
    peers.sort();
    peers.dedup();
    assert_eq!(peers.len(), 4, "every attempt uses a new socket");
    assert_eq!(manager.connect_attempts(), 4);
    assert_eq!(manager.retry_count(), 3);
    manager.deactivate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deactivate_during_reconnect_delay_stops_for_good() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(
        TriggerConfig::new(server.url.clone()).with_reconnect_delay(Duration::from_millis(500)),
        &bridge,
    );

    manager.activate().await.expect("activate");
    server.next_connection().await.close().await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    manager.deactivate().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(server.quiet_for(Duration::from_millis(1_200)).await);
    assert_eq!(manager.connect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deactivate_closes_the_socket_and_is_idempotent() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let mut conn = server.next_connection().await;

    let started = Instant::now();
    manager.deactivate().await;
    manager.deactivate().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(conn.wait_closed().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // A manual close is neither reported nor followed by a reconnect.
    assert!(server.quiet_for(SHORT_DELAY * 3).await);
    assert!(bridge.errors().is_empty());
    assert!(matches!(manager.activate().await, Err(TriggerError::Deactivated)));
}

#[tokio::test(flavor = "multi_thread")]
async fn deactivate_before_activate_is_harmless() {
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config("ws://127.0.0.1:1"), &bridge);
    manager.deactivate().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

// ============================================================
// Activation errors
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn first_connect_failure_is_returned_and_not_retried() {
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&unused_url().await), &bridge);

    let err = manager.activate().await.unwrap_err();
    assert!(matches!(err, TriggerError::Connect { .. }));
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    tokio::time::sleep(SHORT_DELAY * 2).await;
    assert_eq!(manager.connect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_websocket_uri_is_a_config_error() {
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(TriggerConfig::new("https://example.com"), &bridge);
    assert!(matches!(
        manager.activate().await,
        Err(TriggerError::Config(_))
    ));
    assert_eq!(manager.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_activate_is_rejected() {
    let mut server = TestServer::start().await;
    let bridge = RecordingBridge::new(json!({}));
    let manager = manager(config(&server.url), &bridge);

    manager.activate().await.expect("activate");
    let _conn = server.next_connection().await;
    assert!(matches!(
        manager.activate().await,
        Err(TriggerError::AlreadyActive)
    ));
    manager.deactivate().await;
}
