//! Integration tests for WebSocket connection lifecycle, rooms, backfill and
//! activity fan-out against a real server and SQLite store.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use wedding_realtime::activity::NewActivity;
use wedding_realtime::db::DbPool;
use wedding_realtime::hub::{HubSettings, RealtimeHub};
use wedding_realtime::store::{sqlite::write_activity, ActivityStore, SqliteActivityStore};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;

struct TestServer {
    addr: SocketAddr,
    hub: Arc<RealtimeHub>,
    store: Arc<SqliteActivityStore>,
    db: DbPool,
    _tmp_dir: tempfile::TempDir,
}

/// Helper: start the server on a random port with a fresh database.
async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = wedding_realtime::db::init_db(&data_dir).expect("Failed to init DB");
    let store = Arc::new(SqliteActivityStore::new(db.clone(), Duration::from_millis(20)));

    let settings = HubSettings {
        change_feed_retry: Duration::from_millis(100),
        ..HubSettings::default()
    };
    let hub = RealtimeHub::new(store.clone(), settings);
    hub.start();

    let state = wedding_realtime::state::AppState { hub: hub.clone() };
    let app = wedding_realtime::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Let the change feed take its starting cursor
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        hub,
        store,
        db,
        _tmp_dir: tmp_dir,
    }
}

/// Connect and consume the greeting. Returns the client id with the halves.
async fn connect(addr: SocketAddr) -> (String, WsWrite, WsRead) {
    let (ws_stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    let (write, mut read) = ws_stream.split();

    let greeting = next_json(&mut read).await;
    assert_eq!(greeting["type"], "connection");
    let client_id = greeting["clientId"].as_str().unwrap().to_string();
    (client_id, write, read)
}

/// Next JSON frame, skipping transport-level ping/pong.
async fn next_json(read: &mut WsRead) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Expected a message within timeout");
        match msg {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("Expected text message, got: {:?}", other),
        }
    }
}

/// Assert that no text frame arrives within `ms`.
async fn expect_silence(read: &mut WsRead, ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        match tokio::time::timeout_at(deadline, read.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(other) => panic!("Expected silence, got: {:?}", other),
        }
    }
}

async fn send_json(write: &mut WsWrite, value: Value) {
    write
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send");
}

/// Subscribe to `activities` and consume the ack and the backfill batch.
async fn subscribe_activities(write: &mut WsWrite, read: &mut WsRead) -> Vec<Value> {
    send_json(write, json!({"type": "subscribe", "channel": "activities"})).await;
    let ack = next_json(read).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["channel"], "activities");

    let batch = next_json(read).await;
    assert_eq!(batch["type"], "recent_activities");
    batch["data"].as_array().unwrap().clone()
}

fn activity_rows(db: &DbPool) -> i64 {
    let conn = db.lock().unwrap();
    conn.query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_ws_connection_greeting() {
    let server = start_test_server().await;
    let (client_id, _write, mut read) = connect(server.addr).await;

    assert!(!client_id.is_empty());
    assert!(server.hub.registry().get(&client_id).is_some());

    // Connection stays open with no further messages
    expect_silence(&mut read, 300).await;
}

#[tokio::test]
async fn test_subscribe_sends_ack_then_newest_first_backfill() {
    let server = start_test_server().await;
    let base = chrono::Utc::now() - chrono::Duration::minutes(1);
    for i in 0..12 {
        let mut activity = NewActivity::system("guestbook", format!("entry {i}"), json!({}));
        activity.timestamp = base + chrono::Duration::seconds(i);
        server.store.insert(activity).await.unwrap();
    }
    // Feed-published history goes to nobody; drain it before connecting
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_id, mut write, mut read) = connect(server.addr).await;
    let history = subscribe_activities(&mut write, &mut read).await;

    assert_eq!(history.len(), 10);
    assert_eq!(history[0]["description"], "entry 11");
    assert_eq!(history[9]["description"], "entry 2");
}

#[tokio::test]
async fn test_client_activity_fans_out_to_subscribers_only() {
    let server = start_test_server().await;
    let (_a, mut write_a, mut read_a) = connect(server.addr).await;
    let (_b, mut write_b, mut read_b) = connect(server.addr).await;
    let (_c, _write_c, mut read_c) = connect(server.addr).await;
    subscribe_activities(&mut write_a, &mut read_a).await;
    subscribe_activities(&mut write_b, &mut read_b).await;

    send_json(
        &mut write_a,
        json!({"type": "activity", "data": {"type": "guestbook", "description": "signed"}}),
    )
    .await;

    for read in [&mut read_a, &mut read_b] {
        let msg = next_json(read).await;
        assert_eq!(msg["type"], "activity");
        assert_eq!(msg["data"]["type"], "guestbook");
        assert_eq!(msg["data"]["description"], "signed");
        assert_eq!(msg["data"]["source"], "client");
        assert!(!msg["data"]["id"].as_str().unwrap().is_empty());
        // The change feed sees the same row; it must not be delivered twice
        expect_silence(read, 200).await;
    }
    expect_silence(&mut read_c, 100).await;
    assert_eq!(activity_rows(&server.db), 1);
}

#[tokio::test]
async fn test_external_write_is_broadcast_once() {
    let server = start_test_server().await;
    let (_a, mut write, mut read) = connect(server.addr).await;
    subscribe_activities(&mut write, &mut read).await;

    {
        let conn = server.db.lock().unwrap();
        write_activity(
            &conn,
            "crud-1",
            &NewActivity::system("photo", "New photo in the album", json!({"photoId": "p9"})),
        )
        .unwrap();
    }

    let msg = next_json(&mut read).await;
    assert_eq!(msg["type"], "activity");
    assert_eq!(msg["data"]["id"], "crud-1");
    assert_eq!(msg["data"]["source"], "system");
    expect_silence(&mut read, 200).await;
    assert_eq!(activity_rows(&server.db), 1);
}

#[tokio::test]
async fn test_invalid_activity_gets_error_and_no_broadcast() {
    let server = start_test_server().await;
    let (_a, mut write_a, mut read_a) = connect(server.addr).await;
    let (_b, mut write_b, mut read_b) = connect(server.addr).await;
    subscribe_activities(&mut write_a, &mut read_a).await;
    subscribe_activities(&mut write_b, &mut read_b).await;

    send_json(&mut write_a, json!({"type": "activity", "data": {}})).await;

    let msg = next_json(&mut read_a).await;
    assert_eq!(msg["type"], "error");
    assert!(msg["message"].as_str().unwrap().contains("required"));
    expect_silence(&mut read_b, 200).await;
    assert_eq!(activity_rows(&server.db), 0);

    // Connection stays usable after the error
    send_json(&mut write_a, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut read_a).await["type"], "pong");
}

#[tokio::test]
async fn test_json_ping_pong() {
    let server = start_test_server().await;
    let (_id, mut write, mut read) = connect(server.addr).await;

    send_json(&mut write, json!({"type": "ping"})).await;

    let msg = next_json(&mut read).await;
    assert_eq!(msg["type"], "pong");
    assert!(msg["timestamp"].is_string());
}

#[tokio::test]
async fn test_malformed_messages_get_error_frames() {
    let server = start_test_server().await;
    let (_id, mut write, mut read) = connect(server.addr).await;

    write
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut read).await["type"], "error");

    send_json(&mut write, json!({"type": "dance"})).await;
    assert_eq!(next_json(&mut read).await["type"], "error");

    send_json(&mut write, json!({"type": "subscribe", "channel": "  "})).await;
    assert_eq!(next_json(&mut read).await["type"], "error");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = start_test_server().await;
    let (id, mut write, mut read) = connect(server.addr).await;
    subscribe_activities(&mut write, &mut read).await;

    send_json(&mut write, json!({"type": "unsubscribe", "channel": "activities"})).await;
    let ack = next_json(&mut read).await;
    assert_eq!(ack["type"], "unsubscribed");
    assert!(server.hub.registry().members_of("activities").is_empty());
    assert!(server.hub.registry().get(&id).unwrap().subscriptions.is_empty());

    let activity = NewActivity::system("reaction", "liked", json!({})).into_activity("r1".into());
    assert_eq!(server.hub.publish(&activity), Some(0));
    expect_silence(&mut read, 200).await;
}

#[tokio::test]
async fn test_update_reaches_unsubscribed_connections() {
    let server = start_test_server().await;
    let (_id, _write, mut read) = connect(server.addr).await;

    assert_eq!(
        server.hub.broadcast_update("photo_approved", json!({"photoId": "p1"})),
        1
    );

    let msg = next_json(&mut read).await;
    assert_eq!(msg["type"], "update");
    assert_eq!(msg["updateType"], "photo_approved");
    assert_eq!(msg["data"]["photoId"], "p1");
}

#[tokio::test]
async fn test_connection_cleanup_on_disconnect() {
    let server = start_test_server().await;

    {
        let (_id, mut write, mut read) = connect(server.addr).await;
        subscribe_activities(&mut write, &mut read).await;
        write.send(Message::Close(None)).await.expect("Failed to send close");
    }

    // Give the server a moment to clean up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = server.hub.stats();
    assert_eq!(stats.connections, 0);
    assert!(stats.rooms.is_empty());
}

#[tokio::test]
async fn test_stats_endpoint() {
    let server = start_test_server().await;
    let (_a, mut write, mut read) = connect(server.addr).await;
    subscribe_activities(&mut write, &mut read).await;
    let (_b, _write_b, _read_b) = connect(server.addr).await;

    let body: Value = reqwest::get(format!("http://{}/api/realtime/stats", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["connections"], 2);
    assert_eq!(body["rooms"]["activities"], 1);

    let health = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "ok");
}

#[tokio::test]
async fn test_shutdown_closes_with_distinct_reason() {
    let server = start_test_server().await;
    let (_id, _write, mut read) = connect(server.addr).await;

    server.hub.stop().await;

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason.as_str(), "Server shutting down");
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }

    // New upgrades are refused while shutting down
    assert!(tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .is_err());
}
