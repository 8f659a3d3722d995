use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use ulid::Ulid;

use kairos::calendar::NullCalendarSync;
use kairos::clock::FixedClock;
use kairos::engine::{Engine, EngineConfig};
use kairos::model::Ms;
use kairos::notify::NotifyHub;
use kairos::wire::{self, LineCodec};

const TOKEN: &str = "kairos-test-token";
const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// Midnight UTC on Monday 2025-05-05; the server clock is pinned here.
fn monday() -> Ms {
    chrono::Utc
        .with_ymd_and_hms(2025, 5, 5, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let wal = std::env::temp_dir().join(format!("kairos_int_test_{}.wal", Ulid::new()));
    let engine = Arc::new(
        Engine::new(
            wal,
            Arc::new(NotifyHub::new()),
            Arc::new(FixedClock::new(monday())),
            Arc::new(NullCalendarSync),
            EngineConfig::default(),
        )
        .unwrap(),
    );
    let token: Arc<str> = Arc::from(TOKEN);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, token).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LineCodec>,
    next_id: u64,
}

impl Client {
    /// Connect and run the hello handshake.
    async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, LineCodec);
        framed.send(json!({"hello": TOKEN}).to_string()).await.unwrap();
        let ack: Value =
            serde_json::from_str(&framed.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack["ok"], json!(true));
        Client { framed, next_id: 1 }
    }

    async fn recv_frame(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send one request and wait for its response, skipping any push
    /// frames interleaved on the socket.
    async fn request(&mut self, mut body: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        body["id"] = json!(id);
        self.framed.send(body.to_string()).await.unwrap();
        loop {
            let frame = self.recv_frame().await;
            if frame.get("push").is_some() {
                continue;
            }
            assert_eq!(frame["id"], json!(id));
            return frame;
        }
    }

    async fn ok(&mut self, body: Value) -> Value {
        let frame = self.request(body).await;
        assert_eq!(frame["ok"], json!(true), "unexpected error: {frame}");
        frame
    }

    async fn recv_push(&mut self) -> Value {
        loop {
            let frame = self.recv_frame().await;
            if frame.get("push").is_some() {
                return frame;
            }
        }
    }
}

async fn register(c: &mut Client, name: &str, tz: &str) -> String {
    let resp = c.ok(json!({"op": "register_user", "name": name, "tz": tz})).await;
    resp["data"]["id"].as_str().unwrap().to_string()
}

async fn publish(c: &mut Client, coach: &str) -> String {
    let resp = c
        .ok(json!({
            "op": "publish_service",
            "coach_id": coach,
            "name": "Deep Work Coaching",
            "duration_min": 60,
            "price": "75.00",
            "currency": "EUR",
            "mode": "online",
        }))
        .await;
    resp["data"]["id"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn hello_rejects_bad_token() {
    let addr = start_test_server().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec);
    framed.send(json!({"hello": "wrong"}).to_string()).await.unwrap();

    let denial: Value =
        serde_json::from_str(&framed.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(denial["ok"], json!(false));
    assert_eq!(denial["error"]["code"], json!("permission_denied"));

    // The server hangs up after a failed handshake.
    assert!(framed.next().await.is_none());
}

#[tokio::test]
async fn full_booking_flow_over_wire() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let coach = register(&mut c, "Marta", "Europe/Prague").await;
    let client = register(&mut c, "Jonas", "America/New_York").await;
    let service = publish(&mut c, &coach).await;

    // A full first week on offer, rendered in the coach's zone.
    let resp = c
        .ok(json!({"op": "slots", "service_id": service, "client_id": client}))
        .await;
    let slots = resp["data"]["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 56);
    assert_eq!(slots[0]["label"], json!("Monday 05.05.2025 09:00"));

    // Book Wednesday 10:00 Prague.
    let start = monday() + 56 * H;
    let resp = c
        .ok(json!({
            "op": "book",
            "client_id": client,
            "service_id": service,
            "start": start,
            "notes": "focus plan for the quarter",
            "method": "paypal",
        }))
        .await;
    let session = resp["data"]["session"]["id"].as_str().unwrap().to_string();
    assert_eq!(resp["data"]["session"]["status"], json!("pending"));
    assert_eq!(resp["data"]["session"]["price"], json!("75.00"));
    assert!(resp.get("warning").is_none());

    // Push the session to 14:00 the same day; the edit lands in changed.
    let start = monday() + 60 * H;
    let resp = c
        .ok(json!({
            "op": "reschedule",
            "session_id": session,
            "actor": client,
            "start": start,
        }))
        .await;
    assert_eq!(resp["data"]["session"]["status"], json!("changed"));
    assert_eq!(resp["data"]["session"]["start"], json!(start));

    // Settle, link, confirm.
    let resp = c
        .ok(json!({
            "op": "settle_payment",
            "session_id": session,
            "actor": client,
            "external_ref": "pp-42",
        }))
        .await;
    assert_eq!(resp["data"]["payment"]["settled_at"], json!(monday()));
    assert_eq!(resp["data"]["payment"]["external_ref"], json!("pp-42"));

    c.ok(json!({
        "op": "set_meeting_details",
        "session_id": session,
        "actor": coach,
        "meeting_url": "https://meet.example/deep-work",
    }))
    .await;
    let resp = c.ok(json!({"op": "confirm", "session_id": session, "actor": coach})).await;
    assert_eq!(resp["data"]["session"]["status"], json!("confirmed"));

    // The booked hour is off the menu now.
    let resp = c
        .ok(json!({"op": "slots", "service_id": service, "client_id": client}))
        .await;
    assert_eq!(resp["data"]["slots"].as_array().unwrap().len(), 55);

    // Review and list round out the flow.
    let resp = c
        .ok(json!({
            "op": "leave_review",
            "session_id": session,
            "actor": client,
            "rating": 5,
            "comment": "exactly what I needed",
        }))
        .await;
    assert_eq!(resp["data"]["review"]["rating"], json!(5));

    let resp = c.ok(json!({"op": "sessions", "actor": client})).await;
    let sessions = resp["data"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], json!(session));
    // Rendered for the viewer: Jonas sees New York time.
    assert_eq!(sessions[0]["start_local"], json!("2025-05-07T08:00:00-04:00"));
}

#[tokio::test]
async fn wire_errors_carry_code_and_message() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let coach = register(&mut c, "Marta", "Europe/Prague").await;
    let client = register(&mut c, "Jonas", "America/New_York").await;
    let petra = register(&mut c, "Petra", "Europe/Prague").await;
    let service = publish(&mut c, &coach).await;

    let start = monday() + 56 * H;
    let resp = c
        .ok(json!({
            "op": "book", "client_id": client, "service_id": service,
            "start": start, "method": "paypal",
        }))
        .await;
    let session = resp["data"]["session"]["id"].as_str().unwrap().to_string();

    // Overlapping request loses with a conflict code.
    let resp = c
        .request(json!({
            "op": "book", "client_id": petra, "service_id": service,
            "start": start + 30 * M, "method": "cash",
        }))
        .await;
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("conflict_error"));
    assert!(resp["error"]["message"]
        .as_str()
        .unwrap()
        .contains("slot no longer available"));

    // Unknown ids map to not_found.
    let resp = c
        .request(json!({"op": "session", "session_id": Ulid::new().to_string(), "actor": client}))
        .await;
    assert_eq!(resp["error"]["code"], json!("not_found"));

    // Confirming before the money arrives is its own class.
    c.ok(json!({
        "op": "set_meeting_details", "session_id": session, "actor": coach,
        "meeting_url": "https://meet.example/room",
    }))
    .await;
    let resp = c.request(json!({"op": "confirm", "session_id": session, "actor": coach})).await;
    assert_eq!(resp["error"]["code"], json!("payment_not_settled"));

    // And the wrong actor is told so.
    let resp = c.request(json!({"op": "confirm", "session_id": session, "actor": client})).await;
    assert_eq!(resp["error"]["code"], json!("permission_denied"));

    // A line that is not JSON still gets a well-formed reply.
    c.framed.send("this is not json".to_string()).await.unwrap();
    let frame = c.recv_frame().await;
    assert_eq!(frame["ok"], json!(false));
    assert_eq!(frame["error"]["code"], json!("validation_error"));
}

#[tokio::test]
async fn subscribe_streams_session_events() {
    let addr = start_test_server().await;
    let mut watcher = Client::connect(addr).await;
    let mut actor = Client::connect(addr).await;

    let coach = register(&mut actor, "Marta", "Europe/Prague").await;
    let client = register(&mut actor, "Jonas", "America/New_York").await;
    let service = publish(&mut actor, &coach).await;

    // The coach watches from one connection while the client acts on
    // another.
    watcher.ok(json!({"op": "subscribe", "user_id": coach})).await;

    let start = monday() + 56 * H;
    let resp = actor
        .ok(json!({
            "op": "book", "client_id": client, "service_id": service,
            "start": start, "method": "venmo",
        }))
        .await;
    let session = resp["data"]["session"]["id"].as_str().unwrap().to_string();

    let push = watcher.recv_push().await;
    assert_eq!(push["user_id"], json!(coach));
    let booked = &push["push"]["SessionBooked"];
    assert_eq!(booked["id"], json!(session));
    assert_eq!(booked["coach_id"], json!(coach));
    assert_eq!(booked["start"], json!(start));

    actor.ok(json!({"op": "cancel", "session_id": session, "actor": client})).await;
    let push = watcher.recv_push().await;
    assert_eq!(push["push"]["SessionCancelled"]["id"], json!(session));
}

#[tokio::test]
async fn subscribe_requires_known_user() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let resp = c
        .request(json!({"op": "subscribe", "user_id": Ulid::new().to_string()}))
        .await;
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("not_found"));
}
