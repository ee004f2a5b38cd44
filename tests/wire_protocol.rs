use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use hotelcal::clock::FixedClock;
use hotelcal::engine::{Engine, EngineSettings};
use hotelcal::notify::NotifyHub;
use hotelcal::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("hotelcal_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let today = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
    let settings = EngineSettings::new(Arc::new(FixedClock::on(today)), 14, 365);
    let engine = Arc::new(Engine::new(dir.join("hotel.wal"), Arc::new(NotifyHub::new()), settings).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.framed.send(line.to_string()).await.unwrap();
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await;
        self.next_line().await
    }

    async fn ok(&mut self, request: Value) -> Value {
        let reply = self.call(request).await;
        assert!(reply.get("error").is_none(), "unexpected error: {reply}");
        reply["ok"].clone()
    }

    async fn error_kind(&mut self, request: Value) -> String {
        let reply = self.call(request).await;
        reply["error"]["kind"]
            .as_str()
            .unwrap_or_else(|| panic!("expected error, got {reply}"))
            .to_string()
    }
}

fn card(amount: u64) -> Value {
    json!({ "amount": amount, "method": "card", "paid_on": "2025-02-01" })
}

async fn seed(client: &mut Client) -> String {
    let standard = client
        .ok(json!({ "op": "create_room_type", "name": "Standard", "nightly_rate": 100, "capacity": 2 }))
        .await;
    let type_id = standard["id"].as_str().unwrap().to_string();
    for room in [101, 102] {
        client
            .ok(json!({ "op": "create_room", "room_id": room, "room_type_id": type_id }))
            .await;
    }
    type_id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_search_cancel_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    seed(&mut client).await;

    let booked = client
        .ok(json!({
            "op": "book", "room_id": 101, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-01", "check_out": "2025-03-04", "payment": card(300)
        }))
        .await;
    assert_eq!(booked["booking"]["total_price"], 300);
    assert_eq!(booked["booking"]["state"], "confirmed");
    assert_eq!(booked["receipt"]["status"], "active");
    let booking_id = booked["booking"]["id"].as_str().unwrap().to_string();

    let kind = client
        .error_kind(json!({
            "op": "book", "room_id": 101, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-02", "check_out": "2025-03-05", "payment": card(300)
        }))
        .await;
    assert_eq!(kind, "conflict");

    let free = client
        .ok(json!({ "op": "search", "check_in": "2025-03-02", "check_out": "2025-03-03", "guests": 2 }))
        .await;
    let rooms: Vec<u64> = free
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect();
    assert_eq!(rooms, vec![102]);

    let cancelled = client
        .ok(json!({ "op": "cancel_booking", "booking_id": booking_id, "refund": true }))
        .await;
    assert_eq!(cancelled["booking"]["state"], "cancelled");
    assert_eq!(cancelled["refunded_receipt"]["status"], "refunded");

    let check = client
        .ok(json!({ "op": "check", "room_id": 101, "check_in": "2025-03-01", "check_out": "2025-03-04" }))
        .await;
    assert_eq!(check["available"], true);
}

#[tokio::test]
async fn validation_errors_list_each_violation() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    seed(&mut client).await;

    let reply = client
        .call(json!({
            "op": "book", "room_id": 101, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-04", "check_out": "2025-03-01",
            "payment": { "amount": 0, "method": "cash", "paid_on": "2025-02-01" }
        }))
        .await;
    assert_eq!(reply["error"]["kind"], "validation");
    let fields: Vec<&str> = reply["error"]["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["check_out", "amount"]);
}

#[tokio::test]
async fn malformed_lines_get_error_replies() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    client.send_raw("not json").await;
    assert_eq!(client.next_line().await["error"]["kind"], "bad_request");

    assert_eq!(client.error_kind(json!({ "op": "teleport" })).await, "bad_request");

    // The connection survives bad input.
    let rooms = client.ok(json!({ "op": "list_rooms" })).await;
    assert_eq!(rooms, json!([]));
}

#[tokio::test]
async fn subscribers_receive_room_events() {
    let (addr, _engine) = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    seed(&mut admin).await;

    let mut listener = Client::connect(addr).await;
    let sub = listener.ok(json!({ "op": "subscribe", "room_id": 101 })).await;
    assert_eq!(sub["subscribed"], 101);
    assert_eq!(
        listener.error_kind(json!({ "op": "subscribe", "room_id": 999 })).await,
        "not_found"
    );

    admin
        .ok(json!({
            "op": "hold", "room_id": 102, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-01", "check_out": "2025-03-02"
        }))
        .await;
    let hold = admin
        .ok(json!({
            "op": "hold", "room_id": 101, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-01", "check_out": "2025-03-02"
        }))
        .await;

    let event = listener.next_line().await;
    assert_eq!(event["event"]["room_id"], 101);
    let committed = &event["event"]["record"]["BookingCommitted"];
    assert_eq!(committed["booking"]["id"], hold["id"]);
    assert_eq!(committed["booking"]["state"], "pending");

    let unsub = listener.ok(json!({ "op": "unsubscribe", "room_id": 101 })).await;
    assert_eq!(unsub["unsubscribed"], true);
}

#[tokio::test]
async fn hold_then_confirm_over_tcp() {
    let (addr, engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    seed(&mut client).await;

    let hold = client
        .ok(json!({
            "op": "hold", "room_id": 101, "guest_id": Ulid::new().to_string(),
            "check_in": "2025-03-10", "check_out": "2025-03-12"
        }))
        .await;
    let id = hold["id"].as_str().unwrap().to_string();

    let confirmed = client
        .ok(json!({ "op": "confirm_hold", "booking_id": id, "payment": card(200) }))
        .await;
    assert_eq!(confirmed["booking"]["state"], "confirmed");

    let receipts = client.ok(json!({ "op": "list_receipts", "booking_id": id })).await;
    assert_eq!(receipts.as_array().unwrap().len(), 1);

    let calendar = client
        .ok(json!({ "op": "calendar", "room_id": 101, "check_in": "2025-03-09", "check_out": "2025-03-13" }))
        .await;
    let statuses: Vec<&str> = calendar
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["available", "occupied", "occupied", "available"]);

    let booking = engine.get_booking(id.parse().unwrap()).await.unwrap();
    assert_eq!(booking.total_price, 200);
}
