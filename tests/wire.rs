use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use bayline::engine::{Engine, EngineConfig};
use bayline::notify::NotifyHub;
use bayline::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(config: EngineConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bayline_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("bayline.wal");

    let engine =
        Arc::new(Engine::open(&wal_path, config, Arc::new(NotifyHub::new())).unwrap());
    tokio::spawn(bayline::reaper::run_reaper(engine.clone()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
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

    async fn call(&mut self, request: &str) -> Value {
        self.framed.send(request.to_string()).await.unwrap();
        let line = self.framed.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Read one pushed notification line.
    async fn next_push(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for push")
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

async fn setup_shop(client: &mut Client) -> String {
    let resp = client
        .call(r#"{"op":"set_hours","weekday":"monday","open":"08:00","close":"17:00","break_start":"12:00","break_end":"13:00"}"#)
        .await;
    assert_eq!(resp["ok"], true, "set_hours failed: {resp}");

    let resp = client
        .call(r#"{"op":"add_service","name":"exterior wash","duration_min":45}"#)
        .await;
    assert_eq!(resp["ok"], true, "add_service failed: {resp}");
    resp["id"].as_str().unwrap().to_string()
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn full_reservation_flow_over_the_wire() {
    let addr = start_test_server(EngineConfig { bays: 1, ..EngineConfig::default() }).await;
    let mut admin = Client::connect(addr).await;
    let service = setup_shop(&mut admin).await;

    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;

    // Alice sees the full day.
    let resp = alice
        .call(&format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}","holder":"alice"}}"#))
        .await;
    assert_eq!(resp["ok"], true);
    let slots = resp["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 14);
    assert_eq!(slots[0]["start"], "08:00");
    assert!(slots.iter().all(|s| s["available"] == true));

    // Alice holds 10:00.
    let resp = alice
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"alice"}}"#))
        .await;
    assert_eq!(resp["ok"], true);
    let token = resp["token"].as_str().unwrap().to_string();

    // Bob now sees 10:00 as conflicted, and his own claim fails.
    let resp = bob
        .call(&format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}","holder":"bob"}}"#))
        .await;
    let ten = resp["slots"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["start"] == "10:00")
        .unwrap();
    assert_eq!(ten["available"], false);
    assert_eq!(ten["conflicts"][0]["kind"], "held");

    let resp = bob
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"bob"}}"#))
        .await;
    assert_eq!(resp["error"]["kind"], "conflict");
    assert_eq!(resp["error"]["message"], "this slot was just taken");

    // Alice completes checkout.
    let resp = alice.call(&format!(r#"{{"op":"confirm","token":"{token}"}}"#)).await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["booking"]["start"], "10:00");
    assert_eq!(resp["booking"]["status"], "confirmed");

    // The slot is now booked out, not just held.
    let resp = bob
        .call(&format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}","holder":"bob"}}"#))
        .await;
    let ten = resp["slots"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["start"] == "10:00")
        .unwrap();
    assert_eq!(ten["booked"], 1);
    assert_eq!(ten["available"], false);

    // Confirming a stale token again reports not_found.
    let resp = alice.call(&format!(r#"{{"op":"confirm","token":"{token}"}}"#)).await;
    assert_eq!(resp["error"]["kind"], "not_found");

    // The admin sees the booking.
    let resp = admin.call(r#"{"op":"bookings","date":"2026-08-03"}"#).await;
    let bookings = resp["bookings"].as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["status"], "confirmed");
}

#[tokio::test]
async fn release_frees_the_slot_for_the_next_customer() {
    let addr = start_test_server(EngineConfig { bays: 1, ..EngineConfig::default() }).await;
    let mut client = Client::connect(addr).await;
    let service = setup_shop(&mut client).await;

    let resp = client
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"13:00","service":"{service}","holder":"alice"}}"#))
        .await;
    let token = resp["token"].as_str().unwrap().to_string();

    let resp = client
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"13:00","service":"{service}","holder":"bob"}}"#))
        .await;
    assert_eq!(resp["error"]["kind"], "conflict");

    let resp = client.call(&format!(r#"{{"op":"release","token":"{token}"}}"#)).await;
    assert_eq!(resp["ok"], true);

    let resp = client
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"13:00","service":"{service}","holder":"bob"}}"#))
        .await;
    assert_eq!(resp["ok"], true);

    // Releasing an unknown token is not_found, mapped distinctly.
    let resp = client
        .call(&format!(r#"{{"op":"release","token":"{}"}}"#, Ulid::new()))
        .await;
    assert_eq!(resp["error"]["kind"], "not_found");
}

#[tokio::test]
async fn expired_hold_reports_expired_over_the_wire() {
    let addr = start_test_server(EngineConfig {
        bays: 1,
        hold_ttl_ms: 50,
        ..EngineConfig::default()
    })
    .await;
    let mut client = Client::connect(addr).await;
    let service = setup_shop(&mut client).await;

    let resp = client
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"alice"}}"#))
        .await;
    let token = resp["token"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = client.call(&format!(r#"{{"op":"confirm","token":"{token}"}}"#)).await;
    assert_eq!(resp["error"]["kind"], "expired");
    assert_eq!(
        resp["error"]["message"],
        "your reservation expired, please pick a time again"
    );
}

#[tokio::test]
async fn subscribers_see_hold_and_booking_events() {
    let addr = start_test_server(EngineConfig { bays: 1, ..EngineConfig::default() }).await;
    let mut admin = Client::connect(addr).await;
    let service = setup_shop(&mut admin).await;

    let mut watcher = Client::connect(addr).await;
    let resp = watcher.call(r#"{"op":"subscribe","date":"2026-08-03"}"#).await;
    assert_eq!(resp["ok"], true);

    let mut alice = Client::connect(addr).await;
    let resp = alice
        .call(&format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"alice"}}"#))
        .await;
    let token = resp["token"].as_str().unwrap().to_string();

    let push = watcher.next_push().await;
    assert_eq!(push["event"], "hold_placed");
    assert_eq!(push["date"], "2026-08-03");

    alice.call(&format!(r#"{{"op":"confirm","token":"{token}"}}"#)).await;
    let push = watcher.next_push().await;
    assert_eq!(push["event"], "hold_released");
    let push = watcher.next_push().await;
    assert_eq!(push["event"], "booking_confirmed");
}

#[tokio::test]
async fn holiday_empties_the_day_over_the_wire() {
    let addr = start_test_server(EngineConfig::default()).await;
    let mut client = Client::connect(addr).await;
    let service = setup_shop(&mut client).await;

    let resp = client
        .call(r#"{"op":"add_holiday","date":"2026-08-03","label":"staff outing"}"#)
        .await;
    assert_eq!(resp["ok"], true);

    let resp = client
        .call(&format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}"}}"#))
        .await;
    assert_eq!(resp["ok"], true);
    assert!(resp["slots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_wire_clients_one_hold_winner() {
    let addr = start_test_server(EngineConfig { bays: 1, ..EngineConfig::default() }).await;
    let mut admin = Client::connect(addr).await;
    let service = setup_shop(&mut admin).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(&format!(
                    r#"{{"op":"hold","date":"2026-08-03","slot":"09:00","service":"{service}","holder":"sess-{i}"}}"#
                ))
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for task in tasks {
        let resp = task.await.unwrap();
        if resp["ok"] == true {
            ok += 1;
        } else {
            assert_eq!(resp["error"]["kind"], "conflict");
            conflicts += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
}
