use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use kairos::wire::LineCodec;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 86_400_000;

struct Conn {
    framed: Framed<TcpStream, LineCodec>,
    next_id: u64,
}

impl Conn {
    async fn open(addr: &str, token: &str) -> Conn {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let mut framed = Framed::new(stream, LineCodec);
        framed
            .send(json!({"hello": token}).to_string())
            .await
            .expect("handshake send failed");
        let line = framed
            .next()
            .await
            .expect("server closed during handshake")
            .expect("handshake read failed");
        let ack: Value = serde_json::from_str(&line).expect("bad handshake frame");
        if ack["ok"] != json!(true) {
            panic!("handshake rejected: {ack}");
        }
        Conn { framed, next_id: 1 }
    }

    async fn call(&mut self, mut body: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        body["id"] = json!(id);
        self.framed.send(body.to_string()).await.expect("send failed");
        loop {
            let line = self
                .framed
                .next()
                .await
                .expect("server closed")
                .expect("read failed");
            let frame: Value = serde_json::from_str(&line).expect("bad frame");
            if frame.get("push").is_some() {
                continue;
            }
            if frame["ok"] != json!(true) {
                panic!("request failed: {frame}");
            }
            return frame;
        }
    }
}

async fn register(conn: &mut Conn, name: &str) -> String {
    let resp = conn
        .call(json!({"op": "register_user", "name": name, "tz": "Europe/Prague"}))
        .await;
    resp["data"]["id"].as_str().unwrap().to_string()
}

async fn publish(conn: &mut Conn, coach: &str, name: &str) -> String {
    let resp = conn
        .call(json!({
            "op": "publish_service",
            "coach_id": coach,
            "name": name,
            "duration_min": 60,
            "price": "80.00",
            "currency": "EUR",
            "mode": "online",
        }))
        .await;
    resp["data"]["id"].as_str().unwrap().to_string()
}

async fn book(conn: &mut Conn, client: &str, service: &str, start: i64) {
    conn.call(json!({
        "op": "book",
        "client_id": client,
        "service_id": service,
        "start": start,
        "method": "paypal",
    }))
    .await;
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Offering {
    coach: String,
    service: String,
}

async fn setup(conn: &mut Conn) -> Vec<Offering> {
    let mut offerings = Vec::new();
    for i in 0..10 {
        let coach = register(conn, &format!("Bench Coach {i}")).await;
        let service = publish(conn, &coach, &format!("Coaching Hour {i}")).await;
        offerings.push(Offering { coach, service });
    }
    println!("  created {} coaches with one service each", offerings.len());
    offerings
}

async fn phase1_sequential(addr: &str, token: &str, offering: &Offering, base: i64) {
    let mut conn = Conn::open(addr, token).await;
    let client = register(&mut conn, "Sequential Client").await;
    let service = offering.service.clone();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * HOUR;
        let t = Instant::now();
        book(&mut conn, &client, &service, s).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(addr: &str, token: &str, base: i64) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let addr = addr.to_string();
        let token = token.to_string();

        handles.push(tokio::spawn(async move {
            // Each task books against its own coach, so tasks contend on
            // the wire and the log but never on a calendar.
            let mut conn = Conn::open(&addr, &token).await;
            let coach = register(&mut conn, &format!("Parallel Coach {i}")).await;
            let service = publish(&mut conn, &coach, &format!("Parallel Hour {i}")).await;
            let client = register(&mut conn, &format!("Parallel Client {i}")).await;

            for j in 0..n_per_task {
                let s = base + (j as i64) * HOUR;
                book(&mut conn, &client, &service, s).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(addr: &str, token: &str, offering: &Offering, base: i64) {
    // Pre-fill the read target so availability is non-trivial.
    let mut setup_conn = Conn::open(addr, token).await;
    let filler = register(&mut setup_conn, "Prefill Client").await;
    for i in 0..200 {
        let s = base + (i as i64) * HOUR;
        book(&mut setup_conn, &filler, &offering.service, s).await;
    }
    drop(setup_conn);

    // Writer tasks keep booking their own coaches in the background.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let addr = addr.to_string();
        let token = token.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut conn = Conn::open(&addr, &token).await;
            let coach = register(&mut conn, &format!("Background Coach {w}")).await;
            let service = publish(&mut conn, &coach, &format!("Background Hour {w}")).await;
            let client = register(&mut conn, &format!("Background Client {w}")).await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let s = base + i * HOUR;
                book(&mut conn, &client, &service, s).await;
                i += 1;
            }
        }));
    }

    // Reader tasks hammer the slot grid of the shared service.
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let addr = addr.to_string();
        let token = token.to_string();
        let service = offering.service.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut conn = Conn::open(&addr, &token).await;
            let client = register(&mut conn, &format!("Reader Client {r}")).await;

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                conn.call(json!({"op": "slots", "service_id": service, "client_id": client}))
                    .await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slot query", &mut all_latencies);
}

async fn phase4_connection_storm(addr: &str, token: &str, base: i64) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for c in 0..n_conns {
        let addr = addr.to_string();
        let token = token.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = Conn::open(&addr, &token).await;
            let coach = register(&mut conn, &format!("Storm Coach {c}")).await;
            let service = publish(&mut conn, &coach, &format!("Storm Hour {c}")).await;
            let client = register(&mut conn, &format!("Storm Client {c}")).await;

            for i in 0..ops_per_conn {
                let s = base + (i as i64) * HOUR;
                book(&mut conn, &client, &service, s).await;
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("KAIROS_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("KAIROS_PORT")
        .unwrap_or_else(|_| "7470".into())
        .parse()
        .expect("invalid KAIROS_PORT");
    let token = std::env::var("KAIROS_TOKEN").unwrap_or_else(|_| "kairos".into());
    let addr = format!("{host}:{port}");

    // Phases book disjoint coaches, so slots never collide across phases.
    let base = chrono::Utc::now().timestamp_millis() + DAY;

    println!("=== kairos stress benchmark ===");
    println!("target: {addr}\n");

    println!("[setup]");
    let mut setup_conn = Conn::open(&addr, &token).await;
    let offerings = setup(&mut setup_conn).await;
    drop(setup_conn);

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&addr, &token, &offerings[0], base).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&addr, &token, base).await;

    println!("\n[phase 3] slot query latency under booking load");
    phase3_read_under_load(&addr, &token, &offerings[1], base).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&addr, &token, base).await;

    println!("\n=== benchmark complete ===");
}
