use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16, venue: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(venue)
        .user("paddock")
        .password("paddock");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_venue() -> String {
    format!("bench_{}", Ulid::new())
}

/// Midnight two days from now, far enough ahead for any notice rule.
fn base_time() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    (now / DAY + 2) * DAY
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_arena(client: &Client) -> Ulid {
    let arena = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO arenas (id, name) VALUES ('{arena}', 'bench')"))
        .await
        .unwrap();
    arena
}

fn public_booking(arena: Ulid, start: i64, end: i64) -> String {
    let (id, requester) = (Ulid::new(), Ulid::new());
    format!(
        r#"INSERT INTO bookings (id, arena_id, requester_id, start, "end", class) VALUES ('{id}', '{arena}', '{requester}', {start}, {end}, 'public')"#
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_venue()).await;
    let arena = create_arena(&client).await;
    let base = base_time();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .simple_query(&public_booking(arena, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} admissions in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

/// Every task races for the same slots on one arena; each slot must go to exactly one.
async fn phase2_contention(host: &str, port: u16) {
    let venue = fresh_venue();
    let setup = connect(host, port, &venue).await;
    let arena = create_arena(&setup).await;
    let base = base_time();

    let n_tasks = 16;
    let n_slots = 200;
    let confirmed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let venue = venue.clone();
        let confirmed = confirmed.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &venue).await;
            for slot in 0..n_slots {
                let s = base + (slot as i64) * HOUR;
                match client.simple_query(&public_booking(arena, s, s + HOUR)).await {
                    Ok(_) => confirmed.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        let code = e.as_db_error().map(|db| db.code().code().to_string());
                        assert_eq!(code.as_deref(), Some("23P01"), "unexpected error: {e}");
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots;
    let won = confirmed.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} requests in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  confirmed={won} conflicts={}",
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(won, n_slots, "each slot must be won exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let venue = fresh_venue();
    let setup = connect(host, port, &venue).await;
    let arena = create_arena(&setup).await;
    let base = base_time();
    for i in 0..200 {
        let s = base + (i as i64) * HOUR;
        setup.simple_query(&public_booking(arena, s, s + HOUR)).await.unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let venue = venue.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &venue).await;
            let arena = create_arena(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = base + (w as i64 * 100_000 + i) * HOUR;
                let _ = client.simple_query(&public_booking(arena, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let venue = venue.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &venue).await;
            let sql = format!(
                r#"SELECT * FROM bookings WHERE arena_id = '{arena}' AND start >= {base} AND "end" <= {}"#,
                base + 7 * DAY
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("booking list", &mut all_latencies);
}

/// Queue contested subscription bookings, then time one reconciliation pass.
async fn phase4_reconcile(host: &str, port: u16) {
    let client = connect(host, port, &fresh_venue()).await;
    let arena = create_arena(&client).await;
    client
        .batch_execute("INSERT INTO quota_config (max_future_total) VALUES (0)")
        .await
        .unwrap();

    // Tomorrow, so the default horizon covers every slot.
    let tomorrow = base_time() - DAY;
    let n_horses = 50;
    let n_slots = 20;
    for _ in 0..n_horses {
        let (horse, owner) = (Ulid::new(), Ulid::new());
        client
            .batch_execute(&format!(
                "INSERT INTO horses (id, owner_id) VALUES ('{horse}', '{owner}')"
            ))
            .await
            .unwrap();
        for slot in 0..n_slots {
            let s = tomorrow + (slot as i64) * HOUR;
            let id = Ulid::new();
            client
                .simple_query(&format!(
                    r#"INSERT INTO bookings (id, arena_id, horse_id, requester_id, start, "end", class) VALUES ('{id}', '{arena}', '{horse}', '{owner}', {s}, {}, 'subscription')"#,
                    s + HOUR
                ))
                .await
                .unwrap();
        }
    }

    let t = Instant::now();
    let messages = client.simple_query("SELECT * FROM reconcile").await.unwrap();
    let elapsed = t.elapsed();
    for msg in messages {
        if let SimpleQueryMessage::Row(row) = msg {
            println!(
                "  processed={} confirmed={} in {:.2}ms",
                row.get("processed").unwrap_or("?"),
                row.get("confirmed").unwrap_or("?"),
                elapsed.as_secs_f64() * 1000.0
            );
        }
    }
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PADDOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PADDOCK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid PADDOCK_PORT");

    println!("=== paddock stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential admissions");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended admissions");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] reconciliation pass");
    phase4_reconcile(&host, port).await;

    println!("\n=== benchmark complete ===");
}
