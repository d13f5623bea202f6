//! In-process stress run: availability queries and hold churn against a
//! populated engine. Run with `cargo bench`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ulid::Ulid;

use bayline::engine::{Engine, EngineConfig};
use bayline::model::{parse_hhmm, Span, WeekdayHours};
use bayline::notify::NotifyHub;

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn setup_engine() -> (Arc<Engine>, Ulid) {
    let dir = std::env::temp_dir().join(format!("bayline_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bench.wal");

    let config = EngineConfig { bays: 4, ..EngineConfig::default() };
    let engine = Arc::new(Engine::open(&path, config, Arc::new(NotifyHub::new())).unwrap());

    let hours = WeekdayHours {
        open: parse_hhmm("08:00").unwrap(),
        close: parse_hhmm("18:00").unwrap(),
        brk: Some(Span::new(720, 780)),
    };
    for weekday in 0..7 {
        engine.set_hours(weekday, Some(hours)).await.unwrap();
    }
    let svc = engine.add_service("exterior wash".into(), 30).await.unwrap();
    (engine, svc.id)
}

fn bench_date(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 8, 3).unwrap() + chrono::Days::new(offset)
}

/// Phase 1: sequential hold → confirm cycles across many dates.
async fn phase1_bookings(engine: &Arc<Engine>, service: Ulid) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = bench_date((i % 365) as u64);
        let slot = 480 + ((i / 365) as u16 % 8) * 30;
        let t = Instant::now();
        if let Ok(token) = engine
            .attempt_hold(date, slot, service, &format!("bench-{i}"))
            .await
        {
            engine.confirm_hold(token).await.unwrap();
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} hold+confirm cycles in {:.2}s ({:.0}/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("hold+confirm", &mut latencies);
}

/// Phase 2: availability queries against the populated ledger.
async fn phase2_availability(engine: &Arc<Engine>, service: Ulid) {
    let n = 5000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = bench_date((i % 365) as u64);
        let t = Instant::now();
        let slots = engine.compute_slots(date, service, None).await.unwrap();
        assert!(!slots.is_empty());
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} availability queries in {:.2}s ({:.0}/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("compute_slots", &mut latencies);
}

/// Phase 3: contended holds — many tasks fighting over the same slots.
async fn phase3_contention(engine: &Arc<Engine>, service: Ulid) {
    let date = bench_date(400);
    let tasks_n = 64;
    let start = Instant::now();

    let mut tasks = Vec::new();
    for i in 0..tasks_n {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let mut won = 0u32;
            let mut lost = 0u32;
            for round in 0..50u16 {
                let slot = 480 + (round % 16) * 30;
                match engine
                    .attempt_hold(date, slot, service, &format!("contender-{i}"))
                    .await
                {
                    Ok(token) => {
                        won += 1;
                        let _ = engine.release_hold(token).await;
                    }
                    Err(_) => lost += 1,
                }
            }
            (won, lost)
        }));
    }

    let mut won = 0;
    let mut lost = 0;
    for task in tasks {
        let (w, l) = task.await.unwrap();
        won += w;
        lost += l;
    }

    let elapsed = start.elapsed();
    println!(
        "  {tasks_n} tasks x 50 contended holds in {:.2}s: {won} won, {lost} conflicted",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("bayline stress bench");
    let (engine, service) = setup_engine().await;

    println!("phase 1: booking throughput");
    phase1_bookings(&engine, service).await;

    println!("phase 2: availability queries");
    phase2_availability(&engine, service).await;

    println!("phase 3: hold contention");
    phase3_contention(&engine, service).await;
}
