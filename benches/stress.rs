use std::sync::Arc;
use std::time::{Duration, Instant};

use chargewatch::clock::TokioClock;
use chargewatch::config::{DriverConfig, EngineConfig};
use chargewatch::driver;
use chargewatch::engine::Engine;
use chargewatch::model::*;
use chargewatch::notify::NotifyHub;
use chargewatch::record::{BookingRecord, PushMessage};
use chargewatch::source::{BookingSource, StaticSource};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 3_600_000;
const DAY: i64 = 1_717_200_000_000; // 2024-06-01T00:00:00Z
const CHARGERS: usize = 200;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn rfc3339(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Deterministic day of bookings: back-to-back 30..90 minute slots per charger.
fn day_of_bookings(per_charger: usize) -> Vec<BookingWindow> {
    let mut windows = Vec::with_capacity(CHARGERS * per_charger);
    for c in 0..CHARGERS {
        let mut start = DAY + (c as i64 % 7) * 5 * MINUTE;
        for b in 0..per_charger {
            let len = (30 + ((c * 31 + b * 17) % 61) as i64) * MINUTE;
            windows.push(BookingWindow::new(
                format!("b-{c}-{b}"),
                format!("C{c}"),
                Span::new(start, start + len),
                BookingStatus::Confirmed,
            ));
            start += len;
        }
    }
    windows
}

fn phase1_apply_throughput() {
    let windows = day_of_bookings(20);
    let mut engine = Engine::new(EngineConfig::default(), Arc::new(NotifyHub::new()));
    engine.begin_snapshot();
    engine.abandon_snapshot(DAY);

    let now = DAY + 6 * HOUR;
    let mut latencies = Vec::with_capacity(windows.len());
    let start = Instant::now();
    for w in windows.iter().cloned() {
        let t = Instant::now();
        let _ = engine.apply_booking_event(w, now);
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let n = windows.len();
    println!(
        "  {n} bookings in {:.3}s = {:.0} ops/sec, {} timers pending",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64(),
        engine.status().timers
    );
    print_latency("apply latency", &mut latencies);
}

fn phase2_advance_through_day() {
    let windows = day_of_bookings(20);
    let mut engine = Engine::new(EngineConfig::default(), Arc::new(NotifyHub::new()));
    engine.begin_snapshot();
    engine.abandon_snapshot(DAY);
    for w in windows {
        let _ = engine.apply_booking_event(w, DAY);
    }

    let mut latencies = Vec::new();
    let mut fired = 0;
    let start = Instant::now();
    let mut now = DAY;
    while now < DAY + 24 * HOUR {
        now += MINUTE;
        let t = Instant::now();
        fired += engine.advance(now);
        latencies.push(t.elapsed());
    }
    println!(
        "  {fired} transitions over 1440 ticks in {:.3}s, revision {}",
        start.elapsed().as_secs_f64(),
        engine.revision()
    );
    print_latency("tick latency", &mut latencies);
}

fn phase3_conflict_checks() {
    let windows = day_of_bookings(20);
    let mut engine = Engine::new(EngineConfig::default(), Arc::new(NotifyHub::new()));
    engine.begin_snapshot();
    engine.abandon_snapshot(DAY);
    for w in windows {
        let _ = engine.apply_booking_event(w, DAY);
    }

    let n = 50_000;
    let mut latencies = Vec::with_capacity(n);
    let mut hits = 0;
    for i in 0..n {
        let charger = format!("C{}", i % CHARGERS);
        let s = DAY + ((i * 7) % (24 * 60)) as i64 * MINUTE;
        let t = Instant::now();
        if engine.has_conflict(&charger, s, s + 45 * MINUTE) {
            hits += 1;
        }
        latencies.push(t.elapsed());
    }
    println!("  {n} checks, {hits} conflicts");
    print_latency("conflict check latency", &mut latencies);
}

async fn phase4_driver_push_rate() {
    let source: Arc<dyn BookingSource> = Arc::new(StaticSource::new(Vec::new()));
    let (handle, task) = driver::spawn(
        DriverConfig::default(),
        TokioClock::starting_at(DAY + 6 * HOUR),
        source,
        None,
    );

    let n = 20_000;
    let start = Instant::now();
    for i in 0..n {
        let s = DAY + (i as i64 % 48) * 30 * MINUTE;
        let record = BookingRecord {
            id: format!("p-{i}"),
            charger_id: format!("C{}", i % CHARGERS),
            start_time: rfc3339(s),
            end_time: None,
            duration_minutes: Some(30),
            status: "confirmed".into(),
        };
        if handle.push(PushMessage::Created { booking: record }).await.is_err() {
            break;
        }
    }
    // Round-trip to make sure every push was processed.
    let tracked = handle.status().await.map_or(0, |s| s.tracked);
    let elapsed = start.elapsed();
    println!(
        "  {n} pushes in {:.3}s = {:.0} msgs/sec, {tracked} tracked",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );

    handle.shutdown().await;
    let _ = task.await;
}

#[tokio::main]
async fn main() {
    println!("=== chargewatch stress benchmark ===");
    println!("{CHARGERS} chargers\n");

    println!("[phase 1] apply throughput");
    phase1_apply_throughput();

    println!("\n[phase 2] advancing through a full day");
    phase2_advance_through_day();

    println!("\n[phase 3] conflict checks");
    phase3_conflict_checks();

    println!("\n[phase 4] driver push rate");
    phase4_driver_push_rate().await;

    println!("\n=== benchmark complete ===");
}
