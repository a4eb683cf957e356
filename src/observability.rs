use std::net::SocketAddr;

// ── Write path ──────────────────────────────────────────────────

/// Counter: booking events applied. Labels: source (snapshot/live/replay), outcome.
pub const EVENTS_TOTAL: &str = "chargewatch_events_total";

/// Counter: records rejected at the boundary. Labels: reason.
pub const EVENTS_REJECTED_TOTAL: &str = "chargewatch_events_rejected_total";

/// Counter: live messages dropped because the pending buffer overflowed.
pub const PENDING_DROPPED_TOTAL: &str = "chargewatch_pending_dropped_total";

// ── Timers ──────────────────────────────────────────────────────

/// Counter: transitions fired. Labels: kind, applied (true/false).
pub const TRANSITIONS_FIRED_TOTAL: &str = "chargewatch_transitions_fired_total";

/// Gauge: transitions currently scheduled.
pub const TIMERS_PENDING: &str = "chargewatch_timers_pending";

// ── State ───────────────────────────────────────────────────────

/// Gauge: bookings currently tracked.
pub const BOOKINGS_TRACKED: &str = "chargewatch_bookings_tracked";

/// Gauge: chargers currently busy.
pub const CHARGERS_BUSY: &str = "chargewatch_chargers_busy";

/// Counter: busy flag flips.
pub const BUSY_CHANGES_TOTAL: &str = "chargewatch_busy_changes_total";

// ── Snapshot ────────────────────────────────────────────────────

/// Counter: snapshot fetch attempts. Labels: status (ok/error).
pub const SNAPSHOT_ATTEMPTS_TOTAL: &str = "chargewatch_snapshot_attempts_total";

/// Histogram: wall time from fetch start to snapshot applied, in seconds.
pub const SNAPSHOT_DURATION_SECONDS: &str = "chargewatch_snapshot_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
