//! The external booking API, seen from the engine: one bulk fetch.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::start_of_local_day;
use crate::config::{EngineConfig, RetryConfig};
use crate::model::*;
use crate::record::BookingRecord;

/// Which bookings the snapshot should cover: every non-cancelled booking
/// overlapping today or later, optionally for a subset of chargers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotScope {
    /// Local midnight today: bookings ending after this are wanted.
    pub from: Ms,
    /// `None` means every charger the viewer can see.
    pub charger_ids: Option<Vec<String>>,
    /// How record timestamps are read when deciding what is in scope.
    pub config: EngineConfig,
}

impl SnapshotScope {
    /// Scope starting at the local midnight of `now`.
    pub fn today(now: Ms, config: &EngineConfig, charger_ids: Option<Vec<String>>) -> Self {
        Self {
            from: start_of_local_day(now, config.utc_offset),
            charger_ids,
            config: config.clone(),
        }
    }

    pub fn covers_charger(&self, charger_id: &str) -> bool {
        self.charger_ids
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == charger_id))
    }

    /// Whether a tracked window falls inside this scope, i.e. whether the
    /// snapshot is authoritative for it.
    pub fn covers(&self, window: &BookingWindow) -> bool {
        window.span.end > self.from && self.covers_charger(&window.charger_id)
    }

    /// Source-side filter. Rows that don't parse are passed through so the
    /// engine records the rejection.
    pub fn wants(&self, record: &BookingRecord) -> bool {
        if !self.covers_charger(record.charger_id.trim()) {
            return false;
        }
        match record.to_window(&self.config) {
            Ok(window) => window.status != BookingStatus::Cancelled && window.span.end > self.from,
            Err(_) => true,
        }
    }
}

#[derive(Debug)]
pub enum SourceError {
    /// Worth retrying: timeouts, connection resets, 5xx.
    Transient(String),
    /// Retrying won't help: bad credentials, malformed payload.
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Transient(e) => write!(f, "transient: {e}"),
            SourceError::Permanent(e) => write!(f, "permanent: {e}"),
        }
    }
}

impl std::error::Error for SourceError {}

#[async_trait]
pub trait BookingSource: Send + Sync + 'static {
    /// All non-cancelled bookings in scope.
    async fn fetch_snapshot(&self, scope: &SnapshotScope) -> Result<Vec<BookingRecord>, SourceError>;
}

/// Fixed set of records. Optionally fails the first `failures` calls.
pub struct StaticSource {
    records: Vec<BookingRecord>,
    failures: Mutex<u32>,
}

impl StaticSource {
    pub fn new(records: Vec<BookingRecord>) -> Self {
        Self {
            records,
            failures: Mutex::new(0),
        }
    }

    pub fn failing_first(records: Vec<BookingRecord>, failures: u32) -> Self {
        Self {
            records,
            failures: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl BookingSource for StaticSource {
    async fn fetch_snapshot(&self, scope: &SnapshotScope) -> Result<Vec<BookingRecord>, SourceError> {
        let mut failures = self.failures.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(SourceError::Transient("booking API unavailable".into()));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| scope.wants(r))
            .cloned()
            .collect())
    }
}

/// Reads a JSON array of booking records from disk on every fetch.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BookingSource for JsonFileSource {
    async fn fetch_snapshot(&self, scope: &SnapshotScope) -> Result<Vec<BookingRecord>, SourceError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::Permanent(format!("{}: {e}", self.path.display()))
            } else {
                SourceError::Transient(format!("{}: {e}", self.path.display()))
            }
        })?;
        let records: Vec<BookingRecord> = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Permanent(format!("{}: {e}", self.path.display())))?;
        Ok(records.into_iter().filter(|r| scope.wants(r)).collect())
    }
}

/// Fetch the snapshot, retrying transient failures with exponential backoff.
pub async fn fetch_with_retry(
    source: Arc<dyn BookingSource>,
    scope: SnapshotScope,
    config: RetryConfig,
) -> Result<Vec<BookingRecord>, SourceError> {
    retry_with_backoff(
        config,
        || source.fetch_snapshot(&scope),
        SourceError::is_transient,
        "fetch_snapshot",
    )
    .await
}

/// Run `operation` until it succeeds, a non-retryable error comes back, or
/// attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                metrics::counter!(crate::observability::SNAPSHOT_ATTEMPTS_TOTAL, "status" => "ok")
                    .increment(1);
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                metrics::counter!(crate::observability::SNAPSHOT_ATTEMPTS_TOTAL, "status" => "error")
                    .increment(1);
                if attempt >= config.max_attempts || !should_retry(&err) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = config.max_attempts,
                        error = %err,
                        "giving up"
                    );
                    return Err(err);
                }
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, charger: &str) -> BookingRecord {
        BookingRecord {
            id: id.into(),
            charger_id: charger.into(),
            start_time: "2024-06-01T14:00:00Z".into(),
            end_time: Some("2024-06-01T15:00:00Z".into()),
            duration_minutes: None,
            status: "confirmed".into(),
        }
    }

    // 2024-06-01T00:00:00Z
    const DAY: Ms = 1_717_200_000_000;

    fn scope(chargers: Option<&[&str]>) -> SnapshotScope {
        SnapshotScope::today(
            DAY + 9 * 3_600_000,
            &EngineConfig::default(),
            chargers.map(|c| c.iter().map(|s| s.to_string()).collect()),
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(250),
        }
    }

    #[tokio::test]
    async fn static_source_filters_by_charger() {
        let source = StaticSource::new(vec![rec("a", "C1"), rec("b", "C2")]);
        let all = source.fetch_snapshot(&scope(None)).await.unwrap();
        assert_eq!(all.len(), 2);
        let c2 = source.fetch_snapshot(&scope(Some(&["C2"][..]))).await.unwrap();
        assert_eq!(c2, vec![rec("b", "C2")]);
    }

    #[tokio::test]
    async fn snapshot_excludes_past_and_cancelled_rows() {
        let mut old = rec("old", "C1");
        old.start_time = "2020-01-01T10:00:00Z".into();
        old.end_time = Some("2020-01-01T11:00:00Z".into());
        let mut cancelled = rec("gone", "C1");
        cancelled.status = "cancelled".into();
        let mut overnight = rec("overnight", "C1");
        overnight.start_time = "2024-05-31T23:00:00Z".into();
        overnight.end_time = Some("2024-06-01T01:00:00Z".into());
        let mut ended_at_midnight = rec("yesterday", "C1");
        ended_at_midnight.start_time = "2024-05-31T23:00:00Z".into();
        ended_at_midnight.end_time = Some("2024-06-01T00:00:00Z".into());
        let mut garbled = rec("garbled", "C1");
        garbled.start_time = "not a time".into();

        let source = StaticSource::new(vec![
            old,
            cancelled,
            rec("today", "C1"),
            overnight,
            ended_at_midnight,
            garbled,
        ]);
        let ids: Vec<String> = source
            .fetch_snapshot(&scope(None))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["today", "overnight", "garbled"]);
    }

    #[test]
    fn scope_starts_at_local_midnight() {
        let config = EngineConfig {
            utc_offset: chrono::FixedOffset::east_opt(2 * 3600).unwrap(),
            ..EngineConfig::default()
        };
        // 2024-06-01T23:30Z is already June 2nd at +02:00.
        let s = SnapshotScope::today(DAY + 23 * 3_600_000 + 1_800_000, &config, None);
        assert_eq!(s.from, DAY + 22 * 3_600_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let source: Arc<dyn BookingSource> =
            Arc::new(StaticSource::failing_first(vec![rec("a", "C1")], 2));
        let started = tokio::time::Instant::now();
        let records = fetch_with_retry(source, scope(None), fast_retry(3))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        // 100ms + 200ms of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let source: Arc<dyn BookingSource> =
            Arc::new(StaticSource::failing_first(vec![rec("a", "C1")], 10));
        let result = fetch_with_retry(source, scope(None), fast_retry(3)).await;
        assert!(matches!(result, Err(SourceError::Transient(_))));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), SourceError> = retry_with_backoff(
            fast_retry(5),
            || {
                calls += 1;
                async { Err(SourceError::Permanent("401".into())) }
            },
            SourceError::is_transient,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn json_file_source_reads_records() {
        let dir = std::env::temp_dir().join("chargewatch_test_source");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","chargerId":"C1","startTime":"2024-06-01T14:00:00Z","durationMinutes":30,"status":"confirmed"},
                {"id":7,"chargerId":"C2","startTime":"2024-06-01T15:00:00Z","status":"pending"}]"#,
        )
        .unwrap();

        let source = JsonFileSource::new(&path);
        let records = source.fetch_snapshot(&scope(None)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].duration_minutes, Some(30));
        assert_eq!(records[1].id, "7");

        let missing = JsonFileSource::new(dir.join("nope.json"));
        let err = missing.fetch_snapshot(&scope(None)).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
