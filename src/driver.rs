//! Async owner of an [`Engine`]: one task serializes push messages, reads,
//! snapshot results and timer wake-ups, so the engine itself never needs a lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::clock::{Clock, start_of_local_day};
use crate::config::DriverConfig;
use crate::engine::{ApplyOutcome, Engine, EngineError, EngineStatus};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::record::{BookingRecord, PushMessage};
use crate::source::{BookingSource, SnapshotScope, SourceError, fetch_with_retry};

/// Wall clock and monotonic clock disagreeing by more than this means the
/// wall clock was stepped; everything is re-derived.
const DRIFT_TOLERANCE_MS: Ms = 2_000;

enum Command {
    Push(PushMessage),
    Apply {
        window: BookingWindow,
        response: oneshot::Sender<Result<ApplyOutcome, EngineError>>,
    },
    Remove {
        booking_id: String,
        response: oneshot::Sender<bool>,
    },
    IsBusy {
        charger_id: String,
        response: oneshot::Sender<bool>,
    },
    Revision {
        response: oneshot::Sender<u64>,
    },
    Conflicts {
        charger_id: String,
        span: (Ms, Ms),
        response: oneshot::Sender<Vec<String>>,
    },
    BusyChargers {
        response: oneshot::Sender<Vec<String>>,
    },
    Status {
        response: oneshot::Sender<EngineStatus>,
    },
    RefreshSnapshot,
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

struct SnapshotResult {
    generation: u64,
    scope: SnapshotScope,
    started: Instant,
    result: Result<Vec<BookingRecord>, SourceError>,
}

/// Cloneable front door to a running driver. Reads are total: once the
/// driver is gone they return the fail-open defaults.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    notify: Arc<NotifyHub>,
}

impl EngineHandle {
    /// Queue a push-channel message.
    pub async fn push(&self, message: PushMessage) -> Result<(), EngineError> {
        self.tx
            .send(Command::Push(message))
            .await
            .map_err(|_| EngineError::EngineClosed)
    }

    /// Apply a window this client produced, e.g. right after creating the
    /// booking. During a snapshot load it is queued behind earlier live
    /// messages and applied after the baseline (`Ok(ApplyOutcome::Buffered)`).
    pub async fn apply(&self, window: BookingWindow) -> Result<ApplyOutcome, EngineError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply { window, response })
            .await
            .map_err(|_| EngineError::EngineClosed)?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    pub async fn remove(&self, booking_id: &str) -> bool {
        self.ask(|response| Command::Remove {
            booking_id: booking_id.to_string(),
            response,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn is_busy(&self, charger_id: &str) -> bool {
        self.ask(|response| Command::IsBusy {
            charger_id: charger_id.to_string(),
            response,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn revision(&self) -> u64 {
        self.ask(|response| Command::Revision { response })
            .await
            .unwrap_or(0)
    }

    pub async fn has_conflict(&self, charger_id: &str, start: Ms, end: Ms) -> bool {
        !self.conflicts(charger_id, start, end).await.is_empty()
    }

    pub async fn conflicts(&self, charger_id: &str, start: Ms, end: Ms) -> Vec<String> {
        self.ask(|response| Command::Conflicts {
            charger_id: charger_id.to_string(),
            span: (start, end),
            response,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn busy_chargers(&self) -> Vec<String> {
        self.ask(|response| Command::BusyChargers { response })
            .await
            .unwrap_or_default()
    }

    /// `None` once the driver has stopped.
    pub async fn status(&self) -> Option<EngineStatus> {
        self.ask(|response| Command::Status { response }).await
    }

    /// Fetch a fresh baseline (e.g. after the push channel reconnects).
    pub async fn refresh_snapshot(&self) -> Result<(), EngineError> {
        self.tx
            .send(Command::RefreshSnapshot)
            .await
            .map_err(|_| EngineError::EngineClosed)
    }

    /// Tear down: every pending timer is cancelled before this returns.
    pub async fn shutdown(&self) {
        let _ = self.ask(|response| Command::Shutdown { response }).await;
    }

    pub fn subscribe(&self, charger_id: &str) -> broadcast::Receiver<BusyChange> {
        self.notify.subscribe(charger_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BusyChange> {
        self.notify.subscribe_all()
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (response, rx) = oneshot::channel();
        self.tx.send(make(response)).await.ok()?;
        rx.await.ok()
    }
}

pub struct Driver<C: Clock> {
    engine: Engine,
    clock: C,
    config: DriverConfig,
    source: Arc<dyn BookingSource>,
    charger_ids: Option<Vec<String>>,
    rx: mpsc::Receiver<Command>,
    snapshot_tx: mpsc::Sender<SnapshotResult>,
    snapshot_rx: mpsc::Receiver<SnapshotResult>,
    snapshot_task: Option<JoinHandle<()>>,
    snapshot_generation: u64,
    // Wall/monotonic pair from the last loop turn, for drift detection.
    last_wall: Ms,
    last_mono: Instant,
    last_resync: Instant,
}

/// Start a driver task. The snapshot fetch begins immediately; live messages
/// pushed before it lands are buffered by the engine.
pub fn spawn<C: Clock>(
    config: DriverConfig,
    clock: C,
    source: Arc<dyn BookingSource>,
    charger_ids: Option<Vec<String>>,
) -> (EngineHandle, JoinHandle<()>) {
    let notify = Arc::new(NotifyHub::new());
    let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
    let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
    let now = clock.now_ms();

    let driver = Driver {
        engine: Engine::new(config.engine.clone(), notify.clone()),
        clock,
        config,
        source,
        charger_ids,
        rx,
        snapshot_tx,
        snapshot_rx,
        snapshot_task: None,
        snapshot_generation: 0,
        last_wall: now,
        last_mono: Instant::now(),
        last_resync: Instant::now(),
    };
    let task = tokio::spawn(driver.run());
    (EngineHandle { tx, notify }, task)
}

impl<C: Clock> Driver<C> {
    async fn run(mut self) {
        self.start_snapshot();

        loop {
            let now = self.tick();
            let sleep_for = self.sleep_duration(now);

            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("all engine handles dropped");
                        break;
                    };
                    if !self.handle(cmd) {
                        break;
                    }
                }
                Some(result) = self.snapshot_rx.recv() => {
                    self.finish_snapshot(result);
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        let now = self.clock.now_ms();
        self.engine.shutdown(now);
    }

    /// Read the clock, absorb drift, fire due transitions.
    fn tick(&mut self) -> Ms {
        let now = self.clock.now_ms();
        let mono = Instant::now();
        let expected = self.last_wall + mono.duration_since(self.last_mono).as_millis() as Ms;
        let drift = now - expected;

        if drift.abs() > DRIFT_TOLERANCE_MS {
            warn!(drift_ms = drift, "wall clock jumped, re-deriving busy state");
            self.resync(now, mono);
        } else if mono.duration_since(self.last_resync) >= self.config.resync_interval {
            self.resync(now, mono);
        } else {
            self.engine.advance(now);
        }

        self.last_wall = now;
        self.last_mono = mono;
        now
    }

    fn resync(&mut self, now: Ms, mono: Instant) {
        self.engine.resync(now);
        let cutoff = start_of_local_day(now, self.engine.config().utc_offset);
        let pruned = self.engine.prune_before(cutoff);
        if pruned > 0 {
            info!(pruned, "dropped bookings that ended before today");
        }
        self.engine.notify.prune();
        self.last_resync = mono;
    }

    fn sleep_duration(&self, now: Ms) -> Duration {
        let until_resync = self
            .config
            .resync_interval
            .saturating_sub(self.last_resync.elapsed());
        match self.engine.next_deadline() {
            Some(at) => Duration::from_millis((at - now).max(0) as u64).min(until_resync),
            None => until_resync,
        }
    }

    /// Returns false when the loop should stop.
    fn handle(&mut self, cmd: Command) -> bool {
        let now = self.clock.now_ms();
        self.engine.advance(now);

        match cmd {
            Command::Push(message) => {
                self.engine.ingest(message, now);
            }
            Command::Apply { window, response } => {
                let result = self.engine.apply_local(window, now);
                if let Err(ref e) = result {
                    warn!("apply rejected: {e}");
                }
                let _ = response.send(result);
            }
            Command::Remove {
                booking_id,
                response,
            } => {
                let _ = response.send(self.engine.remove_booking(&booking_id, now));
            }
            Command::IsBusy {
                charger_id,
                response,
            } => {
                let _ = response.send(self.engine.is_busy(&charger_id));
            }
            Command::Revision { response } => {
                let _ = response.send(self.engine.revision());
            }
            Command::Conflicts {
                charger_id,
                span: (start, end),
                response,
            } => {
                let _ = response.send(self.engine.conflicts(&charger_id, start, end));
            }
            Command::BusyChargers { response } => {
                let _ = response.send(self.engine.busy_chargers());
            }
            Command::Status { response } => {
                let _ = response.send(self.engine.status());
            }
            Command::RefreshSnapshot => self.start_snapshot(),
            Command::Shutdown { response } => {
                if let Some(task) = self.snapshot_task.take() {
                    task.abort();
                }
                self.engine.shutdown(now);
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    fn start_snapshot(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        self.snapshot_generation += 1;
        self.engine.begin_snapshot();

        let scope = SnapshotScope::today(
            self.clock.now_ms(),
            self.engine.config(),
            self.charger_ids.clone(),
        );
        let source = self.source.clone();
        let retry = self.config.retry.clone();
        let tx = self.snapshot_tx.clone();
        let generation = self.snapshot_generation;
        let started = Instant::now();

        info!(generation, from = scope.from, "fetching booking snapshot");
        self.snapshot_task = Some(tokio::spawn(async move {
            let result = fetch_with_retry(source, scope.clone(), retry).await;
            let _ = tx
                .send(SnapshotResult {
                    generation,
                    scope,
                    started,
                    result,
                })
                .await;
        }));
    }

    fn finish_snapshot(&mut self, snapshot: SnapshotResult) {
        if snapshot.generation != self.snapshot_generation {
            // Superseded by a later refresh.
            return;
        }
        self.snapshot_task = None;
        let now = self.clock.now_ms();
        self.engine.advance(now);
        match snapshot.result {
            Ok(records) => {
                self.engine.complete_snapshot_in(&records, &snapshot.scope, now);
            }
            Err(e) => {
                error!("booking snapshot failed: {e}");
                self.engine.abandon_snapshot(now);
            }
        }
        metrics::histogram!(crate::observability::SNAPSHOT_DURATION_SECONDS)
            .record(snapshot.started.elapsed().as_secs_f64());
    }
}
