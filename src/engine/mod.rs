mod conflict;
mod error;
mod reconcile;
pub mod scheduler;
pub mod store;

pub use error::EngineError;
pub use reconcile::SnapshotSummary;

use reconcile::PendingEvent;
pub use scheduler::{Plan, ScheduledTransition, Scheduler, TimerToken};
pub use store::{BusyStore, ChargerBusyEntry};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;

use scheduler::plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Baseline snapshot not applied yet; live messages are held back.
    Loading,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Installed,
    /// Identical to the tracked version; nothing changed.
    Duplicate,
    /// Held until the snapshot lands, then applied in arrival order.
    Buffered,
}

/// A record turned away at the boundary, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub booking_id: Option<String>,
    pub error: EngineError,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub phase: SyncPhase,
    pub degraded: bool,
    pub revision: u64,
    pub tracked: usize,
    pub timers: usize,
    pub busy_chargers: usize,
    pub pending: usize,
    pub rejected_total: u64,
    pub next_deadline: Option<Ms>,
}

/// Client-local availability cache. Single owner, no interior locking: all
/// input goes through [`Engine::apply_booking_event`] / [`Engine::ingest`],
/// time moves forward through [`Engine::advance`].
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) store: BusyStore,
    pub(super) scheduler: Scheduler,
    /// Latest applied version per booking id.
    pub(super) tracked: HashMap<String, BookingWindow>,
    /// Same windows indexed by charger for conflict queries.
    pub(super) timelines: HashMap<String, ChargerTimeline>,
    pub(super) phase: SyncPhase,
    pub(super) degraded: bool,
    pending: VecDeque<PendingEvent>,
    pub(super) rejections: VecDeque<Rejection>,
    pub(super) rejected_total: u64,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(config: EngineConfig, notify: Arc<NotifyHub>) -> Self {
        Self {
            config,
            store: BusyStore::new(),
            scheduler: Scheduler::new(),
            tracked: HashMap::new(),
            timelines: HashMap::new(),
            phase: SyncPhase::Loading,
            degraded: false,
            pending: VecDeque::new(),
            rejections: VecDeque::new(),
            rejected_total: 0,
            notify,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Reads ────────────────────────────────────────────────

    /// Fail-open: unknown chargers, and every charger before the snapshot
    /// lands, read as free.
    pub fn is_busy(&self, charger_id: &str) -> bool {
        self.store.is_busy(charger_id)
    }

    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn snapshot_degraded(&self) -> bool {
        self.degraded
    }

    pub fn busy_chargers(&self) -> Vec<String> {
        self.store.busy_chargers()
    }

    pub fn contributors(&self, charger_id: &str) -> Vec<String> {
        self.store.contributors(charger_id)
    }

    pub fn tracked(&self, booking_id: &str) -> Option<&BookingWindow> {
        self.tracked.get(booking_id)
    }

    /// Tracked windows on a charger, sorted by start.
    pub fn bookings_for(&self, charger_id: &str) -> Vec<BookingWindow> {
        self.timelines
            .get(charger_id)
            .map(|tl| tl.windows.clone())
            .unwrap_or_default()
    }

    pub fn pending_transitions(&self, booking_id: &str) -> Vec<ScheduledTransition> {
        self.scheduler
            .pending_for(booking_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Ms> {
        self.scheduler.next_deadline()
    }

    pub fn recent_rejections(&self) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            phase: self.phase,
            degraded: self.degraded,
            revision: self.store.revision(),
            tracked: self.tracked.len(),
            timers: self.scheduler.len(),
            busy_chargers: self.store.busy_chargers().len(),
            pending: self.pending.len(),
            rejected_total: self.rejected_total,
            next_deadline: self.scheduler.next_deadline(),
        }
    }

    // ── Time ─────────────────────────────────────────────────

    /// Fire every transition due at or before `now`. Returns how many changed
    /// contribution state.
    pub fn advance(&mut self, now: Ms) -> usize {
        let mut applied = 0;
        while let Some(transition) = self.scheduler.pop_due(now) {
            let ok = self.fire(&transition, now);
            metrics::counter!(
                crate::observability::TRANSITIONS_FIRED_TOTAL,
                "kind" => kind_label(transition.kind),
                "applied" => if ok { "true" } else { "false" }
            )
            .increment(1);
            if ok {
                applied += 1;
            }
        }
        self.record_gauges();
        applied
    }

    /// Re-validate a popped transition against current state before touching the store.
    fn fire(&mut self, transition: &ScheduledTransition, now: Ms) -> bool {
        if !self.scheduler.retire(transition) {
            debug!(booking = %transition.booking_id, "stale transition ignored");
            return false;
        }
        let Some(window) = self.tracked.get(&transition.booking_id) else {
            return false;
        };
        if window.charger_id != transition.charger_id || !window.is_active() {
            return false;
        }
        match transition.kind {
            TransitionKind::BecomeBusy => {
                // Fired at or past the end (suspended process, clock jump):
                // the window is already over, don't light it up.
                if now >= window.span.end {
                    debug!(booking = %transition.booking_id, "late activation skipped");
                    return false;
                }
                let (charger, booking) = (window.charger_id.clone(), window.booking_id.clone());
                self.mark(&charger, &booking, now);
            }
            TransitionKind::BecomeFree => {
                let (charger, booking) = (window.charger_id.clone(), window.booking_id.clone());
                self.unmark(&charger, &booking, now);
            }
        }
        true
    }

    /// Re-derive every tracked booking against `now`. Absorbs wall-clock
    /// jumps in either direction; flags only flip where the outcome differs.
    pub fn resync(&mut self, now: Ms) {
        let windows: Vec<BookingWindow> = self.tracked.values().cloned().collect();
        for window in windows {
            self.install(window, now);
        }
        self.advance(now);
    }

    /// Forget windows that ended at or before `cutoff`. Their timers have
    /// all fired, so only conflict lookups lose them.
    pub fn prune_before(&mut self, cutoff: Ms) -> usize {
        let stale: Vec<String> = self
            .tracked
            .values()
            .filter(|w| w.span.end <= cutoff && self.scheduler.pending_for(&w.booking_id).is_empty())
            .map(|w| w.booking_id.clone())
            .collect();
        for id in &stale {
            self.untrack(id);
        }
        self.record_gauges();
        stale.len()
    }

    // ── Internal state transitions ───────────────────────────

    /// Replace whatever is tracked for `window.booking_id` with `window`.
    /// Old timers are revoked before new ones go in; the old contribution is
    /// only dropped where the new version doesn't keep it, so an update that
    /// leaves a booking active never flickers the charger free.
    pub(super) fn install(&mut self, window: BookingWindow, now: Ms) {
        self.scheduler.cancel(&window.booking_id);
        if let Some(old) = self.untrack(&window.booking_id)
            && old.charger_id != window.charger_id
        {
            self.unmark(&old.charger_id, &old.booking_id, now);
        }

        let (charger, booking) = (window.charger_id.clone(), window.booking_id.clone());
        match plan(&window, now) {
            Plan::Release => {
                self.unmark(&charger, &booking, now);
            }
            Plan::Future { start, end } => {
                self.unmark(&charger, &booking, now);
                self.scheduler
                    .schedule(&booking, &charger, TransitionKind::BecomeBusy, start);
                self.scheduler
                    .schedule(&booking, &charger, TransitionKind::BecomeFree, end);
            }
            Plan::ActiveUntil(end) => {
                self.mark(&charger, &booking, now);
                self.scheduler
                    .schedule(&booking, &charger, TransitionKind::BecomeFree, end);
            }
        }
        self.track(window);
    }

    /// Revoke timers, drop the contribution, forget the booking.
    pub(super) fn teardown(&mut self, booking_id: &str, now: Ms) -> Option<BookingWindow> {
        self.scheduler.cancel(booking_id);
        let old = self.untrack(booking_id)?;
        self.unmark(&old.charger_id, &old.booking_id, now);
        Some(old)
    }

    fn track(&mut self, window: BookingWindow) {
        self.timelines
            .entry(window.charger_id.clone())
            .or_default()
            .insert(window.clone());
        self.tracked.insert(window.booking_id.clone(), window);
    }

    fn untrack(&mut self, booking_id: &str) -> Option<BookingWindow> {
        let old = self.tracked.remove(booking_id)?;
        if let Some(tl) = self.timelines.get_mut(&old.charger_id) {
            tl.remove(booking_id);
            if tl.is_empty() {
                self.timelines.remove(&old.charger_id);
            }
        }
        Some(old)
    }

    fn mark(&mut self, charger_id: &str, booking_id: &str, now: Ms) {
        if self.store.mark_contributing(charger_id, booking_id) {
            self.publish(charger_id, true, now);
        }
    }

    fn unmark(&mut self, charger_id: &str, booking_id: &str, now: Ms) {
        if self.store.unmark_contributing(charger_id, booking_id) {
            self.publish(charger_id, false, now);
        }
    }

    pub(super) fn publish(&self, charger_id: &str, busy: bool, now: Ms) {
        debug!(charger = charger_id, busy, revision = self.store.revision(), "busy flag changed");
        metrics::counter!(crate::observability::BUSY_CHANGES_TOTAL).increment(1);
        self.notify.send(&BusyChange {
            charger_id: charger_id.to_string(),
            busy,
            revision: self.store.revision(),
            at: now,
        });
    }

    pub(super) fn reject(&mut self, booking_id: Option<String>, error: EngineError, now: Ms) {
        tracing::warn!(booking = ?booking_id, reason = error.reason(), "rejected booking record: {error}");
        metrics::counter!(
            crate::observability::EVENTS_REJECTED_TOTAL,
            "reason" => error.reason()
        )
        .increment(1);
        self.rejected_total += 1;
        if self.rejections.len() >= MAX_RECENT_REJECTIONS {
            self.rejections.pop_front();
        }
        self.rejections.push_back(Rejection {
            booking_id,
            error,
            at: now,
        });
    }

    pub(super) fn record_gauges(&self) {
        metrics::gauge!(crate::observability::BOOKINGS_TRACKED).set(self.tracked.len() as f64);
        metrics::gauge!(crate::observability::TIMERS_PENDING).set(self.scheduler.len() as f64);
        metrics::gauge!(crate::observability::CHARGERS_BUSY)
            .set(self.store.busy_chargers().len() as f64);
    }
}

fn kind_label(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::BecomeBusy => "become_busy",
        TransitionKind::BecomeFree => "become_free",
    }
}
