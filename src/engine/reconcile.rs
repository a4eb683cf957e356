use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::limits::*;
use crate::model::*;
use crate::record::{BookingRecord, PushMessage, validate_span};
use crate::source::SnapshotScope;

use super::{ApplyOutcome, Engine, EngineError, SyncPhase};

/// What applying a snapshot did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub skipped_cancelled: usize,
    pub rejected: usize,
    /// Tracked bookings the baseline no longer lists.
    pub removed: usize,
    pub replayed: usize,
}

/// Input held back while the snapshot loads, replayed in arrival order.
#[derive(Debug, Clone)]
pub(super) enum PendingEvent {
    Push(PushMessage),
    /// Window applied by this client through [`Engine::apply_local`].
    Local(BookingWindow),
}

impl PendingEvent {
    fn booking_id(&self) -> &str {
        match self {
            PendingEvent::Push(message) => &message.booking().id,
            PendingEvent::Local(window) => &window.booking_id,
        }
    }
}

impl Engine {
    /// The single write path. Supersedes whatever is tracked for the booking id;
    /// re-delivery of an identical version is a no-op.
    pub fn apply_booking_event(
        &mut self,
        window: BookingWindow,
        now: Ms,
    ) -> Result<ApplyOutcome, EngineError> {
        check_window(&window)?;

        if self.tracked.get(&window.booking_id) == Some(&window) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if !self.tracked.contains_key(&window.booking_id)
            && self.tracked.len() >= MAX_TRACKED_BOOKINGS
        {
            return Err(EngineError::LimitExceeded("too many tracked bookings"));
        }

        debug!(
            booking = %window.booking_id,
            charger = %window.charger_id,
            status = %window.status,
            start = window.span.start,
            end = window.span.end,
            "installing booking window"
        );
        self.install(window, now);
        self.record_gauges();
        Ok(ApplyOutcome::Installed)
    }

    /// Apply a window this client produced itself (e.g. right after creating
    /// the booking). While the snapshot loads it is queued behind the live
    /// messages already buffered, so an older baseline row can't overwrite it.
    pub fn apply_local(
        &mut self,
        window: BookingWindow,
        now: Ms,
    ) -> Result<ApplyOutcome, EngineError> {
        if self.phase == SyncPhase::Loading {
            check_window(&window)?;
            self.buffer(PendingEvent::Local(window));
            return Ok(ApplyOutcome::Buffered);
        }
        self.apply_booking_event(window, now)
    }

    /// Entry point for push-channel messages. While the snapshot is loading the
    /// message is held back and `None` is returned; malformed records are
    /// recorded and skipped.
    pub fn ingest(&mut self, message: PushMessage, now: Ms) -> Option<ApplyOutcome> {
        if self.phase == SyncPhase::Loading {
            self.buffer(PendingEvent::Push(message));
            return None;
        }
        self.apply_message(&message, now, "live")
    }

    fn buffer(&mut self, event: PendingEvent) {
        if self.pending.len() >= MAX_PENDING_EVENTS {
            let dropped = self.pending.pop_front();
            warn!(
                booking = ?dropped.as_ref().map(PendingEvent::booking_id),
                "pending buffer full, dropping oldest live message"
            );
            metrics::counter!(crate::observability::PENDING_DROPPED_TOTAL).increment(1);
        }
        self.pending.push_back(event);
    }

    fn apply_message(
        &mut self,
        message: &PushMessage,
        now: Ms,
        source: &'static str,
    ) -> Option<ApplyOutcome> {
        let result = message
            .to_window(&self.config)
            .and_then(|window| self.apply_booking_event(window, now));
        self.count(result, message.booking().id.clone(), now, source)
    }

    fn count(
        &mut self,
        result: Result<ApplyOutcome, EngineError>,
        booking_id: String,
        now: Ms,
        source: &'static str,
    ) -> Option<ApplyOutcome> {
        match result {
            Ok(outcome) => {
                let label = match outcome {
                    ApplyOutcome::Installed => "installed",
                    ApplyOutcome::Duplicate => "duplicate",
                    ApplyOutcome::Buffered => "buffered",
                };
                metrics::counter!(
                    crate::observability::EVENTS_TOTAL,
                    "source" => source,
                    "outcome" => label
                )
                .increment(1);
                Some(outcome)
            }
            Err(e) => {
                self.reject(Some(booking_id), e, now);
                None
            }
        }
    }

    // ── Snapshot ─────────────────────────────────────────────

    /// Enter the loading phase: live messages are buffered from here on.
    pub fn begin_snapshot(&mut self) {
        if self.phase == SyncPhase::Live {
            info!("re-entering snapshot loading phase");
        }
        self.phase = SyncPhase::Loading;
    }

    /// Apply a baseline covering every charger from local midnight of `now`.
    pub fn complete_snapshot(&mut self, records: &[BookingRecord], now: Ms) -> SnapshotSummary {
        let scope = SnapshotScope::today(now, &self.config, None);
        self.complete_snapshot_in(records, &scope, now)
    }

    /// Apply the baseline fetched for `scope`, drop tracked bookings in scope
    /// that it no longer lists, then replay live messages that arrived
    /// meanwhile, in arrival order, then go live.
    pub fn complete_snapshot_in(
        &mut self,
        records: &[BookingRecord],
        scope: &SnapshotScope,
        now: Ms,
    ) -> SnapshotSummary {
        let mut summary = SnapshotSummary::default();
        let truncated = records.len() > MAX_SNAPSHOT_RECORDS;
        if truncated {
            warn!(
                total = records.len(),
                kept = MAX_SNAPSHOT_RECORDS,
                "snapshot truncated"
            );
        }
        let records = &records[..records.len().min(MAX_SNAPSHOT_RECORDS)];

        for record in records {
            let window = match record.to_window(&self.config) {
                Ok(w) => w,
                Err(e) => {
                    self.reject(Some(record.id.clone()), e, now);
                    summary.rejected += 1;
                    continue;
                }
            };
            // The snapshot is a list of live bookings; a cancelled row only
            // matters if it retires something already tracked.
            if window.status == BookingStatus::Cancelled
                && !self.tracked.contains_key(&window.booking_id)
            {
                summary.skipped_cancelled += 1;
                continue;
            }
            let result = self.apply_booking_event(window, now);
            match self.count(result, record.id.clone(), now, "snapshot") {
                Some(ApplyOutcome::Installed) => summary.applied += 1,
                Some(ApplyOutcome::Duplicate | ApplyOutcome::Buffered) => summary.duplicates += 1,
                None => summary.rejected += 1,
            }
        }

        // Whatever the baseline is authoritative for but doesn't list was
        // cancelled or deleted while we weren't listening. Rows that failed
        // to parse still count as listed; a truncated baseline proves nothing.
        let listed: HashSet<&str> = records.iter().map(|r| r.id.trim()).collect();
        let missing: Vec<String> = self
            .tracked
            .values()
            .filter(|_| !truncated)
            .filter(|w| scope.covers(w) && !listed.contains(w.booking_id.as_str()))
            .map(|w| w.booking_id.clone())
            .collect();
        for id in &missing {
            debug!(booking = %id, "not in snapshot, dropping");
            self.teardown(id, now);
        }
        summary.removed = missing.len();

        summary.replayed = self.go_live(now);
        self.degraded = false;
        self.record_gauges();
        info!(
            applied = summary.applied,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            removed = summary.removed,
            replayed = summary.replayed,
            "snapshot applied"
        );
        summary
    }

    /// Give up on the baseline: replay what arrived live and carry on without it.
    pub fn abandon_snapshot(&mut self, now: Ms) -> usize {
        let replayed = self.go_live(now);
        self.degraded = true;
        warn!(replayed, "snapshot unavailable, running on live events only");
        replayed
    }

    fn go_live(&mut self, now: Ms) -> usize {
        self.phase = SyncPhase::Live;
        let buffered = std::mem::take(&mut self.pending);
        let n = buffered.len();
        for event in buffered {
            match event {
                PendingEvent::Push(message) => {
                    self.apply_message(&message, now, "replay");
                }
                PendingEvent::Local(window) => {
                    let id = window.booking_id.clone();
                    let result = self.apply_booking_event(window, now);
                    self.count(result, id, now, "replay");
                }
            }
        }
        n
    }

    // ── Teardown ─────────────────────────────────────────────

    /// Stop tracking one booking. Returns false if it wasn't tracked.
    pub fn remove_booking(&mut self, booking_id: &str, now: Ms) -> bool {
        let removed = self.teardown(booking_id, now).is_some();
        self.record_gauges();
        removed
    }

    /// Cancel every timer and drop all derived state.
    pub fn shutdown(&mut self, now: Ms) {
        let timers = self.scheduler.cancel_all();
        let bookings = self.tracked.len();
        self.tracked.clear();
        self.timelines.clear();
        self.pending.clear();
        for charger in self.store.clear() {
            self.publish(&charger, false, now);
        }
        self.record_gauges();
        info!(timers, bookings, "engine torn down");
    }
}

fn check_window(window: &BookingWindow) -> Result<(), EngineError> {
    if window.span.end <= window.span.start {
        return Err(EngineError::InvalidWindow {
            start: window.span.start,
            end: window.span.end,
        });
    }
    if window.booking_id.is_empty() {
        return Err(EngineError::MissingField("id"));
    }
    if window.charger_id.is_empty() {
        return Err(EngineError::MissingField("chargerId"));
    }
    if window.booking_id.len() > MAX_ID_LEN || window.charger_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("id too long"));
    }
    validate_span(&window.span)
}
