use std::collections::{BTreeMap, HashMap};

use crate::model::*;

/// Opaque handle for one scheduled transition. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTransition {
    pub booking_id: String,
    pub charger_id: String,
    pub kind: TransitionKind,
    pub fires_at: Ms,
    pub token: TimerToken,
}

/// What installing a window at `now` requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Inactive status or fully elapsed: make sure nothing contributes.
    Release,
    /// Window in the future: busy at start, free at end.
    Future { start: Ms, end: Ms },
    /// `now` inside the window: contribute immediately, free at end.
    ActiveUntil(Ms),
}

pub fn plan(window: &BookingWindow, now: Ms) -> Plan {
    let span = window.span;
    if !window.is_active() || now >= span.end {
        Plan::Release
    } else if now < span.start {
        Plan::Future {
            start: span.start,
            end: span.end,
        }
    } else {
        Plan::ActiveUntil(span.end)
    }
}

// Sorting by kind before token makes BecomeBusy fire ahead of BecomeFree
// at the same instant.
type QueueKey = (Ms, TransitionKind, TimerToken);

/// Deadline-ordered transition queue plus a registry of live tokens per booking.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<QueueKey, ScheduledTransition>,
    registry: HashMap<String, Vec<QueueKey>>,
    next_token: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        booking_id: &str,
        charger_id: &str,
        kind: TransitionKind,
        fires_at: Ms,
    ) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let key = (fires_at, kind, token);
        self.queue.insert(
            key,
            ScheduledTransition {
                booking_id: booking_id.to_string(),
                charger_id: charger_id.to_string(),
                kind,
                fires_at,
                token,
            },
        );
        self.registry
            .entry(booking_id.to_string())
            .or_default()
            .push(key);
        token
    }

    /// Revoke every pending transition of a booking. Returns how many were revoked.
    pub fn cancel(&mut self, booking_id: &str) -> usize {
        let Some(keys) = self.registry.remove(booking_id) else {
            return 0;
        };
        for key in &keys {
            self.queue.remove(key);
        }
        keys.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        self.registry.clear();
        n
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Ms> {
        self.queue.first_key_value().map(|((at, _, _), _)| *at)
    }

    /// Remove and return the earliest transition due at or before `now`.
    /// The registry is left alone; the caller must [`retire`](Self::retire) it.
    pub fn pop_due(&mut self, now: Ms) -> Option<ScheduledTransition> {
        let ((at, _, _), _) = self.queue.first_key_value()?;
        if *at > now {
            return None;
        }
        self.queue.pop_first().map(|(_, t)| t)
    }

    /// Drop a fired transition from the registry. Returns false when its token
    /// is no longer registered for the booking, i.e. it went stale.
    pub fn retire(&mut self, transition: &ScheduledTransition) -> bool {
        let Some(keys) = self.registry.get_mut(&transition.booking_id) else {
            return false;
        };
        let Some(pos) = keys.iter().position(|(_, _, t)| *t == transition.token) else {
            return false;
        };
        keys.swap_remove(pos);
        if keys.is_empty() {
            self.registry.remove(&transition.booking_id);
        }
        true
    }

    pub fn pending_for(&self, booking_id: &str) -> Vec<&ScheduledTransition> {
        let mut out: Vec<&ScheduledTransition> = self
            .registry
            .get(booking_id)
            .into_iter()
            .flatten()
            .filter_map(|key| self.queue.get(key))
            .collect();
        out.sort_by_key(|t| (t.fires_at, t.kind));
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
