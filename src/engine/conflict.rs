use crate::clock::start_of_local_day;
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::{Engine, SyncPhase};

const DAY_MS: Ms = 24 * 3_600_000;

impl Engine {
    /// Client-side fast path before submitting a booking. Never blocks on
    /// missing knowledge: while the snapshot loads, or for a malformed
    /// proposal, the answer is "no conflict known".
    pub fn has_conflict(&self, charger_id: &str, proposed_start: Ms, proposed_end: Ms) -> bool {
        !self
            .conflicts(charger_id, proposed_start, proposed_end)
            .is_empty()
    }

    /// Ids of tracked, non-cancelled bookings on the charger overlapping the proposal.
    pub fn conflicts(&self, charger_id: &str, proposed_start: Ms, proposed_end: Ms) -> Vec<String> {
        if self.phase != SyncPhase::Live {
            return Vec::new();
        }
        // Tracked windows all lie inside the valid range, so clamping keeps
        // every overlap and keeps the local-day math below in bounds.
        let Some(proposal) = Span::try_new(
            proposed_start.max(MIN_VALID_TIMESTAMP_MS),
            proposed_end.min(MAX_VALID_TIMESTAMP_MS),
        ) else {
            return Vec::new();
        };
        let Some(timeline) = self.timelines.get(charger_id) else {
            return Vec::new();
        };

        // Candidates are the bookings on the proposal's local day(s); the
        // exact half-open test then decides.
        let offset = self.config.utc_offset;
        let day_start = start_of_local_day(proposal.start, offset);
        let day_end = start_of_local_day(proposal.end - 1, offset) + DAY_MS;
        let days = Span::new(day_start, day_end.max(day_start + 1));

        timeline
            .overlapping(&days)
            .filter(|w| w.status != BookingStatus::Cancelled)
            .filter(|w| w.span.overlaps(&proposal))
            .map(|w| w.booking_id.clone())
            .collect()
    }
}
