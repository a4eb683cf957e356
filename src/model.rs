use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open overlap test on raw bounds. Both operands must satisfy `end > start`.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Only confirmed and in-progress bookings make a charger busy.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in-progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "in-progress" | "in_progress" | "inprogress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated booking as the engine tracks it. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingWindow {
    pub booking_id: String,
    pub charger_id: String,
    pub span: Span,
    pub status: BookingStatus,
}

impl BookingWindow {
    pub fn new(
        booking_id: impl Into<String>,
        charger_id: impl Into<String>,
        span: Span,
        status: BookingStatus,
    ) -> Self {
        Self {
            booking_id: booking_id.into(),
            charger_id: charger_id.into(),
            span,
            status,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransitionKind {
    // Declaration order matters: at equal instants a booking starting
    // is applied before one ending, so back-to-back handoffs never gap.
    BecomeBusy,
    BecomeFree,
}

/// Broadcast whenever a charger's busy flag flips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusyChange {
    pub charger_id: String,
    pub busy: bool,
    pub revision: u64,
    pub at: Ms,
}

/// All tracked bookings on one charger, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct ChargerTimeline {
    pub windows: Vec<BookingWindow>,
}

impl ChargerTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Insert window maintaining sort order by span.start.
    pub fn insert(&mut self, window: BookingWindow) {
        let pos = self
            .windows
            .partition_point(|w| w.span.start <= window.span.start);
        self.windows.insert(pos, window);
    }

    /// Remove window by booking id.
    pub fn remove(&mut self, booking_id: &str) -> Option<BookingWindow> {
        let pos = self.windows.iter().position(|w| w.booking_id == booking_id)?;
        Some(self.windows.remove(pos))
    }

    /// Return only windows whose span overlaps the query.
    /// Uses binary search to skip windows starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingWindow> {
        let right_bound = self.windows.partition_point(|w| w.span.start < query.end);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.span.end > query.start)
    }
}
