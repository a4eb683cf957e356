use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};

use crate::model::Ms;

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> Ms;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Wall time derived from tokio's monotonic clock, anchored at construction.
/// Follows `tokio::time::pause`/`advance`, which makes timer-driven tests
/// deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_ms: Ms,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor_ms: Ms) -> Self {
        Self {
            anchor_ms,
            anchor: tokio::time::Instant::now(),
        }
    }

    pub fn from_wall() -> Self {
        Self::starting_at(WallClock.now_ms())
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> Ms {
        self.anchor_ms + self.anchor.elapsed().as_millis() as Ms
    }
}

/// Calendar date of `ms` as seen in `offset`.
pub fn local_date(ms: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&offset).date_naive())
}

/// Local midnight of the day containing `ms`.
pub fn start_of_local_day(ms: Ms, offset: FixedOffset) -> Ms {
    local_date(ms, offset)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    // 2024-06-01T00:00:00Z
    const DAY: Ms = 1_717_200_000_000;

    #[test]
    fn local_date_respects_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_three = FixedOffset::east_opt(3 * 3600).unwrap();
        let late = DAY + 22 * H;
        assert_eq!(local_date(late, utc), NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(local_date(late, plus_three), NaiveDate::from_ymd_opt(2024, 6, 2));
    }

    #[test]
    fn start_of_day_in_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(start_of_local_day(DAY + 14 * H, utc), DAY);
        // 02:00Z is still the previous evening at -05:00.
        assert_eq!(start_of_local_day(DAY + 2 * H, minus_five), DAY - 19 * H);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(DAY);
        assert_eq!(clock.now_ms(), DAY);
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now_ms(), DAY + 90_000);
    }
}
