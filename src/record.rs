//! Wire shapes consumed from the booking API and the push channel, and
//! their conversion into validated [`BookingWindow`]s.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::EngineConfig;
use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

/// Naive layouts accepted when a timestamp carries no offset. These are read
/// in the configured local offset.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A booking as the external booking API and push channel deliver it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    #[serde(alias = "bookingId", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(alias = "stationId", deserialize_with = "string_or_number")]
    pub charger_id: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    pub status: String,
}

/// Tagged message from the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    Created { booking: BookingRecord },
    Updated { booking: BookingRecord },
    #[serde(alias = "deleted")]
    Cancelled { booking: BookingRecord },
}

impl PushMessage {
    pub fn booking(&self) -> &BookingRecord {
        match self {
            PushMessage::Created { booking }
            | PushMessage::Updated { booking }
            | PushMessage::Cancelled { booking } => booking,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::Created { .. } => "created",
            PushMessage::Updated { .. } => "updated",
            PushMessage::Cancelled { .. } => "cancelled",
        }
    }

    /// Validate into a window. A `cancelled` message wins over whatever status
    /// its payload still carries.
    pub fn to_window(&self, config: &EngineConfig) -> Result<BookingWindow, EngineError> {
        let mut window = self.booking().to_window(config)?;
        if matches!(self, PushMessage::Cancelled { .. }) {
            window.status = BookingStatus::Cancelled;
        }
        Ok(window)
    }
}

impl BookingRecord {
    pub fn to_window(&self, config: &EngineConfig) -> Result<BookingWindow, EngineError> {
        let booking_id = validate_id(&self.id, "id")?;
        let charger_id = validate_id(&self.charger_id, "chargerId")?;
        let status: BookingStatus = self
            .status
            .parse()
            .map_err(|()| EngineError::UnknownStatus(self.status.clone()))?;

        let start = parse_timestamp(&self.start_time, config.utc_offset)?;
        let end = match (self.end_time.as_deref().map(str::trim), self.duration_minutes) {
            (Some(raw), _) if !raw.is_empty() => parse_timestamp(raw, config.utc_offset)?,
            (_, Some(minutes)) => minutes
                .checked_mul(60_000)
                .and_then(|d| start.checked_add(d))
                .ok_or(EngineError::LimitExceeded("duration out of range"))?,
            _ => start + config.default_duration_ms,
        };

        let span = Span::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
        validate_span(&span)?;
        Ok(BookingWindow {
            booking_id,
            charger_id,
            span,
            status,
        })
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

fn validate_id(raw: &str, field: &'static str) -> Result<String, EngineError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(EngineError::MissingField(field));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("id too long"));
    }
    Ok(id.to_string())
}

/// Parse an ISO-8601 timestamp into Unix ms. Offset-less values are read in `local`.
pub fn parse_timestamp(raw: &str, local: FixedOffset) -> Result<Ms, EngineError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt)
            && let Some(dt) = local.from_local_datetime(&naive).single()
        {
            return Ok(dt.timestamp_millis());
        }
    }
    Err(EngineError::BadTimestamp(raw.to_string()))
}

/// Ids arrive as strings from some backends and as integers from others.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    // 2024-06-01T00:00:00Z
    const DAY: Ms = 1_717_200_000_000;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn record(start: &str, end: Option<&str>, status: &str) -> BookingRecord {
        BookingRecord {
            id: "b1".into(),
            charger_id: "C1".into(),
            start_time: start.into(),
            end_time: end.map(Into::into),
            duration_minutes: None,
            status: status.into(),
        }
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(parse_timestamp("2024-06-01T14:00:00Z", utc), Ok(DAY + 14 * H));
        assert_eq!(
            parse_timestamp("2024-06-01T16:00:00+02:00", utc),
            Ok(DAY + 14 * H)
        );
        assert_eq!(
            parse_timestamp("2024-06-01T14:00:00.250Z", utc),
            Ok(DAY + 14 * H + 250)
        );
    }

    #[test]
    fn naive_timestamps_use_local_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(parse_timestamp("2024-06-01T16:00:00", plus_two), Ok(DAY + 14 * H));
        assert_eq!(parse_timestamp("2024-06-01T16:00", plus_two), Ok(DAY + 14 * H));
        assert_eq!(parse_timestamp("2024-06-01 16:00:00", plus_two), Ok(DAY + 14 * H));
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert!(matches!(
            parse_timestamp("tomorrow-ish", utc),
            Err(EngineError::BadTimestamp(_))
        ));
    }

    #[test]
    fn end_derived_from_duration() {
        let mut rec = record("2024-06-01T14:00:00Z", None, "confirmed");
        rec.duration_minutes = Some(45);
        let w = rec.to_window(&config()).unwrap();
        assert_eq!(w.span, Span::new(DAY + 14 * H, DAY + 14 * H + 45 * 60_000));
    }

    #[test]
    fn end_defaults_when_missing() {
        let rec = record("2024-06-01T14:00:00Z", Some(""), "pending");
        let w = rec.to_window(&config()).unwrap();
        assert_eq!(w.span.duration_ms(), config().default_duration_ms);
        assert_eq!(w.status, BookingStatus::Pending);
    }

    #[test]
    fn inverted_and_empty_windows_are_rejected() {
        let rec = record("2024-06-01T14:00:00Z", Some("2024-06-01T14:00:00Z"), "confirmed");
        assert!(matches!(
            rec.to_window(&config()),
            Err(EngineError::InvalidWindow { .. })
        ));
        let rec = record("2024-06-01T15:00:00Z", Some("2024-06-01T14:00:00Z"), "confirmed");
        assert!(matches!(
            rec.to_window(&config()),
            Err(EngineError::InvalidWindow { .. })
        ));
        let mut rec = record("2024-06-01T14:00:00Z", None, "confirmed");
        rec.duration_minutes = Some(0);
        assert!(matches!(
            rec.to_window(&config()),
            Err(EngineError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn unknown_status_and_blank_ids_are_rejected() {
        let rec = record("2024-06-01T14:00:00Z", None, "teleported");
        assert_eq!(
            rec.to_window(&config()),
            Err(EngineError::UnknownStatus("teleported".into()))
        );
        let mut rec = record("2024-06-01T14:00:00Z", None, "confirmed");
        rec.charger_id = "  ".into();
        assert_eq!(
            rec.to_window(&config()),
            Err(EngineError::MissingField("chargerId"))
        );
    }

    #[test]
    fn overlong_span_is_rejected() {
        let rec = record("2024-06-01T14:00:00Z", Some("2024-07-01T14:00:00Z"), "confirmed");
        assert_eq!(
            rec.to_window(&config()),
            Err(EngineError::LimitExceeded("span too wide"))
        );
    }

    #[test]
    fn push_message_decodes_from_json() {
        let raw = r#"{"type":"created","booking":{"id":42,"chargerId":"C1",
            "startTime":"2024-06-01T14:00:00Z","endTime":"2024-06-01T15:00:00Z",
            "status":"confirmed"}}"#;
        let msg: PushMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind(), "created");
        assert_eq!(msg.booking().id, "42");
        let w = msg.to_window(&config()).unwrap();
        assert_eq!(w.span, Span::new(DAY + 14 * H, DAY + 15 * H));
        assert!(w.is_active());
    }

    #[test]
    fn cancelled_message_overrides_payload_status() {
        let raw = r#"{"type":"deleted","booking":{"id":"b9","chargerId":"C1",
            "startTime":"2024-06-01T14:00:00Z","status":"confirmed"}}"#;
        let msg: PushMessage = serde_json::from_str(raw).unwrap();
        let w = msg.to_window(&config()).unwrap();
        assert_eq!(w.status, BookingStatus::Cancelled);
    }
}
