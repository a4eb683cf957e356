use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidWindow { start: Ms, end: Ms },
    BadTimestamp(String),
    UnknownStatus(String),
    MissingField(&'static str),
    LimitExceeded(&'static str),
    Source(String),
    EngineClosed,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid booking window [{start}, {end}): end must be after start")
            }
            EngineError::BadTimestamp(raw) => write!(f, "unparsable timestamp: {raw:?}"),
            EngineError::UnknownStatus(raw) => write!(f, "unknown booking status: {raw:?}"),
            EngineError::MissingField(name) => write!(f, "missing field: {name}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Source(e) => write!(f, "snapshot source error: {e}"),
            EngineError::EngineClosed => write!(f, "engine has shut down"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow { .. } => "invalid_window",
            EngineError::BadTimestamp(_) => "bad_timestamp",
            EngineError::UnknownStatus(_) => "unknown_status",
            EngineError::MissingField(_) => "missing_field",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Source(_) => "source",
            EngineError::EngineClosed => "closed",
        }
    }
}
