use thiserror::Error;
use uuid::Uuid;

/// Why an inbound sensor payload was refused. Always names the offending field
/// when there is one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{field} is not an ISO-8601 timestamp: {value}")]
    BadTimestamp { field: &'static str, value: String },
}

impl ValidationError {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::Missing { field }
            | ValidationError::WrongType { field, .. }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::BadTimestamp { field, .. } => Some(field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter {field}: {reason}")]
pub struct InvalidFilterError {
    pub field: &'static str,
    pub reason: String,
}

impl InvalidFilterError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("reading store unavailable: {message}")]
pub struct StoreUnavailableError {
    message: String,
    #[source]
    source: Option<sqlx::Error>,
}

impl StoreUnavailableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl From<sqlx::Error> for StoreUnavailableError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidFilter(#[from] InvalidFilterError),
    #[error(transparent)]
    Unavailable(#[from] StoreUnavailableError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Unavailable(#[from] StoreUnavailableError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("subscriber {subscriber} on {channel} fell behind and lost {skipped} readings")]
    Lagged {
        subscriber: Uuid,
        channel: String,
        skipped: u64,
    },
    #[error("channel {channel} closed")]
    Closed { channel: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_name_their_field() {
        let err = ValidationError::OutOfRange {
            field: "humidity",
            min: 0.0,
            max: 100.0,
            value: 150.0,
        };
        assert_eq!(err.field(), Some("humidity"));
        assert!(err.to_string().contains("humidity"));
        assert_eq!(ValidationError::Malformed("eof".into()).field(), None);
    }

    #[test]
    fn query_error_wraps_filter_problems() {
        let err: QueryError = InvalidFilterError::new("limit", "must be at most 1000").into();
        assert!(matches!(err, QueryError::InvalidFilter(ref inner) if inner.field == "limit"));
        assert_eq!(err.to_string(), "invalid filter limit: must be at most 1000");
    }
}
