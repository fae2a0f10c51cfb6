//! Pipeline and ingest errors.

use cascade_kernel::{ConfigError, EngineError, StageError};
use thiserror::Error;

/// Result alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by [`crate::EngagementPipeline`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Engine rejected the operation
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Reference data could not be fingerprinted
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Reference data contained the same key twice
    #[error("duplicate key {key} in {table}")]
    DuplicateKey {
        /// Table being loaded
        table: &'static str,
        /// Repeated key
        key: String,
    },

    /// The singleton dashboard row is missing
    #[error("dashboard has not been computed yet")]
    DashboardUnavailable,
}

/// Why a single ingest record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// A required field is absent or blank
    #[error("missing required field {field}")]
    MissingField {
        /// Field name
        field: String,
    },

    /// The event type is not one of the known kinds
    #[error("unknown event type {value:?}")]
    UnknownEventType {
        /// Raw value
        value: String,
    },

    /// The timestamp is not RFC 3339
    #[error("unparseable timestamp {value:?}")]
    InvalidTimestamp {
        /// Raw value
        value: String,
    },

    /// Engagement seconds below zero
    #[error("negative engagement seconds {value}")]
    NegativeEngagement {
        /// Raw value
        value: i64,
    },

    /// Engagement seconds above [`crate::ingest::MAX_ENGAGEMENT_SECONDS`]
    #[error("engagement seconds {value} out of range")]
    EngagementOutOfRange {
        /// Raw value
        value: i64,
    },
}

impl RejectReason {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }

    /// Stable short code used for counting rejects
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::UnknownEventType { .. } => "unknown_event_type",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::NegativeEngagement { .. } => "negative_engagement",
            Self::EngagementOutOfRange { .. } => "engagement_out_of_range",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_pass_through() {
        let err: PipelineError = EngineError::UnknownTable("nope".into()).into();
        assert_eq!(err.to_string(), "unknown table: nope");
    }

    #[test]
    fn reject_reasons_have_codes_and_messages() {
        let reason = RejectReason::missing("session_id");
        assert_eq!(reason.code(), "missing_field");
        assert_eq!(reason.to_string(), "missing required field session_id");

        let json = serde_json::to_string(&RejectReason::NegativeEngagement { value: -3 }).unwrap();
        assert_eq!(json, r#"{"reason":"negative_engagement","value":-3}"#);

        let too_long = RejectReason::EngagementOutOfRange { value: i64::MAX };
        assert_eq!(too_long.code(), "engagement_out_of_range");
        assert_eq!(
            too_long.to_string(),
            format!("engagement seconds {} out of range", i64::MAX)
        );
    }
}
