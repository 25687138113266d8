//! Typed error taxonomy for the engine. Library code returns `EngineError`
//! via `?`; adapters and the CLI edge use `anyhow` to report rather than
//! match on errors.

use serde::{Deserialize, Serialize};

use crate::span_algebra::QualityReport;

/// Machine-readable discriminant carried on every [`crate::model::Finding::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FetchFailed,
    InvalidInput,
    QualityRejected,
    InsufficientData,
    Internal,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum EngineError {
    #[error("fetch failed: {message}")]
    FetchFailed { transient: bool, message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("trace failed quality validation ({} issues)", report.issues.len())]
    QualityRejected { report: QualityReport },

    #[error("insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("internal error: {message}")]
    Internal { message: String, cancelled: bool },
}

impl EngineError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            EngineError::FetchFailed { .. } => ErrorKind::FetchFailed,
            EngineError::InvalidInput { .. } => ErrorKind::InvalidInput,
            EngineError::QualityRejected { .. } => ErrorKind::QualityRejected,
            EngineError::InsufficientData { .. } => ErrorKind::InsufficientData,
            EngineError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn cancelled() -> Self {
        EngineError::Internal {
            message: "operation cancelled".to_string(),
            cancelled: true,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn insufficient_data(message: impl Into<String>) -> Self {
        EngineError::InsufficientData {
            message: message.into(),
        }
    }
}

impl From<crate::source::SourceError> for EngineError {
    fn from(err: crate::source::SourceError) -> Self {
        use crate::source::SourceError::*;
        match err {
            NotFound { id } => EngineError::FetchFailed {
                transient: false,
                message: format!("trace not found: {id}"),
            },
            Unauthenticated | PermissionDenied => EngineError::FetchFailed {
                transient: false,
                message: err.to_string(),
            },
            Transient { message } => EngineError::FetchFailed {
                transient: true,
                message,
            },
            Malformed { message } => EngineError::FetchFailed {
                transient: false,
                message: format!("malformed trace record: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_maps_to_internal() {
        let err = EngineError::cancelled();
        assert_eq!(err.error_kind(), ErrorKind::Internal);
    }

    #[test]
    fn source_not_found_maps_to_fetch_failed() {
        let err: EngineError = crate::source::SourceError::NotFound { id: "x".into() }.into();
        assert_eq!(err.error_kind(), ErrorKind::FetchFailed);
    }
}
