//! Error classification shared across Ember crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::epoch_secs;

/// Result type alias for resource-client calls.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Failure of a call against an external control plane.
///
/// The split decides what the lifecycle does next: transient failures are
/// retried with backoff, permanent ones fail the step immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Network trouble, throttling, timeouts. Safe to retry.
    #[error("transient resource error: {0}")]
    Transient(String),

    /// Authorization, missing resources, invalid parameters. Needs an operator.
    #[error("permanent resource error: {0}")]
    Permanent(String),
}

impl ResourceError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The user-visible kind this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientResource,
            Self::Permanent(_) => ErrorKind::PermanentResource,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// User-visible error classification reported by `status()` and the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientResource,
    PermanentResource,
    NotReady,
    StreamInterrupted,
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientResource => "transient_resource",
            ErrorKind::PermanentResource => "permanent_resource",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// The most recent lifecycle error, kept until a later step succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Unix timestamp (seconds) when the error was recorded.
    pub at: u64,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: epoch_secs(),
        }
    }
}

impl From<&ResourceError> for ErrorRecord {
    fn from(err: &ResourceError) -> Self {
        ErrorRecord::new(err.kind(), err.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_kinds() {
        assert_eq!(
            ResourceError::transient("throttled").kind(),
            ErrorKind::TransientResource
        );
        assert_eq!(
            ResourceError::permanent("AccessDenied").kind(),
            ErrorKind::PermanentResource
        );
        assert!(ResourceError::transient("x").is_transient());
        assert!(!ResourceError::permanent("x").is_transient());
    }

    #[test]
    fn error_record_from_resource_error() {
        let err = ResourceError::permanent("cluster not found");
        let record = ErrorRecord::from(&err);
        assert_eq!(record.kind, ErrorKind::PermanentResource);
        assert_eq!(record.message, "cluster not found");
        assert!(record.at > 0);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StreamInterrupted).unwrap();
        assert_eq!(json, "\"stream_interrupted\"");
    }
}
