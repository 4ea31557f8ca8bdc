use std::time::Duration;

use thiserror::Error;

use ember_core::{ErrorKind, LifecycleState};

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The lifecycle cannot serve this call right now. No request was sent.
    #[error("executor not ready (state: {state})")]
    NotReady { state: LifecycleState },

    /// The upstream stream ended or failed before its final record.
    #[error("executor stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The executor answered with a non-success status.
    #[error("executor returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The executor reported an error inside an otherwise healthy stream.
    #[error("executor error: {0}")]
    Engine(String),

    #[error("malformed executor response: {0}")]
    Malformed(String),

    #[error("cannot reach executor at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("executor did not answer within {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    /// The user-visible kind this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::NotReady { .. } => ErrorKind::NotReady,
            ProxyError::StreamInterrupted(_) => ErrorKind::StreamInterrupted,
            ProxyError::Timeout(_) => ErrorKind::Timeout,
            ProxyError::Upstream { status, .. } if *status >= 500 => ErrorKind::TransientResource,
            ProxyError::Connect { .. } => ErrorKind::TransientResource,
            ProxyError::Upstream { .. } | ProxyError::Engine(_) | ProxyError::Malformed(_) => {
                ErrorKind::PermanentResource
            }
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, ProxyError::NotReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let not_ready = ProxyError::NotReady {
            state: LifecycleState::Stopped,
        };
        assert_eq!(not_ready.kind(), ErrorKind::NotReady);
        assert!(not_ready.is_not_ready());
        assert_eq!(not_ready.to_string(), "executor not ready (state: stopped)");

        let busy = ProxyError::Upstream {
            status: 503,
            body: "loading".into(),
        };
        assert_eq!(busy.kind(), ErrorKind::TransientResource);

        let missing = ProxyError::Upstream {
            status: 404,
            body: "model not found".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::PermanentResource);

        assert_eq!(
            ProxyError::StreamInterrupted("reset".into()).kind(),
            ErrorKind::StreamInterrupted
        );
    }
}
