//! Connection error types.

use thiserror::Error;

/// Errors raised by transports and the connection manager.
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("performer returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("connection closed")]
    Closed,

    #[error("could not connect to {endpoint} after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        last: Box<ConnError>,
    },
}

impl ConnError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnError::Unavailable(_)
                | ConnError::Timeout(_)
                | ConnError::ResourceExhausted(_)
                | ConnError::Transport(_)
        )
    }
}

pub type ConnResult<T> = Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ConnError::Unavailable("refused".into()).is_retryable());
        assert!(ConnError::Timeout("connect".into()).is_retryable());
        assert!(ConnError::ResourceExhausted("busy".into()).is_retryable());
        assert!(ConnError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!ConnError::PermissionDenied("nope".into()).is_retryable());
        assert!(!ConnError::InvalidArgument("bad".into()).is_retryable());
        assert!(!ConnError::Protocol("garbage".into()).is_retryable());
        assert!(!ConnError::Closed.is_retryable());
        assert!(
            !ConnError::Remote {
                status: 500,
                message: "boom".into()
            }
            .is_retryable()
        );
    }
}
