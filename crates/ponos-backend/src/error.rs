//! Backend error types.

use std::time::Duration;

use thiserror::Error;

use crate::unit::{UnitId, UnitState};

/// Errors that can occur while driving a workload backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unit not found: {0}")]
    NotFound(UnitId),

    #[error("unit {unit} is {state}, cannot {action}")]
    InvalidState {
        unit: UnitId,
        state: UnitState,
        action: &'static str,
    },

    #[error("unit {unit} did not reach running within {after:?}")]
    Timeout { unit: UnitId, after: Duration },

    #[error("no executable configured for image repository {0}")]
    ImageNotSupported(String),

    #[error("failed to spawn unit {unit}: {source}")]
    Spawn {
        unit: UnitId,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
