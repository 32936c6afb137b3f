//! Transport seams: a `Connector` dials an endpoint and yields a
//! `PerformerChannel`, the RPC surface of one performer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use ponos_core::{TaskRequest, TaskResult};

use crate::error::ConnResult;

/// Connectivity state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ChannelState {
    /// Whether a cached channel in this state can be reused as is.
    pub fn is_usable(self) -> bool {
        matches!(self, ChannelState::Ready | ChannelState::Idle)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Ready => "ready",
            ChannelState::TransientFailure => "transient_failure",
            ChannelState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An established control channel to one performer.
#[async_trait]
pub trait PerformerChannel: Send + Sync {
    fn endpoint(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Resolve once the channel can carry requests.
    async fn wait_ready(&self) -> ConnResult<()>;

    /// Ask the performer whether it is ready to execute tasks.
    async fn health_check(&self) -> ConnResult<()>;

    async fn execute_task(&self, task: TaskRequest) -> ConnResult<TaskResult>;

    /// Release the channel. Later calls fail with `ConnError::Closed`.
    fn close(&self);
}

/// Dials performer endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> ConnResult<Arc<dyn PerformerChannel>>;
}
