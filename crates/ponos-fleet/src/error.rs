//! Fleet error types.

use thiserror::Error;

use ponos_backend::BackendError;
use ponos_conn::ConnError;
use ponos_core::{PerformerId, TenantId};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("tenant {tenant} already has a staged performer ({existing})")]
    SlotOccupied {
        tenant: TenantId,
        existing: PerformerId,
    },

    #[error("performer {performer} is not the staged performer of tenant {tenant}")]
    NotStaged {
        tenant: TenantId,
        performer: PerformerId,
    },

    #[error("performer {performer} not found for tenant {tenant}")]
    NotFound {
        tenant: TenantId,
        performer: PerformerId,
    },

    #[error(
        "performer {performer} is not healthy (container: {container_healthy}, application: {application_healthy})"
    )]
    Unhealthy {
        performer: PerformerId,
        container_healthy: bool,
        application_healthy: bool,
    },

    #[error("no performer in service for tenant {0}")]
    NoCurrentPerformer(TenantId),

    #[error("circuit open for performer {performer} at {endpoint}")]
    CircuitOpen {
        performer: PerformerId,
        endpoint: String,
    },

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("fleet is shutting down")]
    ShuttingDown,

    #[error("{failed} performer unit(s) could not be torn down cleanly")]
    TeardownIncomplete { failed: usize },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnError),
}

pub type FleetResult<T> = Result<T, FleetError>;
