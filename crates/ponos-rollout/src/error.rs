//! Deployment outcome errors.

use std::time::Duration;

use thiserror::Error;

use ponos_core::TenantId;
use ponos_fleet::FleetError;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("a deployment is already in progress for tenant {0}")]
    InProgress(TenantId),

    #[error("deployment timed out after {0:?}")]
    Timeout(Duration),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("performer creation failed: {0}")]
    Creation(#[source] FleetError),

    #[error("promotion failed: {0}")]
    PromotionFailed(#[source] FleetError),

    #[error("performer lost: {0}")]
    PerformerLost(String),
}
