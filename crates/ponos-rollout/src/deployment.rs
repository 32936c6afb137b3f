//! Deployment records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ponos_core::{DeploymentId, ImageRef, PerformerId, TenantId};

use crate::error::DeploymentError;

/// Deployment state machine:
/// `pending → in_progress → {healthy|unhealthy}* → {completed|failed|cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Healthy,
    Unhealthy,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Unhealthy => "unhealthy",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What is known about one deployment, active or finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub tenant: TenantId,
    pub target_image: ImageRef,
    /// Bound once the staged performer exists.
    pub performer_id: Option<PerformerId>,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: String,
    /// Rendered error of a failed or cancelled deployment.
    pub error: Option<String>,
}

impl Deployment {
    pub fn new(id: DeploymentId, tenant: TenantId, target_image: ImageRef) -> Self {
        Self {
            id,
            tenant,
            target_image,
            performer_id: None,
            status: DeploymentStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            message: "deployment pending".to_string(),
            error: None,
        }
    }

    /// Bind the staged performer. Only the first binding sticks.
    pub fn bind_performer(&mut self, performer_id: PerformerId) -> bool {
        if self.performer_id.is_some() {
            return false;
        }
        self.performer_id = Some(performer_id);
        true
    }

    /// Move to `status`. Terminal states are write-once; returns `false`
    /// when the deployment already finished.
    pub fn transition(&mut self, status: DeploymentStatus, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = message.into();
        if status.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    /// Finish with an error; cancellation maps to `cancelled`, anything
    /// else to `failed`.
    pub fn fail(&mut self, error: &DeploymentError) -> bool {
        let status = match error {
            DeploymentError::Cancelled => DeploymentStatus::Cancelled,
            _ => DeploymentStatus::Failed,
        };
        let rendered = error.to_string();
        if !self.transition(status, rendered.clone()) {
            return false;
        }
        self.error = Some(rendered);
        true
    }
}

/// Outcome of `DeploymentOrchestrator::deploy`.
#[derive(Debug)]
pub struct DeploymentResult {
    pub deployment_id: DeploymentId,
    pub tenant: TenantId,
    pub performer_id: Option<PerformerId>,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: String,
    pub error: Option<DeploymentError>,
}

impl DeploymentResult {
    pub(crate) fn new(record: &Deployment, error: Option<DeploymentError>) -> Self {
        Self {
            deployment_id: record.id.clone(),
            tenant: record.tenant.clone(),
            performer_id: record.performer_id.clone(),
            status: record.status,
            start_time: record.start_time,
            end_time: record.end_time,
            message: record.message.clone(),
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::Completed
    }
}
