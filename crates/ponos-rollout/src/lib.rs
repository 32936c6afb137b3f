//! ponos-rollout: zero-downtime performer deployments.
//!
//! A deployment stages a new performer, waits for it to become healthy,
//! promotes it, and removes it again if anything goes wrong before the
//! promotion. Deployments of one tenant never overlap.

pub mod deployment;
pub mod error;
pub mod orchestrator;

pub use deployment::{Deployment, DeploymentResult, DeploymentStatus};
pub use error::DeploymentError;
pub use orchestrator::DeploymentOrchestrator;
