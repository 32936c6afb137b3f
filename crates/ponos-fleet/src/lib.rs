//! ponos-fleet: blue-green performer fleets, one per tenant.
//!
//! Each tenant has at most one `in_service` ("current") performer taking
//! tasks and at most one `staged` ("next") performer being validated.
//! A [`HealthMonitor`] loop per performer combines backend liveness events
//! with application-level probes, a [`DrainController`] retires outgoing
//! performers once their in-flight work is done, and the [`FleetManager`]
//! ties it together behind a tenant-scoped control surface.

pub mod drain;
pub mod error;
pub mod health;
pub mod manager;
pub mod performer;
pub mod registry;
pub mod settings;
pub mod status;

pub use drain::DrainController;
pub use error::{FleetError, FleetResult};
pub use health::{HealthMonitor, HealthTracker, ProbeVerdict};
pub use manager::{FleetManager, StagedPerformer, TenantFleet};
pub use performer::{Performer, TaskGuard, UnitBinding};
pub use registry::PerformerRegistry;
pub use settings::FleetSettings;
pub use status::{StatusSender, StatusStream, status_channel};
