//! The `WorkloadBackend` capability trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ponos_core::config::LivenessSettings;

use crate::error::BackendResult;
use crate::unit::{LifecycleEvent, UnitId, UnitInfo, UnitSpec};

/// Stream of lifecycle events for one monitored unit.
///
/// The stream ends when monitoring stops or the unit is removed.
pub type LifecycleEvents = mpsc::Receiver<LifecycleEvent>;

/// Creates, runs and destroys the compute units behind performers.
///
/// Implementations must be cheap to share (`Arc<dyn WorkloadBackend>`)
/// and safe to call concurrently for different units.
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    /// Short name used in logs ("process", "memory", ...).
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &UnitSpec) -> BackendResult<UnitInfo>;

    async fn start(&self, id: &UnitId) -> BackendResult<()>;

    /// Stop the unit, giving it up to `timeout` to exit.
    async fn stop(&self, id: &UnitId, timeout: Duration) -> BackendResult<()>;

    async fn remove(&self, id: &UnitId, force: bool) -> BackendResult<()>;

    async fn inspect(&self, id: &UnitId) -> BackendResult<UnitInfo>;

    async fn wait_until_running(&self, id: &UnitId, timeout: Duration) -> BackendResult<()>;

    /// Begin infrastructure-level monitoring and return its event stream.
    ///
    /// Calling this again for the same unit replaces the previous stream.
    async fn start_liveness_monitoring(
        &self,
        id: &UnitId,
        config: &LivenessSettings,
    ) -> BackendResult<LifecycleEvents>;

    async fn stop_liveness_monitoring(&self, id: &UnitId);

    /// Restart the unit as a corrective action.
    async fn trigger_restart(&self, id: &UnitId, reason: &str) -> BackendResult<()>;
}
