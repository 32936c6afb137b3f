//! Fleet manager: owns every tenant's fleet and the shared plumbing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ponos_backend::{UnitId, WorkloadBackend};
use ponos_conn::{ConnectionManager, Connector};
use ponos_core::{ImageRef, PerformerId, PerformerInfo, TaskRequest, TaskResult, TenantId};

use crate::drain::DrainController;
use crate::error::{FleetError, FleetResult};
use crate::health::HealthMonitor;
use crate::performer::{Performer, TaskGuard, UnitBinding, unit_endpoint, unit_spec};
use crate::registry::PerformerRegistry;
use crate::settings::FleetSettings;
use crate::status::StatusStream;

/// One tenant's performers.
pub struct TenantFleet {
    /// The tenant's current and staged slots.
    pub registry: PerformerRegistry,
}

/// A performer that was created and registered in the staged slot.
pub struct StagedPerformer {
    pub performer_id: PerformerId,
    /// Control endpoint of the performer's unit at creation time.
    pub endpoint: String,
    /// The performer's status stream. There is exactly one consumer.
    pub status: StatusStream,
}

/// Tenant-scoped control surface over every performer fleet.
///
/// Owns the shared health monitor and drain controller. Tenant fleets are
/// created on first use and live until the manager is dropped.
pub struct FleetManager {
    backend: Arc<dyn WorkloadBackend>,
    connector: Arc<dyn Connector>,
    settings: FleetSettings,
    monitor: Arc<HealthMonitor>,
    drain: Arc<DrainController>,
    tenants: RwLock<HashMap<TenantId, Arc<TenantFleet>>>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl FleetManager {
    pub fn new(
        backend: Arc<dyn WorkloadBackend>,
        connector: Arc<dyn Connector>,
        settings: FleetSettings,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&backend),
            Arc::clone(&connector),
            settings.clone(),
        ));
        let drain = Arc::new(DrainController::new(
            Arc::clone(&backend),
            Arc::clone(&monitor),
            settings.drain.stop_timeout,
        ));
        info!(backend = backend.name(), "fleet manager created");
        Self {
            backend,
            connector,
            settings,
            monitor,
            drain,
            tenants: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Settings every fleet component was built from.
    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// The health monitor running one loop per live performer.
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Drains of outgoing performers, shared by every tenant.
    pub fn drain_controller(&self) -> &DrainController {
        &self.drain
    }

    /// Cancelled when the fleet shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Set once `shutdown` was called; creation is refused from then on.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// The fleet of a tenant that has had at least one performer.
    pub fn tenant(&self, tenant: &TenantId) -> Option<Arc<TenantFleet>> {
        self.tenants.read().get(tenant).cloned()
    }

    /// Every tenant with a fleet, in no particular order.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants.read().keys().cloned().collect()
    }

    fn tenant_or_insert(&self, tenant: &TenantId) -> Arc<TenantFleet> {
        if let Some(fleet) = self.tenant(tenant) {
            return fleet;
        }
        let mut tenants = self.tenants.write();
        let fleet = tenants.entry(tenant.clone()).or_insert_with(|| {
            info!(%tenant, "tenant fleet created");
            Arc::new(TenantFleet {
                registry: PerformerRegistry::new(
                    tenant.clone(),
                    Arc::clone(&self.backend),
                    Arc::clone(&self.monitor),
                    Arc::clone(&self.drain),
                    self.settings.drain.stop_timeout,
                ),
            })
        });
        Arc::clone(fleet)
    }

    fn registry_of(&self, tenant: &TenantId) -> FleetResult<Arc<TenantFleet>> {
        self.tenant(tenant)
            .ok_or_else(|| FleetError::UnknownTenant(tenant.clone()))
    }

    /// Create a unit, wrap it in a staged performer and start monitoring it.
    pub async fn create_performer(
        &self,
        tenant: &TenantId,
        image: &ImageRef,
    ) -> FleetResult<StagedPerformer> {
        if self.is_shutting_down() {
            return Err(FleetError::ShuttingDown);
        }
        let fleet = self.tenant_or_insert(tenant);
        if let Some(existing) = fleet.registry.next() {
            return Err(FleetError::SlotOccupied {
                tenant: tenant.clone(),
                existing: existing.id().clone(),
            });
        }

        let performer_id = PerformerId::generate();
        let spec = unit_spec(&performer_id, tenant, image, &self.settings.performer);
        let unit = self.backend.create(&spec).await?;
        let started = async {
            self.backend.start(&unit.id).await?;
            self.backend
                .wait_until_running(&unit.id, self.settings.performer.startup_timeout)
                .await
        };
        if let Err(e) = started.await {
            self.discard_unit(&unit.id).await;
            return Err(e.into());
        }

        let endpoint = unit_endpoint(&unit, &spec);
        let (performer, status) = Performer::new(
            performer_id.clone(),
            tenant.clone(),
            image.clone(),
            UnitBinding {
                unit_id: unit.id.clone(),
                endpoint: endpoint.clone(),
            },
            ConnectionManager::new(
                endpoint.clone(),
                Arc::clone(&self.connector),
                &self.settings.connection,
            ),
            self.settings.health.status_buffer,
            self.shutdown.child_token(),
        );
        let performer = Arc::new(performer);

        if let Err(e) = fleet.registry.create_staged(Arc::clone(&performer)) {
            performer.retire();
            self.discard_unit(&unit.id).await;
            return Err(e);
        }
        if let Err(e) = self.monitor.start_monitor(Arc::clone(&performer)).await {
            warn!(%tenant, %performer_id, error = %e, "could not start health monitor");
            if let Err(remove_err) = fleet.registry.remove(&performer_id).await {
                warn!(%tenant, %performer_id, error = %remove_err, "cleanup after failed monitor start");
            }
            return Err(e);
        }

        info!(%tenant, %performer_id, %image, unit = %unit.id, %endpoint, "performer created");
        Ok(StagedPerformer {
            performer_id,
            endpoint,
            status,
        })
    }

    /// Make the staged performer current and start draining the old one.
    pub fn promote_performer(
        &self,
        tenant: &TenantId,
        performer_id: &PerformerId,
    ) -> FleetResult<()> {
        self.registry_of(tenant)?.registry.promote(performer_id)
    }

    /// Tear down a current or staged performer without draining.
    pub async fn remove_performer(
        &self,
        tenant: &TenantId,
        performer_id: &PerformerId,
    ) -> FleetResult<()> {
        self.registry_of(tenant)?.registry.remove(performer_id).await
    }

    /// Current and staged performers of a tenant; empty for unknown tenants.
    pub fn list_performers(&self, tenant: &TenantId) -> Vec<PerformerInfo> {
        self.tenant(tenant)
            .map(|fleet| fleet.registry.list())
            .unwrap_or_default()
    }

    /// A current or staged performer of the tenant.
    pub fn performer(&self, tenant: &TenantId, performer_id: &PerformerId) -> Option<Arc<Performer>> {
        self.tenant(tenant)?.registry.find(performer_id)
    }

    /// Dispatch one task to the tenant's current performer.
    ///
    /// Fails fast without a current performer or with its circuit open.
    /// The task is sent at most once.
    pub async fn run_task(&self, tenant: &TenantId, task: TaskRequest) -> FleetResult<TaskResult> {
        let (performer, _in_flight) = self.admit(tenant)?;
        let connection = performer.connection();
        if connection.is_circuit_open() {
            return Err(FleetError::CircuitOpen {
                performer: performer.id().clone(),
                endpoint: connection.endpoint().to_string(),
            });
        }
        connection.execute_task(task).await.map_err(FleetError::from)
    }

    /// Load the current performer and count a task against it.
    ///
    /// A performer loaded just before a promotion may already have been
    /// drained; the current pointer is then reloaded once.
    fn admit(&self, tenant: &TenantId) -> FleetResult<(Arc<Performer>, TaskGuard)> {
        let fleet = self
            .tenant(tenant)
            .ok_or_else(|| FleetError::NoCurrentPerformer(tenant.clone()))?;
        let mut retired = None;
        for _ in 0..2 {
            let Some(performer) = fleet.registry.current() else {
                break;
            };
            if let Some(guard) = performer.track_task() {
                return Ok((performer, guard));
            }
            if retired.as_ref().is_some_and(|r| Arc::ptr_eq(r, &performer)) {
                break;
            }
            debug!(%tenant, performer_id = %performer.id(), "current performer stopped accepting, reloading");
            retired = Some(performer);
        }
        Err(FleetError::NoCurrentPerformer(tenant.clone()))
    }

    /// Stop monitoring, drain every performer and wait for the drains.
    ///
    /// Every performer is torn down even if some teardowns fail; the error
    /// reports how many units may have been left behind. Calling it again
    /// is a no-op.
    pub async fn shutdown(&self) -> FleetResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("fleet shutting down");
        let failed_before = self.drain.failed_teardowns();
        self.shutdown.cancel();
        self.monitor.stop_all().await;

        let fleets: Vec<_> = self.tenants.read().values().cloned().collect();
        for fleet in fleets {
            for performer in fleet.registry.take_all() {
                self.drain.begin_drain(performer);
            }
        }
        self.drain.wait_for_drain_completion().await;

        let failed = self.drain.failed_teardowns().saturating_sub(failed_before);
        if failed > 0 {
            warn!(failed, "fleet shut down with teardown failures");
            return Err(FleetError::TeardownIncomplete { failed });
        }
        info!("fleet shut down");
        Ok(())
    }

    async fn discard_unit(&self, unit: &UnitId) {
        if let Err(e) = self.backend.remove(unit, true).await {
            warn!(%unit, error = %e, "failed to discard unit");
        }
    }
}
