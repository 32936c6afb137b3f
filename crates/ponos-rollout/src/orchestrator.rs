//! Deployment orchestrator: create, wait for healthy, promote, roll back.
//!
//! Deployments are serialised per tenant: a second deployment for a tenant
//! with one in flight is rejected at once. Every phase is bounded by the
//! deployment's deadline and cancellation token; rollback of a staged
//! performer uses its own cleanup timeout so that it still runs after the
//! deployment itself was cancelled or timed out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ponos_core::config::DeploymentSettings;
use ponos_core::{DeploymentId, ImageRef, PerformerId, StatusKind, TenantId};
use ponos_fleet::{FleetManager, FleetResult, StagedPerformer};

use crate::deployment::{Deployment, DeploymentResult, DeploymentStatus};
use crate::error::DeploymentError;

type Creation = JoinHandle<FleetResult<StagedPerformer>>;

/// Runs blue-green deployments on top of a [`FleetManager`].
pub struct DeploymentOrchestrator {
    fleet: Arc<FleetManager>,
    settings: DeploymentSettings,
    /// One lock per tenant with a deployment in flight.
    tenant_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
    active: RwLock<HashMap<DeploymentId, Deployment>>,
    /// Finished deployments, newest first, bounded by `history_limit`.
    history: RwLock<VecDeque<Deployment>>,
}

impl DeploymentOrchestrator {
    pub fn new(fleet: Arc<FleetManager>, settings: DeploymentSettings) -> Self {
        Self {
            fleet,
            settings,
            tenant_locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// The fleet deployments are applied to.
    pub fn fleet(&self) -> &Arc<FleetManager> {
        &self.fleet
    }

    /// Deploy `image` as the tenant's new current performer.
    ///
    /// `timeout` defaults to the configured deployment timeout. The result
    /// always describes the outcome; failures carry an error.
    pub async fn deploy(
        &self,
        tenant: &TenantId,
        image: &ImageRef,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> DeploymentResult {
        let mut record = Deployment::new(DeploymentId::generate(), tenant.clone(), image.clone());

        let lock = self.tenant_lock(tenant);
        let Ok(serialised) = lock.try_lock_owned() else {
            let error = DeploymentError::InProgress(tenant.clone());
            warn!(%tenant, deployment_id = %record.id, "deployment rejected, another one is in progress");
            record.fail(&error);
            return DeploymentResult::new(&record, Some(error));
        };

        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        let deadline = Instant::now() + timeout;
        let id = record.id.clone();
        info!(%tenant, deployment_id = %id, %image, ?timeout, "deployment started");
        self.active.write().insert(id.clone(), record);

        let outcome = self.run(&id, tenant, image, deadline, timeout, &cancel).await;

        let mut record = match self.active.write().remove(&id) {
            Some(record) => record,
            None => Deployment::new(id.clone(), tenant.clone(), image.clone()),
        };
        let error = match outcome {
            Ok(performer_id) => {
                record.transition(
                    DeploymentStatus::Completed,
                    format!("performer {performer_id} promoted"),
                );
                info!(%tenant, deployment_id = %id, %performer_id, "deployment completed");
                None
            }
            Err(e) => {
                record.fail(&e);
                match &e {
                    DeploymentError::Cancelled => {
                        info!(%tenant, deployment_id = %id, "deployment cancelled")
                    }
                    _ => error!(%tenant, deployment_id = %id, error = %e, "deployment failed"),
                }
                Some(e)
            }
        };

        let result = DeploymentResult::new(&record, error);
        self.archive(record);
        drop(serialised);
        self.release_tenant_lock(tenant);
        result
    }

    /// Deployments currently running.
    pub fn active_deployments(&self) -> Vec<Deployment> {
        let mut active: Vec<_> = self.active.read().values().cloned().collect();
        active.sort_by_key(|d| d.start_time);
        active
    }

    /// Look up a deployment, active or finished.
    pub fn deployment(&self, id: &DeploymentId) -> Option<Deployment> {
        if let Some(active) = self.active.read().get(id) {
            return Some(active.clone());
        }
        self.history.read().iter().find(|d| &d.id == id).cloned()
    }

    /// Finished deployments of a tenant, newest first.
    pub fn history(&self, tenant: &TenantId) -> Vec<Deployment> {
        self.history
            .read()
            .iter()
            .filter(|d| &d.tenant == tenant)
            .cloned()
            .collect()
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.tenant_locks.lock().entry(tenant.clone()).or_default())
    }

    /// Forget a tenant's lock once nobody holds or waits on it. Clones are
    /// only handed out under the map lock, so the count cannot grow here.
    fn release_tenant_lock(&self, tenant: &TenantId) {
        let mut locks = self.tenant_locks.lock();
        if locks.get(tenant).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(tenant);
        }
    }

    fn update(&self, id: &DeploymentId, f: impl FnOnce(&mut Deployment)) {
        if let Some(record) = self.active.write().get_mut(id) {
            f(record);
        }
    }

    fn archive(&self, record: Deployment) {
        let mut history = self.history.write();
        history.push_front(record);
        history.truncate(self.settings.history_limit.max(1));
    }

    async fn run(
        &self,
        id: &DeploymentId,
        tenant: &TenantId,
        image: &ImageRef,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PerformerId, DeploymentError> {
        let mut staged = self.create(tenant, image, deadline, timeout, cancel).await?;
        let performer_id = staged.performer_id.clone();
        self.update(id, |d| {
            d.bind_performer(performer_id.clone());
            d.transition(
                DeploymentStatus::InProgress,
                format!("performer {performer_id} staged, waiting for health"),
            );
        });

        let promoted = match self
            .wait_healthy(id, tenant, &mut staged, deadline, timeout, cancel)
            .await
        {
            Ok(()) => self
                .fleet
                .promote_performer(tenant, &performer_id)
                .map_err(DeploymentError::PromotionFailed),
            Err(e) => Err(e),
        };

        if let Err(e) = promoted {
            warn!(%tenant, deployment_id = %id, %performer_id, error = %e, "rolling back staged performer");
            self.rollback(tenant, &performer_id).await;
            return Err(e);
        }
        Ok(performer_id)
    }

    /// Stage the performer on its own task so that an abandoned creation
    /// is still cleaned up once it finishes.
    async fn create(
        &self,
        tenant: &TenantId,
        image: &ImageRef,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StagedPerformer, DeploymentError> {
        let mut creation: Creation = {
            let fleet = Arc::clone(&self.fleet);
            let tenant = tenant.clone();
            let image = image.clone();
            tokio::spawn(async move { fleet.create_performer(&tenant, &image).await })
        };

        let abandoned = tokio::select! {
            biased;
            _ = cancel.cancelled() => DeploymentError::Cancelled,
            _ = tokio::time::sleep_until(deadline) => DeploymentError::Timeout(timeout),
            joined = &mut creation => {
                return match joined {
                    Ok(Ok(staged)) => Ok(staged),
                    Ok(Err(e)) => Err(DeploymentError::Creation(e)),
                    Err(e) => Err(DeploymentError::PerformerLost(format!("creation task failed: {e}"))),
                };
            }
        };

        self.abandon(tenant, creation);
        Err(abandoned)
    }

    fn abandon(&self, tenant: &TenantId, creation: Creation) {
        let fleet = Arc::clone(&self.fleet);
        let tenant = tenant.clone();
        let cleanup_timeout = self.settings.cleanup_timeout;
        tokio::spawn(async move {
            if let Ok(Ok(staged)) = creation.await {
                info!(%tenant, performer_id = %staged.performer_id, "removing performer of abandoned deployment");
                remove_staged(&fleet, &tenant, &staged.performer_id, cleanup_timeout).await;
            }
        });
    }

    async fn wait_healthy(
        &self,
        id: &DeploymentId,
        tenant: &TenantId,
        staged: &mut StagedPerformer,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), DeploymentError> {
        let performer_id = staged.performer_id.clone();
        let mut progress = tokio::time::interval(self.settings.progress_interval);
        progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeploymentError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(DeploymentError::Timeout(timeout)),
                event = staged.status.recv() => {
                    let Some(event) = event else {
                        return Err(DeploymentError::PerformerLost(format!(
                            "status stream of {performer_id} closed before it became healthy"
                        )));
                    };
                    debug!(deployment_id = %id, %performer_id, kind = ?event.kind, "performer status");
                    match event.kind {
                        StatusKind::Healthy => {
                            self.update(id, |d| {
                                d.transition(DeploymentStatus::Healthy, event.message.clone());
                            });
                            return Ok(());
                        }
                        StatusKind::Unhealthy | StatusKind::ContainerDown => {
                            self.update(id, |d| {
                                d.transition(DeploymentStatus::Unhealthy, event.message.clone());
                            });
                        }
                        StatusKind::Restarted
                        | StatusKind::Recreated
                        | StatusKind::RestartRequested => {
                            self.update(id, |d| d.message = event.message.clone());
                        }
                    }
                }
                _ = progress.tick() => {
                    let Some(performer) = self.fleet.performer(tenant, &performer_id) else {
                        return Err(DeploymentError::PerformerLost(format!(
                            "performer {performer_id} is no longer registered"
                        )));
                    };
                    let health = performer.health();
                    if health.is_ready() {
                        self.update(id, |d| {
                            d.transition(DeploymentStatus::Healthy, "health record reports ready");
                        });
                        return Ok(());
                    }
                    debug!(
                        deployment_id = %id,
                        %performer_id,
                        container_healthy = health.container_healthy,
                        application_healthy = health.application_healthy,
                        remaining = ?deadline.saturating_duration_since(Instant::now()),
                        "waiting for performer health"
                    );
                }
            }
        }
    }

    async fn rollback(&self, tenant: &TenantId, performer_id: &PerformerId) {
        remove_staged(&self.fleet, tenant, performer_id, self.settings.cleanup_timeout).await;
    }
}

/// Remove a staged performer under a fresh timeout. Errors are logged.
async fn remove_staged(
    fleet: &FleetManager,
    tenant: &TenantId,
    performer_id: &PerformerId,
    cleanup_timeout: Duration,
) {
    match tokio::time::timeout(cleanup_timeout, fleet.remove_performer(tenant, performer_id)).await {
        Ok(Ok(())) => debug!(%tenant, %performer_id, "staged performer removed"),
        Ok(Err(e)) => warn!(%tenant, %performer_id, error = %e, "failed to remove staged performer"),
        Err(_) => error!(%tenant, %performer_id, ?cleanup_timeout, "timed out removing staged performer"),
    }
}
