//! Health monitor: one background loop per performer.
//!
//! Each loop selects over cancellation, the backend's lifecycle event
//! stream for the performer's unit, and the application probe ticker. It
//! owns the performer's health record, raises status events, escalates
//! repeated probe failures into a backend restart, and recreates units
//! the backend reports as unrecoverable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ponos_backend::{LifecycleEvent, LifecycleEvents, UnitId, WorkloadBackend};
use ponos_conn::{ConnectionManager, Connector};
use ponos_core::{PerformerId, StatusKind};

use crate::error::{FleetError, FleetResult};
use crate::health::tracker::{HealthTracker, LifecycleAction, ProbeVerdict};
use crate::performer::{Performer, UnitBinding, unit_endpoint, unit_spec};
use crate::settings::FleetSettings;

struct MonitorContext {
    backend: Arc<dyn WorkloadBackend>,
    connector: Arc<dyn Connector>,
    settings: FleetSettings,
    tracker: HealthTracker,
}

impl MonitorContext {
    fn connection_for(&self, endpoint: &str) -> ConnectionManager {
        ConnectionManager::new(endpoint, Arc::clone(&self.connector), &self.settings.connection)
    }
}

/// Per-performer monitor state.
struct MonitorSlot {
    /// The loop task; awaited only by `stop_all`.
    handle: JoinHandle<()>,
    /// Child of the performer's token, so retiring the performer also
    /// ends its loop.
    cancel: CancellationToken,
}

/// Manages the health loops of all performers.
pub struct HealthMonitor {
    ctx: Arc<MonitorContext>,
    monitors: Mutex<HashMap<PerformerId, MonitorSlot>>,
}

impl HealthMonitor {
    pub fn new(
        backend: Arc<dyn WorkloadBackend>,
        connector: Arc<dyn Connector>,
        settings: FleetSettings,
    ) -> Self {
        let tracker = HealthTracker::new(settings.health.escalation_threshold);
        Self {
            ctx: Arc::new(MonitorContext {
                backend,
                connector,
                settings,
                tracker,
            }),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the performer's lifecycle events and start its loop,
    /// replacing any loop already running for it.
    pub async fn start_monitor(&self, performer: Arc<Performer>) -> FleetResult<()> {
        let unit = performer.unit();
        let events = self
            .ctx
            .backend
            .start_liveness_monitoring(&unit.unit_id, &self.ctx.settings.liveness)
            .await?;

        let cancel = performer.cancel_token().child_token();
        let performer_id = performer.id().clone();
        let handle = tokio::spawn(run_monitor_loop(
            Arc::clone(&self.ctx),
            performer,
            Some(events),
            cancel.clone(),
        ));

        let old = self
            .monitors
            .lock()
            .insert(performer_id.clone(), MonitorSlot { handle, cancel });
        if let Some(old) = old {
            old.cancel.cancel();
        }

        info!(
            %performer_id,
            unit = %unit.unit_id,
            interval = ?self.ctx.settings.health.application_check_interval,
            "health monitor started"
        );
        Ok(())
    }

    /// Stop a performer's loop. Returns whether one was running.
    pub fn stop_monitor(&self, performer_id: &PerformerId) -> bool {
        match self.monitors.lock().remove(performer_id) {
            Some(slot) => {
                slot.cancel.cancel();
                info!(%performer_id, "health monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every loop and wait for them to exit.
    pub async fn stop_all(&self) {
        let slots: Vec<_> = self.monitors.lock().drain().collect();
        for (_, slot) in &slots {
            slot.cancel.cancel();
        }
        for (performer_id, slot) in slots {
            if let Err(e) = slot.handle.await {
                warn!(%performer_id, error = %e, "health monitor task failed");
            }
        }
        info!("all health monitors stopped");
    }

    /// Performers with a running health loop.
    pub fn active_monitors(&self) -> Vec<PerformerId> {
        self.monitors.lock().keys().cloned().collect()
    }

    pub fn is_monitoring(&self, performer_id: &PerformerId) -> bool {
        self.monitors.lock().contains_key(performer_id)
    }
}

/// The health loop for a single performer.
async fn run_monitor_loop(
    ctx: Arc<MonitorContext>,
    performer: Arc<Performer>,
    mut events: Option<LifecycleEvents>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ctx.settings.health.application_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(performer_id = %performer.id(), "health loop starting");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = next_event(&mut events) => match event {
                Some(event) => handle_lifecycle(&ctx, &performer, event, &mut events, &cancel).await,
                None => {
                    debug!(performer_id = %performer.id(), "lifecycle stream ended");
                    events = None;
                }
            },
            _ = ticker.tick() => probe(&ctx, &performer, &cancel).await,
        }
    }

    debug!(performer_id = %performer.id(), "health loop exiting");
}

async fn next_event(events: &mut Option<LifecycleEvents>) -> Option<LifecycleEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_lifecycle(
    ctx: &MonitorContext,
    performer: &Performer,
    event: LifecycleEvent,
    events: &mut Option<LifecycleEvents>,
    cancel: &CancellationToken,
) {
    let unit = performer.unit();
    if event.unit_id != unit.unit_id {
        debug!(performer_id = %performer.id(), unit = %event.unit_id, "ignoring event for replaced unit");
        return;
    }

    let action = LifecycleAction::for_event(&event);
    debug!(performer_id = %performer.id(), unit = %unit.unit_id, kind = %event.kind, ?action, "lifecycle event");

    match action {
        LifecycleAction::ContainerUp => {
            performer.update_health(|h| ctx.tracker.apply_lifecycle(h, action));
        }
        LifecycleAction::ContainerDown => {
            performer.update_health(|h| ctx.tracker.apply_lifecycle(h, action));
            warn!(
                performer_id = %performer.id(),
                unit = %unit.unit_id,
                kind = %event.kind,
                message = %event.message,
                "performer unit down"
            );
            performer.emit(
                StatusKind::ContainerDown,
                format!("{}: {}", event.kind, event.message),
            );
        }
        LifecycleAction::Restarted => {
            performer.update_health(|h| ctx.tracker.apply_lifecycle(h, action));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(ctx.settings.health.restart_settle_delay) => {}
            }
            performer.replace_connection(ctx.connection_for(&unit.endpoint));
            info!(
                performer_id = %performer.id(),
                unit = %unit.unit_id,
                restart_count = event.restart_count,
                "performer unit restarted, connection renewed"
            );
            performer.emit(
                StatusKind::Restarted,
                format!("unit restarted ({} restarts)", event.restart_count),
            );
        }
        LifecycleAction::Recreate => {
            warn!(performer_id = %performer.id(), unit = %unit.unit_id, message = %event.message, "performer unit unrecoverable, recreating");
            match recreate(ctx, performer, &unit.unit_id, events, cancel).await {
                Ok(binding) => {
                    info!(
                        performer_id = %performer.id(),
                        old_unit = %unit.unit_id,
                        new_unit = %binding.unit_id,
                        endpoint = %binding.endpoint,
                        "performer recreated"
                    );
                    performer.emit(
                        StatusKind::Recreated,
                        format!("unit {} replaced by {}", unit.unit_id, binding.unit_id),
                    );
                }
                Err(e) => {
                    error!(performer_id = %performer.id(), unit = %unit.unit_id, error = %e, "performer recreation failed");
                    performer.update_health(|h| {
                        ctx.tracker.apply_lifecycle(h, LifecycleAction::ContainerDown)
                    });
                }
            }
        }
    }
}

/// Replace the performer's unit in place: same performer id, same status
/// stream, new unit, endpoint and connection.
async fn recreate(
    ctx: &MonitorContext,
    performer: &Performer,
    old_unit: &UnitId,
    events: &mut Option<LifecycleEvents>,
    cancel: &CancellationToken,
) -> FleetResult<UnitBinding> {
    let backend = ctx.backend.as_ref();
    let spec = unit_spec(
        performer.id(),
        performer.tenant(),
        performer.image(),
        &ctx.settings.performer,
    );
    let created = backend.create(&spec).await?;

    let started = async {
        backend.start(&created.id).await?;
        backend
            .wait_until_running(&created.id, ctx.settings.performer.startup_timeout)
            .await
    };
    if let Err(e) = started.await {
        discard_unit(backend, &created.id).await;
        return Err(e.into());
    }
    if cancel.is_cancelled() {
        discard_unit(backend, &created.id).await;
        return Err(FleetError::ShuttingDown);
    }

    let binding = UnitBinding {
        unit_id: created.id.clone(),
        endpoint: unit_endpoint(&created, &spec),
    };

    backend.stop_liveness_monitoring(old_unit).await;
    *events = match backend
        .start_liveness_monitoring(&created.id, &ctx.settings.liveness)
        .await
    {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!(performer_id = %performer.id(), unit = %created.id, error = %e, "could not subscribe to lifecycle events of recreated unit");
            None
        }
    };

    performer.replace_unit(binding.clone());
    performer.replace_connection(ctx.connection_for(&binding.endpoint));

    if let Err(e) = backend.remove(old_unit, true).await {
        warn!(performer_id = %performer.id(), unit = %old_unit, error = %e, "failed to remove replaced unit");
    }
    Ok(binding)
}

async fn discard_unit(backend: &dyn WorkloadBackend, unit: &UnitId) {
    if let Err(e) = backend.remove(unit, true).await {
        warn!(%unit, error = %e, "failed to discard unit");
    }
}

/// One application probe, only while the container level is healthy.
async fn probe(ctx: &MonitorContext, performer: &Performer, cancel: &CancellationToken) {
    let was_healthy = performer.health();
    if !was_healthy.container_healthy {
        return;
    }

    let conn = performer.connection();
    let timeout = ctx.settings.health.probe_timeout;
    let result = if conn.is_circuit_open() {
        Err(format!("circuit open for {}", conn.endpoint()))
    } else {
        tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = conn.health_check_within(timeout) => outcome.map_err(|e| e.to_string()),
        }
    };

    let now = Utc::now();
    match result {
        Ok(()) => {
            performer.update_health(|h| ctx.tracker.record_success(h, now));
            if !was_healthy.application_healthy {
                info!(performer_id = %performer.id(), "performer application healthy");
            }
            performer.emit(StatusKind::Healthy, "application probe succeeded");
        }
        Err(reason) => {
            let verdict = performer.update_health(|h| ctx.tracker.record_failure(h, now));
            warn!(performer_id = %performer.id(), ?verdict, %reason, "application probe failed");
            performer.emit(StatusKind::Unhealthy, reason);

            if let ProbeVerdict::Escalate { failures } = verdict {
                let unit = performer.unit();
                let why = format!("{failures} consecutive application probe failures");
                match ctx.backend.trigger_restart(&unit.unit_id, &why).await {
                    Ok(()) => {
                        info!(performer_id = %performer.id(), unit = %unit.unit_id, "restart requested");
                        performer.emit(StatusKind::RestartRequested, why);
                    }
                    Err(e) => {
                        error!(performer_id = %performer.id(), unit = %unit.unit_id, error = %e, "restart request failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ponos_backend::{InMemoryBackend, LifecycleKind, Operation, UnitSpec};
    use ponos_conn::{CircuitState, LoopbackConnector};
    use ponos_core::config::HealthSettings;
    use ponos_core::{ImageRef, PerformerId, Slot, TenantId};

    use super::*;
    use crate::status::StatusStream;

    struct Harness {
        backend: InMemoryBackend,
        connector: LoopbackConnector,
        monitor: HealthMonitor,
        settings: FleetSettings,
    }

    fn harness(backend: InMemoryBackend) -> Harness {
        let connector = LoopbackConnector::new();
        let settings = FleetSettings {
            health: HealthSettings {
                application_check_interval: Duration::from_secs(15),
                probe_timeout: Duration::from_secs(1),
                escalation_threshold: 3,
                restart_settle_delay: Duration::from_secs(2),
                status_buffer: 64,
            },
            ..FleetSettings::default()
        };
        let monitor = HealthMonitor::new(
            Arc::new(backend.clone()),
            Arc::new(connector.clone()),
            settings.clone(),
        );
        Harness {
            backend,
            connector,
            monitor,
            settings,
        }
    }

    async fn spawn_performer(h: &Harness) -> (Arc<Performer>, StatusStream) {
        spawn_performer_with(h, |conn| conn).await
    }

    async fn spawn_performer_with(
        h: &Harness,
        seed: impl FnOnce(ConnectionManager) -> ConnectionManager,
    ) -> (Arc<Performer>, StatusStream) {
        let id = PerformerId::generate();
        let tenant = TenantId::parse("0x00000000000000000000000000000000000000aa").unwrap();
        let image = ImageRef::parse("avs/performer:v1").unwrap();
        let spec: UnitSpec = unit_spec(&id, &tenant, &image, &h.settings.performer);
        let info = h.backend.create(&spec).await.unwrap();
        h.backend.start(&info.id).await.unwrap();
        let endpoint = unit_endpoint(&info, &spec);
        let (performer, status) = Performer::new(
            id,
            tenant,
            image,
            UnitBinding {
                unit_id: info.id.clone(),
                endpoint: endpoint.clone(),
            },
            seed(ConnectionManager::new(
                endpoint,
                Arc::new(h.connector.clone()),
                &h.settings.connection,
            )),
            h.settings.health.status_buffer,
            CancellationToken::new(),
        );
        let performer = Arc::new(performer);
        h.monitor.start_monitor(Arc::clone(&performer)).await.unwrap();
        (performer, status)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_probe_marks_application_healthy() {
        let h = harness(InMemoryBackend::new());
        let (performer, mut status) = spawn_performer(&h).await;

        let event = status.recv().await.unwrap();
        assert_eq!(event.kind, StatusKind::Healthy);
        assert!(performer.health().is_ready());
        assert!(h.monitor.is_monitoring(performer.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn three_failed_probes_request_exactly_one_restart() {
        let h = harness(InMemoryBackend::new().without_simulated_restarts());
        h.connector.set_default_healthy(false);
        let (performer, mut status) = spawn_performer(&h).await;

        // Probes at 0s, 15s and 30s.
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(h.backend.count(Operation::TriggerRestart), 1);
        assert_eq!(performer.health().consecutive_app_failures, 0);

        let mut kinds = Vec::new();
        while let Ok(event) = status.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                StatusKind::Unhealthy,
                StatusKind::Unhealthy,
                StatusKind::Unhealthy,
                StatusKind::RestartRequested
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probes_of_unreachable_performer_open_the_circuit() {
        let h = harness(InMemoryBackend::new().without_simulated_restarts());
        h.connector.set_default_reachable(false);
        let (performer, _status) = spawn_performer(&h).await;

        tokio::time::sleep(Duration::from_secs(300)).await;

        let conn = performer.connection();
        assert!(conn.circuit_state().consecutive_failures > 5);
        assert!(conn.is_circuit_open());

        // Open circuit: later probes no longer dial the performer.
        let connects = h.connector.connect_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.connect_count(), connects);
        assert!(!performer.health().application_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_the_probe_and_counts_a_failure() {
        let h = harness(InMemoryBackend::new().without_simulated_restarts());
        let healthy_at = tokio::time::Instant::now();
        tokio::time::advance(Duration::from_secs(120)).await;
        let (performer, mut status) = spawn_performer_with(&h, |conn| {
            conn.with_circuit_state(CircuitState {
                consecutive_failures: 6,
                last_healthy_at: healthy_at,
            })
        })
        .await;

        // Probes at 0s and 15s.
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(h.connector.health_check_count(), 0);
        assert_eq!(h.connector.connect_count(), 0);
        assert_eq!(performer.health().consecutive_app_failures, 2);
        let event = status.recv().await.unwrap();
        assert_eq!(event.kind, StatusKind::Unhealthy);
        assert!(event.message.contains("circuit open"));
    }

    #[tokio::test(start_paused = true)]
    async fn container_down_skips_probes() {
        let h = harness(InMemoryBackend::new());
        let (performer, mut status) = spawn_performer(&h).await;
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Healthy);

        let unit = performer.unit();
        assert!(h.backend.emit(&unit.unit_id, LifecycleKind::Crashed, "exit 1"));
        let down = status.recv().await.unwrap();
        assert_eq!(down.kind, StatusKind::ContainerDown);

        let probes_before = h.connector.health_check_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.health_check_count(), probes_before);
        assert!(!performer.health().container_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_renews_the_connection_after_settling() {
        let h = harness(InMemoryBackend::new());
        let (performer, mut status) = spawn_performer(&h).await;
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Healthy);

        let before = performer.connection();
        let unit = performer.unit();
        h.backend
            .trigger_restart(&unit.unit_id, "test")
            .await
            .unwrap();

        assert_eq!(status.recv().await.unwrap().kind, StatusKind::ContainerDown);
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Restarted);
        assert!(before.is_closed());
        assert!(!Arc::ptr_eq(&before, &performer.connection()));
        assert!(performer.health().container_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_unit_is_recreated_in_place() {
        let h = harness(InMemoryBackend::new());
        let (performer, mut status) = spawn_performer(&h).await;
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::Healthy);

        let old = performer.unit();
        h.backend.emit(
            &old.unit_id,
            LifecycleKind::RestartFailed,
            "unrecoverable: restart limit 5 reached",
        );

        let event = status.recv().await.unwrap();
        assert_eq!(event.kind, StatusKind::Recreated);
        assert_eq!(&event.performer_id, performer.id());

        let new = performer.unit();
        assert_ne!(new.unit_id, old.unit_id);
        assert!(h.backend.unit(&old.unit_id).is_none());
        assert!(h.backend.unit(&new.unit_id).is_some());
        assert_eq!(performer.slot(), Slot::Staged);

        // Events from the new unit reach the same stream.
        h.backend.emit(&new.unit_id, LifecycleKind::Crashed, "boom");
        assert_eq!(status.recv().await.unwrap().kind, StatusKind::ContainerDown);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitor_ends_the_loop() {
        let h = harness(InMemoryBackend::new());
        let (performer, _status) = spawn_performer(&h).await;
        assert!(h.monitor.stop_monitor(performer.id()));
        assert!(!h.monitor.stop_monitor(performer.id()));
        assert!(h.monitor.active_monitors().is_empty());

        let probes = h.connector.health_check_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.health_check_count(), probes);
    }
}
