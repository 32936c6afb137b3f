//! Drain controller: retires outgoing performers without losing work.
//!
//! A draining performer keeps serving the tasks it already accepted. Its
//! unit is torn down only once the in-flight count reaches zero.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use ponos_backend::WorkloadBackend;
use ponos_core::{PerformerId, Slot};

use crate::health::HealthMonitor;
use crate::performer::Performer;

/// Retires outgoing performers once their in-flight work is done.
pub struct DrainController {
    backend: Arc<dyn WorkloadBackend>,
    monitor: Arc<HealthMonitor>,
    stop_timeout: Duration,
    /// Performers with a drain task still running.
    draining: Arc<Mutex<HashSet<PerformerId>>>,
    /// Drains whose stop or remove call failed.
    failed: Arc<AtomicUsize>,
    tasks: TaskTracker,
}

impl DrainController {
    pub fn new(
        backend: Arc<dyn WorkloadBackend>,
        monitor: Arc<HealthMonitor>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            monitor,
            stop_timeout,
            draining: Arc::new(Mutex::new(HashSet::new())),
            failed: Arc::new(AtomicUsize::new(0)),
            tasks: TaskTracker::new(),
        }
    }

    /// Start retiring a performer. Returns `false` if it is already draining.
    pub fn begin_drain(&self, performer: Arc<Performer>) -> bool {
        if !self.draining.lock().insert(performer.id().clone()) {
            return false;
        }
        performer.set_slot(Slot::Draining);
        info!(
            performer_id = %performer.id(),
            tenant = %performer.tenant(),
            in_flight = performer.in_flight(),
            "draining performer"
        );

        let backend = Arc::clone(&self.backend);
        let monitor = Arc::clone(&self.monitor);
        let draining = Arc::clone(&self.draining);
        let failed = Arc::clone(&self.failed);
        let stop_timeout = self.stop_timeout;
        self.tasks.spawn(async move {
            performer.wait_drained().await;
            monitor.stop_monitor(performer.id());
            performer.retire();
            if !teardown(backend.as_ref(), &performer, stop_timeout).await {
                failed.fetch_add(1, Ordering::Relaxed);
            }
            performer.set_slot(Slot::Removed);
            draining.lock().remove(performer.id());
            info!(performer_id = %performer.id(), tenant = %performer.tenant(), "performer drained and removed");
        });
        true
    }

    /// Whether a drain for this performer is still running.
    pub fn is_draining(&self, performer_id: &PerformerId) -> bool {
        self.draining.lock().contains(performer_id)
    }

    pub fn draining_count(&self) -> usize {
        self.draining.lock().len()
    }

    /// Drains so far whose unit could not be stopped or removed cleanly.
    pub fn failed_teardowns(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait for every drain started so far to finish.
    pub async fn wait_for_drain_completion(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Stop liveness monitoring, stop the unit and force-remove it.
/// Failures are logged, never propagated; returns whether both calls
/// succeeded.
pub(crate) async fn teardown(
    backend: &dyn WorkloadBackend,
    performer: &Performer,
    stop_timeout: Duration,
) -> bool {
    let unit = performer.unit();
    let mut clean = true;
    backend.stop_liveness_monitoring(&unit.unit_id).await;
    if let Err(e) = backend.stop(&unit.unit_id, stop_timeout).await {
        warn!(performer_id = %performer.id(), unit = %unit.unit_id, error = %e, "failed to stop performer unit");
        clean = false;
    }
    if let Err(e) = backend.remove(&unit.unit_id, true).await {
        error!(performer_id = %performer.id(), unit = %unit.unit_id, error = %e, "failed to remove performer unit");
        clean = false;
    }
    clean
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use ponos_backend::{InMemoryBackend, Operation};
    use ponos_conn::{ConnectionManager, LoopbackConnector};
    use ponos_core::config::ConnectionSettings;
    use ponos_core::{ImageRef, TenantId};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::performer::{UnitBinding, unit_endpoint, unit_spec};
    use crate::settings::FleetSettings;

    async fn setup() -> (InMemoryBackend, DrainController, Arc<Performer>) {
        let backend = InMemoryBackend::new();
        let connector = Arc::new(LoopbackConnector::new());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(backend.clone()),
            connector.clone(),
            FleetSettings::default(),
        ));
        let drain = DrainController::new(
            Arc::new(backend.clone()),
            monitor,
            Duration::from_secs(5),
        );

        let id = PerformerId::generate();
        let tenant = TenantId::parse("0x00000000000000000000000000000000000000bb").unwrap();
        let image = ImageRef::parse("avs/performer:v1").unwrap();
        let spec = unit_spec(&id, &tenant, &image, &Default::default());
        let info = backend.create(&spec).await.unwrap();
        backend.start(&info.id).await.unwrap();
        let endpoint = unit_endpoint(&info, &spec);
        let (performer, _status) = Performer::new(
            id,
            tenant,
            image,
            UnitBinding {
                unit_id: info.id,
                endpoint: endpoint.clone(),
            },
            ConnectionManager::new(endpoint, connector, &ConnectionSettings::default()),
            8,
            CancellationToken::new(),
        );
        (backend, drain, Arc::new(performer))
    }

    #[tokio::test]
    async fn teardown_waits_for_in_flight_tasks() {
        let (backend, drain, performer) = setup().await;
        let guard = performer.track_task().unwrap();

        assert!(drain.begin_drain(Arc::clone(&performer)));
        assert!(!drain.begin_drain(Arc::clone(&performer)), "second drain is a no-op");
        assert_eq!(performer.slot(), Slot::Draining);
        assert!(drain.is_draining(performer.id()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.count(Operation::Stop), 0);
        assert_eq!(backend.count(Operation::Remove), 0);

        let released_at = Instant::now();
        drop(guard);
        drain.wait_for_drain_completion().await;

        let stops = backend.calls_of(Operation::Stop);
        let removes = backend.calls_of(Operation::Remove);
        assert_eq!(stops.len(), 1);
        assert_eq!(removes.len(), 1);
        assert!(stops[0].at >= released_at);
        assert!(removes[0].at >= stops[0].at);

        assert_eq!(performer.slot(), Slot::Removed);
        assert!(performer.status_closed());
        assert!(performer.cancel_token().is_cancelled());
        assert_eq!(drain.draining_count(), 0);
        assert!(backend.units().is_empty());
    }

    #[tokio::test]
    async fn idle_performer_is_torn_down_right_away() {
        let (backend, drain, performer) = setup().await;
        drain.begin_drain(Arc::clone(&performer));
        drain.wait_for_drain_completion().await;
        assert_eq!(backend.count(Operation::Remove), 1);
        assert_eq!(performer.slot(), Slot::Removed);
    }

    #[tokio::test]
    async fn teardown_failures_are_logged_not_fatal() {
        let (backend, drain, performer) = setup().await;
        backend.fail_next(Operation::Stop, 1);
        backend.fail_next(Operation::Remove, 1);
        drain.begin_drain(Arc::clone(&performer));
        drain.wait_for_drain_completion().await;
        assert_eq!(performer.slot(), Slot::Removed);
        assert!(!drain.is_draining(performer.id()));
        assert_eq!(drain.failed_teardowns(), 1);
    }

    #[tokio::test]
    async fn teardown_follows_the_last_of_many_tasks() {
        let (backend, drain, performer) = setup().await;
        let released = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = [10u64, 40, 25, 60]
            .into_iter()
            .map(|ms| {
                let guard = performer.track_task().unwrap();
                let released = Arc::clone(&released);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    released.lock().push(Instant::now());
                    drop(guard);
                })
            })
            .collect();

        drain.begin_drain(Arc::clone(&performer));
        for task in tasks {
            task.await.unwrap();
        }
        drain.wait_for_drain_completion().await;

        let last_release = released.lock().iter().copied().max().unwrap();
        let stops = backend.calls_of(Operation::Stop);
        assert_eq!(stops.len(), 1);
        assert!(stops[0].at >= last_release);
        assert_eq!(drain.failed_teardowns(), 0);
    }

    #[tokio::test]
    async fn drained_performer_refuses_late_dispatch() {
        let (_backend, drain, performer) = setup().await;
        drain.begin_drain(Arc::clone(&performer));
        drain.wait_for_drain_completion().await;

        // A dispatcher that loaded this performer before the promotion.
        assert!(performer.track_task().is_none());
        assert_eq!(performer.in_flight(), 0);
    }
}
