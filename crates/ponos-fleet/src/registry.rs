//! Per-tenant slot state machine.
//!
//! `current` is read lock-free by task dispatch. `next` and every slot
//! transition sit behind one lock, so promotions and removals of a tenant
//! are linearised. Backend work and drain hand-off happen after the lock
//! is released.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tracing::info;

use ponos_backend::WorkloadBackend;
use ponos_core::{PerformerId, PerformerInfo, Slot, TenantId};

use crate::drain::{DrainController, teardown};
use crate::error::{FleetError, FleetResult};
use crate::health::HealthMonitor;
use crate::performer::Performer;

pub struct PerformerRegistry {
    tenant: TenantId,
    current: ArcSwapOption<Performer>,
    next: RwLock<Option<Arc<Performer>>>,
    backend: Arc<dyn WorkloadBackend>,
    monitor: Arc<HealthMonitor>,
    drain: Arc<DrainController>,
    stop_timeout: Duration,
}

impl PerformerRegistry {
    pub fn new(
        tenant: TenantId,
        backend: Arc<dyn WorkloadBackend>,
        monitor: Arc<HealthMonitor>,
        drain: Arc<DrainController>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            tenant,
            current: ArcSwapOption::empty(),
            next: RwLock::new(None),
            backend,
            monitor,
            drain,
            stop_timeout,
        }
    }

    /// The tenant whose slots this registry holds.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Register a performer in the staged slot.
    pub fn create_staged(&self, performer: Arc<Performer>) -> FleetResult<()> {
        let mut next = self.next.write();
        if let Some(existing) = next.as_ref() {
            return Err(FleetError::SlotOccupied {
                tenant: self.tenant.clone(),
                existing: existing.id().clone(),
            });
        }
        performer.set_slot(Slot::Staged);
        info!(tenant = %self.tenant, performer_id = %performer.id(), "performer staged");
        *next = Some(performer);
        Ok(())
    }

    /// Put the staged performer in service and drain the outgoing one.
    ///
    /// Promoting the performer that is already current is a no-op.
    pub fn promote(&self, performer_id: &PerformerId) -> FleetResult<()> {
        let outgoing = {
            let mut next = self.next.write();
            if let Some(current) = self.current.load_full() {
                if current.id() == performer_id {
                    return Ok(());
                }
            }
            let staged = match next.as_ref() {
                Some(staged) if staged.id() == performer_id => Arc::clone(staged),
                _ => {
                    return Err(FleetError::NotStaged {
                        tenant: self.tenant.clone(),
                        performer: performer_id.clone(),
                    });
                }
            };
            let health = staged.health();
            if !health.is_ready() {
                return Err(FleetError::Unhealthy {
                    performer: performer_id.clone(),
                    container_healthy: health.container_healthy,
                    application_healthy: health.application_healthy,
                });
            }
            staged.set_slot(Slot::InService);
            let outgoing = self.current.swap(Some(staged));
            *next = None;
            outgoing
        };

        info!(
            tenant = %self.tenant,
            performer_id = %performer_id,
            outgoing = ?outgoing.as_ref().map(|p| p.id().to_string()),
            "performer promoted"
        );
        if let Some(outgoing) = outgoing {
            self.drain.begin_drain(outgoing);
        }
        Ok(())
    }

    /// Remove a current or staged performer immediately and tear down its unit.
    pub async fn remove(&self, performer_id: &PerformerId) -> FleetResult<()> {
        let removed = {
            let mut next = self.next.write();
            let is_current = self
                .current
                .load_full()
                .is_some_and(|p| p.id() == performer_id);
            if is_current {
                self.current.swap(None)
            } else if next.as_ref().is_some_and(|p| p.id() == performer_id) {
                next.take()
            } else {
                None
            }
        };
        let Some(performer) = removed else {
            return Err(FleetError::NotFound {
                tenant: self.tenant.clone(),
                performer: performer_id.clone(),
            });
        };

        performer.close_status();
        performer.set_slot(Slot::Removed);
        self.monitor.stop_monitor(performer_id);
        performer.retire();
        teardown(self.backend.as_ref(), &performer, self.stop_timeout).await;
        info!(tenant = %self.tenant, %performer_id, "performer removed");
        Ok(())
    }

    /// Snapshot of the occupied slots, current first.
    pub fn list(&self) -> Vec<PerformerInfo> {
        let next = self.next.read();
        self.current
            .load_full()
            .into_iter()
            .chain(next.iter().cloned())
            .map(|p| p.info())
            .collect()
    }

    /// The in-service performer, without taking the slot lock.
    pub fn current(&self) -> Option<Arc<Performer>> {
        self.current.load_full()
    }

    /// The staged performer, if any.
    pub fn next(&self) -> Option<Arc<Performer>> {
        self.next.read().clone()
    }

    /// Look up a current or staged performer by id.
    pub fn find(&self, performer_id: &PerformerId) -> Option<Arc<Performer>> {
        if let Some(current) = self.current.load_full() {
            if current.id() == performer_id {
                return Some(current);
            }
        }
        self.next
            .read()
            .as_ref()
            .filter(|p| p.id() == performer_id)
            .cloned()
    }

    /// Empty both slots and return their occupants. Used by shutdown.
    pub fn take_all(&self) -> Vec<Arc<Performer>> {
        let mut next = self.next.write();
        self.current
            .swap(None)
            .into_iter()
            .chain(next.take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ponos_backend::{InMemoryBackend, Operation};
    use ponos_conn::{ConnectionManager, LoopbackConnector};
    use ponos_core::ImageRef;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::performer::{UnitBinding, unit_endpoint, unit_spec};
    use crate::settings::FleetSettings;
    use crate::status::StatusStream;

    struct Fixture {
        backend: InMemoryBackend,
        drain: Arc<DrainController>,
        registry: PerformerRegistry,
    }

    fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let connector = Arc::new(LoopbackConnector::new());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(backend.clone()),
            connector,
            FleetSettings::default(),
        ));
        let drain = Arc::new(DrainController::new(
            Arc::new(backend.clone()),
            Arc::clone(&monitor),
            Duration::from_secs(5),
        ));
        let registry = PerformerRegistry::new(
            TenantId::parse("0x00000000000000000000000000000000000000cc").unwrap(),
            Arc::new(backend.clone()),
            monitor,
            Arc::clone(&drain),
            Duration::from_secs(5),
        );
        Fixture {
            backend,
            drain,
            registry,
        }
    }

    async fn performer(f: &Fixture, healthy: bool) -> Arc<Performer> {
        performer_with_status(f, healthy).await.0
    }

    async fn performer_with_status(f: &Fixture, healthy: bool) -> (Arc<Performer>, StatusStream) {
        let id = PerformerId::generate();
        let image = ImageRef::parse("avs/performer:v1").unwrap();
        let spec = unit_spec(&id, f.registry.tenant(), &image, &Default::default());
        let info = f.backend.create(&spec).await.unwrap();
        f.backend.start(&info.id).await.unwrap();
        let endpoint = unit_endpoint(&info, &spec);
        let (p, status) = Performer::new(
            id,
            f.registry.tenant().clone(),
            image,
            UnitBinding {
                unit_id: info.id,
                endpoint: endpoint.clone(),
            },
            ConnectionManager::new(
                endpoint,
                Arc::new(LoopbackConnector::new()),
                &Default::default(),
            ),
            8,
            CancellationToken::new(),
        );
        p.update_health(|h| h.application_healthy = healthy);
        (Arc::new(p), status)
    }

    #[tokio::test]
    async fn only_one_staged_performer() {
        let f = fixture();
        let a = performer(&f, true).await;
        let b = performer(&f, true).await;
        f.registry.create_staged(Arc::clone(&a)).unwrap();
        let err = f.registry.create_staged(b).unwrap_err();
        assert!(matches!(err, FleetError::SlotOccupied { existing, .. } if &existing == a.id()));
    }

    #[tokio::test]
    async fn promote_requires_both_health_levels() {
        let f = fixture();
        let p = performer(&f, false).await;
        f.registry.create_staged(Arc::clone(&p)).unwrap();
        assert!(matches!(
            f.registry.promote(p.id()),
            Err(FleetError::Unhealthy {
                application_healthy: false,
                ..
            })
        ));
        assert!(f.registry.current().is_none());

        p.update_health(|h| h.application_healthy = true);
        f.registry.promote(p.id()).unwrap();
        assert_eq!(p.slot(), Slot::InService);
        assert!(f.registry.next().is_none());
    }

    #[tokio::test]
    async fn promote_is_idempotent_for_current() {
        let f = fixture();
        let p = performer(&f, true).await;
        f.registry.create_staged(Arc::clone(&p)).unwrap();
        f.registry.promote(p.id()).unwrap();
        f.registry.promote(p.id()).unwrap();
        assert_eq!(f.registry.list().len(), 1);
        assert_eq!(f.drain.draining_count(), 0);
    }

    #[tokio::test]
    async fn promote_unknown_is_not_staged() {
        let f = fixture();
        assert!(matches!(
            f.registry.promote(&PerformerId::from("performer-missing")),
            Err(FleetError::NotStaged { .. })
        ));
    }

    #[tokio::test]
    async fn promotion_drains_the_outgoing_performer() {
        let f = fixture();
        let blue = performer(&f, true).await;
        let green = performer(&f, true).await;
        f.registry.create_staged(Arc::clone(&blue)).unwrap();
        f.registry.promote(blue.id()).unwrap();
        f.registry.create_staged(Arc::clone(&green)).unwrap();
        f.registry.promote(green.id()).unwrap();

        assert_eq!(f.registry.current().unwrap().id(), green.id());
        f.drain.wait_for_drain_completion().await;
        assert_eq!(blue.slot(), Slot::Removed);
        assert_eq!(green.slot(), Slot::InService);

        let infos = f.registry.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(&infos[0].id, green.id());
    }

    #[tokio::test]
    async fn remove_tears_down_and_closes_stream() {
        let f = fixture();
        let (p, mut status) = performer_with_status(&f, true).await;
        f.registry.create_staged(Arc::clone(&p)).unwrap();

        f.registry.remove(p.id()).await.unwrap();
        assert!(status.recv().await.is_none());
        assert_eq!(p.slot(), Slot::Removed);
        assert!(f.registry.next().is_none());
        assert_eq!(f.backend.count(Operation::Stop), 1);
        assert!(f.backend.units().is_empty());

        assert!(matches!(
            f.registry.remove(p.id()).await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn take_all_empties_both_slots() {
        let f = fixture();
        let a = performer(&f, true).await;
        let b = performer(&f, true).await;
        f.registry.create_staged(Arc::clone(&a)).unwrap();
        f.registry.promote(a.id()).unwrap();
        f.registry.create_staged(b).unwrap();

        assert_eq!(f.registry.take_all().len(), 2);
        assert!(f.registry.current().is_none());
        assert!(f.registry.next().is_none());
    }
}
