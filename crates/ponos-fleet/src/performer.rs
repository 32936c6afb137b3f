//! The performer entity: one workload instance of a tenant.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ponos_backend::{UnitId, UnitInfo, UnitSpec};
use ponos_conn::ConnectionManager;
use ponos_core::config::PerformerSettings;
use ponos_core::{
    HealthRecord, ImageRef, PerformerId, PerformerInfo, Slot, StatusEvent, StatusKind, TenantId,
};

use crate::status::{StatusSender, StatusStream, status_channel};

/// Backend identity behind a performer. Replaced in place on recreation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitBinding {
    pub unit_id: UnitId,
    pub endpoint: String,
}

struct PerformerState {
    slot: Slot,
    health: HealthRecord,
    /// Current unit identity; changes only on recreation.
    unit: UnitBinding,
    /// Cleared once draining found the performer idle or it was retired;
    /// no new task may be tracked afterwards.
    accepting: bool,
}

/// One workload instance.
///
/// Mutable state sits behind a single per-performer mutex that is never
/// held across an await. The connection manager is swapped as a whole.
pub struct Performer {
    id: PerformerId,
    tenant: TenantId,
    image: ImageRef,
    created_at: DateTime<Utc>,
    state: Mutex<PerformerState>,
    in_flight: Arc<watch::Sender<usize>>,
    status: StatusSender,
    connection: ArcSwap<ConnectionManager>,
    cancel: CancellationToken,
}

impl Performer {
    /// A freshly created performer and the consumer end of its status
    /// stream. The unit is already running, so the container level starts
    /// out healthy.
    pub fn new(
        id: PerformerId,
        tenant: TenantId,
        image: ImageRef,
        unit: UnitBinding,
        connection: ConnectionManager,
        status_buffer: usize,
        cancel: CancellationToken,
    ) -> (Self, StatusStream) {
        let (status, stream) = status_channel(status_buffer);
        let (in_flight, _) = watch::channel(0usize);
        let performer = Self {
            id,
            tenant,
            image,
            created_at: Utc::now(),
            state: Mutex::new(PerformerState {
                slot: Slot::Staged,
                health: HealthRecord {
                    container_healthy: true,
                    ..HealthRecord::default()
                },
                unit,
                accepting: true,
            }),
            in_flight: Arc::new(in_flight),
            status,
            connection: ArcSwap::from_pointee(connection),
            cancel,
        };
        (performer, stream)
    }

    /// Stable identity; survives unit recreation.
    pub fn id(&self) -> &PerformerId {
        &self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current position in the tenant's slot state machine.
    pub fn slot(&self) -> Slot {
        self.state.lock().slot
    }

    pub(crate) fn set_slot(&self, slot: Slot) {
        self.state.lock().slot = slot;
    }

    /// Snapshot of the dual-level health record.
    pub fn health(&self) -> HealthRecord {
        self.state.lock().health.clone()
    }

    /// Mutate the health record under the performer lock.
    pub fn update_health<R>(&self, f: impl FnOnce(&mut HealthRecord) -> R) -> R {
        f(&mut self.state.lock().health)
    }

    pub fn unit(&self) -> UnitBinding {
        self.state.lock().unit.clone()
    }

    pub fn endpoint(&self) -> String {
        self.state.lock().unit.endpoint.clone()
    }

    /// Swap in a recreated unit, returning the previous binding.
    pub(crate) fn replace_unit(&self, unit: UnitBinding) -> UnitBinding {
        let mut state = self.state.lock();
        state.health = HealthRecord {
            container_healthy: true,
            ..HealthRecord::default()
        };
        std::mem::replace(&mut state.unit, unit)
    }

    /// The connection manager in use right now. Callers keep a clone for
    /// one call and reload it for the next.
    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.load_full()
    }

    /// Install a fresh connection manager and close the old one.
    pub fn replace_connection(&self, connection: ConnectionManager) {
        let old = self.connection.swap(Arc::new(connection));
        old.close();
    }

    /// Number of dispatched tasks not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Count one dispatched task until the guard is dropped.
    ///
    /// Returns `None` once the performer stopped accepting work. The check
    /// and the increment happen under the performer lock, so a drain that
    /// found the performer idle never races a late dispatch.
    pub fn track_task(&self) -> Option<TaskGuard> {
        let state = self.state.lock();
        if !state.accepting {
            return None;
        }
        self.in_flight.send_modify(|count| *count += 1);
        Some(TaskGuard {
            counter: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    /// Stop accepting tasks if none is in flight. Returns whether admission
    /// was closed.
    pub(crate) fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if *self.in_flight.borrow() > 0 {
            return false;
        }
        state.accepting = false;
        true
    }

    /// Resolve once the performer is idle and admits no more tasks.
    pub(crate) async fn wait_drained(&self) {
        loop {
            self.wait_idle().await;
            if self.close_if_idle() {
                return;
            }
        }
    }

    /// Resolve once no task is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Emit a status transition, best effort.
    pub fn emit(&self, kind: StatusKind, message: impl Into<String>) -> bool {
        self.status
            .emit(StatusEvent::new(self.id.clone(), kind, message))
    }

    /// Close the status stream. Returns `false` if it was already closed.
    pub fn close_status(&self) -> bool {
        self.status.close()
    }

    pub fn status_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Cancelled when the performer retires or the fleet shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the health loop, close the status stream and the connection.
    pub fn retire(&self) {
        self.state.lock().accepting = false;
        self.cancel.cancel();
        self.status.close();
        self.connection.load().close();
        debug!(performer_id = %self.id, tenant = %self.tenant, "performer retired");
    }

    /// Externally visible snapshot.
    pub fn info(&self) -> PerformerInfo {
        let state = self.state.lock();
        PerformerInfo {
            id: self.id.clone(),
            tenant: self.tenant.clone(),
            image: self.image.clone(),
            slot: state.slot,
            health: state.health.clone(),
            unit_id: state.unit.unit_id.to_string(),
            endpoint: state.unit.endpoint.clone(),
            in_flight: *self.in_flight.borrow(),
            created_at: self.created_at,
        }
    }
}

/// Decrements the in-flight count on every exit path, including
/// cancellation of the owning future and unwinding.
pub struct TaskGuard {
    counter: Arc<watch::Sender<usize>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// What to ask the backend for when materialising a performer.
pub fn unit_spec(
    performer_id: &PerformerId,
    tenant: &TenantId,
    image: &ImageRef,
    settings: &PerformerSettings,
) -> UnitSpec {
    let tenant_short = tenant.as_str().get(2..10).unwrap_or(tenant.as_str());
    let mut env: BTreeMap<String, String> = settings.env.clone();
    env.insert("PONOS_TENANT".to_string(), tenant.to_string());
    env.insert("PONOS_PERFORMER_ID".to_string(), performer_id.to_string());

    let mut labels = BTreeMap::new();
    labels.insert("ponos.tenant".to_string(), tenant.to_string());
    labels.insert("ponos.performer".to_string(), performer_id.to_string());
    labels.insert("ponos.image".to_string(), image.to_string());

    UnitSpec {
        name: format!("ponos-{tenant_short}-{performer_id}"),
        image: image.clone(),
        control_port: settings.control_port,
        env,
        labels,
    }
}

/// Control endpoint of a created unit, falling back to `<name>:<port>`
/// when the backend does not report one.
pub fn unit_endpoint(info: &UnitInfo, spec: &UnitSpec) -> String {
    info.endpoint
        .clone()
        .unwrap_or_else(|| format!("{}:{}", spec.name, spec.control_port))
}
