//! In-memory backend: simulated units.
//!
//! Units never run anything: `start` flips them to running and the endpoint
//! is a synthetic `<name>.sim:<port>` address meant for the loopback
//! transport. Every call is recorded with a monotonic timestamp, failures
//! can be injected per operation, and lifecycle events can be pushed by
//! hand, which makes this backend the workhorse of the controller's tests
//! as well as the daemon's dry-run mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use ponos_core::config::LivenessSettings;

use crate::backend::{LifecycleEvents, WorkloadBackend};
use crate::error::{BackendError, BackendResult};
use crate::unit::{LifecycleEvent, LifecycleKind, UnitId, UnitInfo, UnitSpec, UnitState};

const EVENT_BUFFER: usize = 64;

/// Backend operation, used for call records and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    WaitUntilRunning,
    StartLiveness,
    StopLiveness,
    TriggerRestart,
}

/// One recorded backend call.
#[derive(Debug, Clone)]
pub struct BackendCall {
    pub op: Operation,
    pub unit_id: Option<UnitId>,
    pub at: Instant,
}

#[derive(Default)]
struct Inner {
    units: HashMap<UnitId, UnitInfo>,
    subscribers: HashMap<UnitId, mpsc::Sender<LifecycleEvent>>,
    calls: Vec<BackendCall>,
    failures: HashMap<Operation, u32>,
    next_id: u64,
}

/// Simulated workload backend. Cloning shares the same state.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
    /// Answer `trigger_restart` with `restarting` + `restarted` events.
    simulate_restarts: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            simulate_restarts: true,
        }
    }

    /// Do not emit lifecycle events in response to `trigger_restart`.
    pub fn without_simulated_restarts(mut self) -> Self {
        self.simulate_restarts = false;
        self
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: Operation, times: u32) {
        self.inner.lock().failures.insert(op, times);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    /// Recorded calls of one operation.
    pub fn calls_of(&self, op: Operation) -> Vec<BackendCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Units that exist (created and not removed).
    pub fn units(&self) -> Vec<UnitInfo> {
        let mut units: Vec<_> = self.inner.lock().units.values().cloned().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn unit(&self, id: &UnitId) -> Option<UnitInfo> {
        self.inner.lock().units.get(id).cloned()
    }

    /// Push a lifecycle event to the unit's monitor, as the real
    /// infrastructure would. Returns `false` if nobody is monitoring.
    pub fn emit(&self, id: &UnitId, kind: LifecycleKind, message: &str) -> bool {
        let mut inner = self.inner.lock();
        let restart_count = inner.units.get(id).map(|u| u.restart_count).unwrap_or(0);
        if let Some(unit) = inner.units.get_mut(id) {
            match kind {
                LifecycleKind::Crashed | LifecycleKind::OomKilled => {
                    unit.state = UnitState::Exited { code: None }
                }
                LifecycleKind::Restarting => unit.state = UnitState::Restarting,
                LifecycleKind::Restarted | LifecycleKind::Started => {
                    unit.state = UnitState::Running
                }
                _ => {}
            }
        }
        let event =
            LifecycleEvent::new(id.clone(), kind, message).with_restart_count(restart_count);
        match inner.subscribers.get(id) {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Record a call and consume an injected failure, if any.
    fn record(&self, op: Operation, unit_id: Option<&UnitId>) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall {
            op,
            unit_id: unit_id.cloned(),
            at: Instant::now(),
        });
        if let Some(remaining) = inner.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Other(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, spec: &UnitSpec) -> BackendResult<UnitInfo> {
        self.record(Operation::Create, None)?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = UnitId::new(format!("sim-{:04}", inner.next_id));
        let info = UnitInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            state: UnitState::Created,
            endpoint: Some(format!("{}.sim:{}", spec.name, spec.control_port)),
            restart_count: 0,
            created_at: Utc::now(),
        };
        inner.units.insert(id.clone(), info.clone());
        debug!(unit = %id, name = %spec.name, image = %spec.image, "simulated unit created");
        Ok(info)
    }

    async fn start(&self, id: &UnitId) -> BackendResult<()> {
        self.record(Operation::Start, Some(id))?;
        let mut inner = self.inner.lock();
        let unit = inner
            .units
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.clone()))?;
        unit.state = UnitState::Running;
        Ok(())
    }

    async fn stop(&self, id: &UnitId, _timeout: Duration) -> BackendResult<()> {
        self.record(Operation::Stop, Some(id))?;
        let mut inner = self.inner.lock();
        let unit = inner
            .units
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.clone()))?;
        unit.state = UnitState::Exited { code: Some(0) };
        Ok(())
    }

    async fn remove(&self, id: &UnitId, force: bool) -> BackendResult<()> {
        self.record(Operation::Remove, Some(id))?;
        let mut inner = self.inner.lock();
        let state = inner
            .units
            .get(id)
            .map(|u| u.state)
            .ok_or_else(|| BackendError::NotFound(id.clone()))?;
        if state == UnitState::Running && !force {
            return Err(BackendError::InvalidState {
                unit: id.clone(),
                state,
                action: "remove without force",
            });
        }
        inner.units.remove(id);
        inner.subscribers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &UnitId) -> BackendResult<UnitInfo> {
        self.record(Operation::Inspect, Some(id))?;
        self.unit(id).ok_or_else(|| BackendError::NotFound(id.clone()))
    }

    async fn wait_until_running(&self, id: &UnitId, timeout: Duration) -> BackendResult<()> {
        if self.record(Operation::WaitUntilRunning, Some(id)).is_err() {
            return Err(BackendError::Timeout {
                unit: id.clone(),
                after: timeout,
            });
        }
        let unit = self.unit(id).ok_or_else(|| BackendError::NotFound(id.clone()))?;
        match unit.state {
            UnitState::Running => Ok(()),
            state => Err(BackendError::InvalidState {
                unit: id.clone(),
                state,
                action: "wait until running",
            }),
        }
    }

    async fn start_liveness_monitoring(
        &self,
        id: &UnitId,
        _config: &LivenessSettings,
    ) -> BackendResult<LifecycleEvents> {
        self.record(Operation::StartLiveness, Some(id))?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut inner = self.inner.lock();
        if !inner.units.contains_key(id) {
            return Err(BackendError::NotFound(id.clone()));
        }
        inner.subscribers.insert(id.clone(), tx);
        Ok(rx)
    }

    async fn stop_liveness_monitoring(&self, id: &UnitId) {
        let _ = self.record(Operation::StopLiveness, Some(id));
        self.inner.lock().subscribers.remove(id);
    }

    async fn trigger_restart(&self, id: &UnitId, reason: &str) -> BackendResult<()> {
        self.record(Operation::TriggerRestart, Some(id))?;
        {
            let mut inner = self.inner.lock();
            let unit = inner
                .units
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.clone()))?;
            unit.restart_count += 1;
        }
        debug!(unit = %id, %reason, "simulated restart requested");
        if self.simulate_restarts {
            self.emit(id, LifecycleKind::Restarting, reason);
            self.emit(id, LifecycleKind::Restarted, "restart complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ponos_core::ImageRef;

    use super::*;

    fn spec(name: &str) -> UnitSpec {
        UnitSpec {
            name: name.to_string(),
            image: ImageRef::parse("avs/performer:v1").unwrap(),
            control_port: 8080,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_start_and_remove() {
        let backend = InMemoryBackend::new();
        let unit = backend.create(&spec("p1")).await.unwrap();
        assert_eq!(unit.state, UnitState::Created);
        assert_eq!(unit.endpoint.as_deref(), Some("p1.sim:8080"));

        backend.start(&unit.id).await.unwrap();
        backend
            .wait_until_running(&unit.id, Duration::from_secs(1))
            .await
            .unwrap();

        // A running unit needs force.
        assert!(backend.remove(&unit.id, false).await.is_err());
        backend.remove(&unit.id, true).await.unwrap();
        assert!(backend.units().is_empty());
        assert_eq!(backend.count(Operation::Remove), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = InMemoryBackend::new();
        backend.fail_next(Operation::Create, 1);
        assert!(backend.create(&spec("p1")).await.is_err());
        assert!(backend.create(&spec("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn wait_until_running_requires_start() {
        let backend = InMemoryBackend::new();
        let unit = backend.create(&spec("p1")).await.unwrap();
        let err = backend
            .wait_until_running(&unit.id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn emitted_events_reach_the_monitor() {
        let backend = InMemoryBackend::new();
        let unit = backend.create(&spec("p1")).await.unwrap();
        backend.start(&unit.id).await.unwrap();

        let mut events = backend
            .start_liveness_monitoring(&unit.id, &LivenessSettings::default())
            .await
            .unwrap();
        assert!(backend.emit(&unit.id, LifecycleKind::Crashed, "segfault"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, LifecycleKind::Crashed);
        assert_eq!(event.message, "segfault");

        backend.stop_liveness_monitoring(&unit.id).await;
        assert!(events.recv().await.is_none());
        assert!(!backend.emit(&unit.id, LifecycleKind::Started, ""));
    }

    #[tokio::test]
    async fn trigger_restart_simulates_restart_events() {
        let backend = InMemoryBackend::new();
        let unit = backend.create(&spec("p1")).await.unwrap();
        backend.start(&unit.id).await.unwrap();
        let mut events = backend
            .start_liveness_monitoring(&unit.id, &LivenessSettings::default())
            .await
            .unwrap();

        backend.trigger_restart(&unit.id, "probe failures").await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind, LifecycleKind::Restarting);
        let restarted = events.recv().await.unwrap();
        assert_eq!(restarted.kind, LifecycleKind::Restarted);
        assert_eq!(restarted.restart_count, 1);
        assert_eq!(backend.unit(&unit.id).unwrap().state, UnitState::Running);
    }
}
