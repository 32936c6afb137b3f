//! In-process transport for simulated performers.
//!
//! Every endpoint has a reachability switch (connects and readiness) and a
//! health switch (`health_check`). Endpoints nobody configured use the
//! connector-wide defaults. Tasks go through a replaceable handler after an
//! optional artificial latency; the default handler echoes the payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use ponos_core::{TaskRequest, TaskResult};

use crate::error::{ConnError, ConnResult};
use crate::transport::{ChannelState, Connector, PerformerChannel};

/// Handles one task for the given endpoint.
pub type TaskHandler = Arc<dyn Fn(&str, TaskRequest) -> ConnResult<TaskResult> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct EndpointSwitches {
    reachable: bool,
    healthy: bool,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    health_checks: AtomicUsize,
    tasks: AtomicUsize,
}

struct Shared {
    defaults: Mutex<EndpointSwitches>,
    endpoints: Mutex<HashMap<String, EndpointSwitches>>,
    latency: Mutex<Duration>,
    handler: RwLock<TaskHandler>,
    counters: Counters,
}

impl Shared {
    fn switches(&self, endpoint: &str) -> EndpointSwitches {
        self.endpoints
            .lock()
            .get(endpoint)
            .copied()
            .unwrap_or(*self.defaults.lock())
    }

    fn update(&self, endpoint: &str, f: impl FnOnce(&mut EndpointSwitches)) {
        let defaults = *self.defaults.lock();
        let mut endpoints = self.endpoints.lock();
        f(endpoints.entry(endpoint.to_string()).or_insert(defaults));
    }
}

/// Connector serving simulated performers in the current process.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    /// All endpoints reachable and healthy, zero latency, echo handler.
    pub fn new() -> Self {
        let echo: TaskHandler = Arc::new(|_: &str, task: TaskRequest| {
            Ok(TaskResult {
                task_id: task.task_id,
                output: task.payload,
            })
        });
        Self {
            shared: Arc::new(Shared {
                defaults: Mutex::new(EndpointSwitches {
                    reachable: true,
                    healthy: true,
                }),
                endpoints: Mutex::new(HashMap::new()),
                latency: Mutex::new(Duration::ZERO),
                handler: RwLock::new(echo),
                counters: Counters::default(),
            }),
        }
    }

    /// Health reported by endpoints without an explicit switch.
    pub fn set_default_healthy(&self, healthy: bool) {
        self.shared.defaults.lock().healthy = healthy;
    }

    /// Reachability of endpoints without an explicit switch.
    pub fn set_default_reachable(&self, reachable: bool) {
        self.shared.defaults.lock().reachable = reachable;
    }

    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        self.shared.update(endpoint, |s| s.reachable = reachable);
    }

    pub fn set_healthy(&self, endpoint: &str, healthy: bool) {
        self.shared.update(endpoint, |s| s.healthy = healthy);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&str, TaskRequest) -> ConnResult<TaskResult> + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Arc::new(handler);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.counters.connects.load(Ordering::Relaxed)
    }

    pub fn health_check_count(&self) -> usize {
        self.shared.counters.health_checks.load(Ordering::Relaxed)
    }

    pub fn task_count(&self) -> usize {
        self.shared.counters.tasks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, endpoint: &str) -> ConnResult<Arc<dyn PerformerChannel>> {
        self.shared.counters.connects.fetch_add(1, Ordering::Relaxed);
        if !self.shared.switches(endpoint).reachable {
            return Err(ConnError::Unavailable(format!("{endpoint} is not reachable")));
        }
        Ok(Arc::new(LoopbackChannel {
            endpoint: endpoint.to_string(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackChannel {
    endpoint: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl LoopbackChannel {
    fn check_open(&self) -> ConnResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        if !self.shared.switches(&self.endpoint).reachable {
            return Err(ConnError::Unavailable(format!(
                "{} is not reachable",
                self.endpoint
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PerformerChannel for LoopbackChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::Acquire) {
            ChannelState::Shutdown
        } else if self.shared.switches(&self.endpoint).reachable {
            ChannelState::Ready
        } else {
            ChannelState::TransientFailure
        }
    }

    async fn wait_ready(&self) -> ConnResult<()> {
        self.check_open()
    }

    async fn health_check(&self) -> ConnResult<()> {
        self.check_open()?;
        self.shared.counters.health_checks.fetch_add(1, Ordering::Relaxed);
        if self.shared.switches(&self.endpoint).healthy {
            Ok(())
        } else {
            Err(ConnError::Unavailable(format!(
                "{} reports not ready",
                self.endpoint
            )))
        }
    }

    async fn execute_task(&self, task: TaskRequest) -> ConnResult<TaskResult> {
        self.check_open()?;
        self.shared.counters.tasks.fetch_add(1, Ordering::Relaxed);
        let latency = *self.shared.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let handler = Arc::clone(&*self.shared.handler.read());
        handler(&self.endpoint, task)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_tasks_by_default() {
        let connector = LoopbackConnector::new();
        let channel = connector.connect("p1.sim:8080").await.unwrap();
        channel.wait_ready().await.unwrap();
        channel.health_check().await.unwrap();

        let result = channel
            .execute_task(TaskRequest::new("t1", b"abc".to_vec()))
            .await
            .unwrap();
        assert_eq!(result.task_id, "t1");
        assert_eq!(result.output, b"abc");
        assert_eq!(connector.task_count(), 1);
    }

    #[tokio::test]
    async fn switches_are_per_endpoint() {
        let connector = LoopbackConnector::new();
        connector.set_reachable("down.sim:8080", false);
        connector.set_healthy("sick.sim:8080", false);

        assert!(matches!(
            connector.connect("down.sim:8080").await.err(),
            Some(ConnError::Unavailable(_))
        ));
        let sick = connector.connect("sick.sim:8080").await.unwrap();
        assert!(sick.health_check().await.is_err());
        let fine = connector.connect("fine.sim:8080").await.unwrap();
        assert!(fine.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn closed_channel_rejects_calls() {
        let connector = LoopbackConnector::new();
        let channel = connector.connect("p1.sim:8080").await.unwrap();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Shutdown);
        assert!(matches!(
            channel.health_check().await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn custom_handler_sees_endpoint() {
        let connector = LoopbackConnector::new();
        connector.set_handler(|endpoint, task| {
            Ok(TaskResult {
                task_id: task.task_id,
                output: endpoint.as_bytes().to_vec(),
            })
        });
        let channel = connector.connect("p2.sim:8080").await.unwrap();
        let result = channel
            .execute_task(TaskRequest::new("t2", Vec::new()))
            .await
            .unwrap();
        assert_eq!(result.output, b"p2.sim:8080");
    }
}
