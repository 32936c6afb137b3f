//! Process backend: each unit is a local child process.
//!
//! The executable is looked up by image repository in the backend config.
//! A free loopback port is reserved per unit and handed to the performer
//! through `PONOS_PERFORMER_PORT`; the unit's endpoint is
//! `127.0.0.1:<port>`.
//!
//! Liveness monitoring polls the child's exit status. An exited child is
//! reported as `crashed` (or `oom_killed` for exit code 137) and, when
//! auto-restart is enabled, respawned up to `max_restarts` times before an
//! unrecoverable `restart_failed` is reported.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ponos_core::config::{LivenessSettings, ProcessBackendConfig};

use crate::backend::{LifecycleEvents, WorkloadBackend};
use crate::error::{BackendError, BackendResult};
use crate::unit::{
    LifecycleEvent, LifecycleKind, UNRECOVERABLE_MARKER, UnitId, UnitInfo, UnitSpec, UnitState,
};

const EVENT_BUFFER: usize = 64;
const OOM_EXIT_CODE: i32 = 137;
const RUNNING_POLL: Duration = Duration::from_millis(50);

/// A unit and the process currently behind it.
struct ProcessUnit {
    spec: UnitSpec,
    program: PathBuf,
    port: u16,
    child: Option<Child>,
    state: UnitState,
    restart_count: u32,
    created_at: chrono::DateTime<Utc>,
    /// Set while an explicit stop is in progress so the monitor stays quiet.
    stopping: bool,
    events: Option<mpsc::Sender<LifecycleEvent>>,
    monitor: Option<CancellationToken>,
}

impl ProcessUnit {
    fn info(&self, id: &UnitId) -> UnitInfo {
        UnitInfo {
            id: id.clone(),
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            state: self.state,
            endpoint: Some(format!("127.0.0.1:{}", self.port)),
            restart_count: self.restart_count,
            created_at: self.created_at,
        }
    }

    /// Refresh `state` from the child's exit status.
    fn poll_exit(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code();
                self.child = None;
                self.state = UnitState::Exited { code };
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, name = %self.spec.name, "failed to poll child status");
                None
            }
        }
    }

    fn spawn(&mut self, id: &UnitId, args: &[String], cwd: Option<&PathBuf>) -> BackendResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(&self.spec.env)
            .env("PONOS_PERFORMER_PORT", self.port.to_string())
            .env("PONOS_UNIT_ID", id.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|source| BackendError::Spawn {
            unit: id.clone(),
            source,
        })?;
        debug!(unit = %id, pid = ?child.id(), program = ?self.program, "performer process spawned");
        self.child = Some(child);
        self.state = UnitState::Running;
        Ok(())
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!(name = %self.spec.name, "lifecycle event dropped");
            }
        }
    }
}

/// Runs performers as local child processes.
pub struct ProcessBackend {
    config: Arc<ProcessBackendConfig>,
    units: Arc<parking_lot::Mutex<HashMap<UnitId, Arc<Mutex<ProcessUnit>>>>>,
    next_id: AtomicU64,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self {
            config: Arc::new(config),
            units: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    fn unit(&self, id: &UnitId) -> BackendResult<Arc<Mutex<ProcessUnit>>> {
        self.units
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.clone()))
    }
}

/// Reserve a free loopback port by binding to port 0.
fn reserve_port() -> BackendResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl WorkloadBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, spec: &UnitSpec) -> BackendResult<UnitInfo> {
        let program = self
            .config
            .images
            .get(&spec.image.repository)
            .cloned()
            .ok_or_else(|| BackendError::ImageNotSupported(spec.image.repository.clone()))?;
        let port = reserve_port()?;
        let id = UnitId::new(format!(
            "proc-{}-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            spec.name
        ));

        let unit = ProcessUnit {
            spec: spec.clone(),
            program,
            port,
            child: None,
            state: UnitState::Created,
            restart_count: 0,
            created_at: Utc::now(),
            stopping: false,
            events: None,
            monitor: None,
        };
        let info = unit.info(&id);
        self.units
            .lock()
            .insert(id.clone(), Arc::new(Mutex::new(unit)));
        info!(unit = %id, image = %spec.image, port, "process unit created");
        Ok(info)
    }

    async fn start(&self, id: &UnitId) -> BackendResult<()> {
        let unit = self.unit(id)?;
        let mut unit = unit.lock().await;
        if unit.child.is_some() {
            return Ok(());
        }
        unit.stopping = false;
        unit.spawn(id, &self.config.args, self.config.working_dir.as_ref())
    }

    async fn stop(&self, id: &UnitId, timeout: Duration) -> BackendResult<()> {
        let unit = self.unit(id)?;
        let mut unit = unit.lock().await;
        unit.stopping = true;
        let Some(mut child) = unit.child.take() else {
            return Ok(());
        };
        child.start_kill()?;
        let code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?.code(),
            Err(_) => {
                warn!(unit = %id, ?timeout, "process did not exit in time");
                None
            }
        };
        unit.state = UnitState::Exited { code };
        debug!(unit = %id, ?code, "process unit stopped");
        Ok(())
    }

    async fn remove(&self, id: &UnitId, force: bool) -> BackendResult<()> {
        let unit = self.unit(id)?;
        {
            let mut unit = unit.lock().await;
            if unit.poll_exit().is_none() && unit.child.is_some() {
                if !force {
                    return Err(BackendError::InvalidState {
                        unit: id.clone(),
                        state: unit.state,
                        action: "remove without force",
                    });
                }
                unit.stopping = true;
                if let Some(mut child) = unit.child.take() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            if let Some(token) = unit.monitor.take() {
                token.cancel();
            }
            unit.events = None;
        }
        self.units.lock().remove(id);
        info!(unit = %id, "process unit removed");
        Ok(())
    }

    async fn inspect(&self, id: &UnitId) -> BackendResult<UnitInfo> {
        let unit = self.unit(id)?;
        let mut unit = unit.lock().await;
        unit.poll_exit();
        Ok(unit.info(id))
    }

    async fn wait_until_running(&self, id: &UnitId, timeout: Duration) -> BackendResult<()> {
        let unit = self.unit(id)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut unit = unit.lock().await;
                if let Some(code) = unit.poll_exit() {
                    return Err(BackendError::InvalidState {
                        unit: id.clone(),
                        state: UnitState::Exited { code },
                        action: "wait until running",
                    });
                }
                if unit.state == UnitState::Running && unit.child.is_some() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::Timeout {
                    unit: id.clone(),
                    after: timeout,
                });
            }
            tokio::time::sleep(RUNNING_POLL).await;
        }
    }

    async fn start_liveness_monitoring(
        &self,
        id: &UnitId,
        config: &LivenessSettings,
    ) -> BackendResult<LifecycleEvents> {
        let handle = self.unit(id)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        {
            let mut unit = handle.lock().await;
            if let Some(old) = unit.monitor.replace(token.clone()) {
                old.cancel();
            }
            unit.events = Some(tx);
        }

        let id = id.clone();
        let config = config.clone();
        let backend_config = Arc::clone(&self.config);
        tokio::spawn(async move {
            run_liveness_loop(id, handle, config, backend_config, token).await;
        });
        Ok(rx)
    }

    async fn stop_liveness_monitoring(&self, id: &UnitId) {
        if let Ok(unit) = self.unit(id) {
            let mut unit = unit.lock().await;
            if let Some(token) = unit.monitor.take() {
                token.cancel();
            }
            unit.events = None;
        }
    }

    async fn trigger_restart(&self, id: &UnitId, reason: &str) -> BackendResult<()> {
        let unit = self.unit(id)?;
        let mut unit = unit.lock().await;
        info!(unit = %id, %reason, "restarting performer process");
        unit.emit(
            LifecycleEvent::new(id.clone(), LifecycleKind::Restarting, reason)
                .with_restart_count(unit.restart_count),
        );
        unit.state = UnitState::Restarting;
        if let Some(mut child) = unit.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        unit.restart_count += 1;
        match unit.spawn(id, &self.config.args, self.config.working_dir.as_ref()) {
            Ok(()) => {
                unit.emit(
                    LifecycleEvent::new(id.clone(), LifecycleKind::Restarted, "manual restart")
                        .with_restart_count(unit.restart_count),
                );
                Ok(())
            }
            Err(e) => {
                unit.emit(
                    LifecycleEvent::new(id.clone(), LifecycleKind::RestartFailed, e.to_string())
                        .with_restart_count(unit.restart_count),
                );
                Err(e)
            }
        }
    }
}

/// Poll one unit's process and report exits until cancelled.
async fn run_liveness_loop(
    id: UnitId,
    handle: Arc<Mutex<ProcessUnit>>,
    config: LivenessSettings,
    backend_config: Arc<ProcessBackendConfig>,
    cancel: CancellationToken,
) {
    debug!(unit = %id, interval = ?config.poll_interval, "liveness loop starting");
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let restart_count = {
            let mut unit = handle.lock().await;
            if unit.stopping {
                continue;
            }
            let Some(code) = unit.poll_exit() else {
                continue;
            };
            let kind = if code == Some(OOM_EXIT_CODE) {
                LifecycleKind::OomKilled
            } else {
                LifecycleKind::Crashed
            };
            warn!(unit = %id, ?code, %kind, "performer process exited");
            unit.emit(
                LifecycleEvent::new(id.clone(), kind, format!("process exited with {code:?}"))
                    .with_exit_code(code)
                    .with_restart_count(unit.restart_count),
            );

            if !config.auto_restart {
                continue;
            }
            if unit.restart_count >= config.max_restarts {
                unit.emit(
                    LifecycleEvent::new(
                        id.clone(),
                        LifecycleKind::RestartFailed,
                        format!(
                            "{UNRECOVERABLE_MARKER}: restart limit {} reached",
                            config.max_restarts
                        ),
                    )
                    .with_exit_code(code)
                    .with_restart_count(unit.restart_count),
                );
                break;
            }
            unit.state = UnitState::Restarting;
            unit.emit(
                LifecycleEvent::new(id.clone(), LifecycleKind::Restarting, "auto restart")
                    .with_restart_count(unit.restart_count),
            );
            unit.restart_count
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.restart_delay) => {}
        }

        let mut unit = handle.lock().await;
        if unit.stopping {
            continue;
        }
        unit.restart_count = restart_count + 1;
        match unit.spawn(&id, &backend_config.args, backend_config.working_dir.as_ref()) {
            Ok(()) => unit.emit(
                LifecycleEvent::new(id.clone(), LifecycleKind::Restarted, "auto restart complete")
                    .with_restart_count(unit.restart_count),
            ),
            Err(e) => unit.emit(
                LifecycleEvent::new(id.clone(), LifecycleKind::RestartFailed, e.to_string())
                    .with_restart_count(unit.restart_count),
            ),
        }
    }
    debug!(unit = %id, "liveness loop stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ponos_core::ImageRef;

    use super::*;

    fn spec(repository: &str) -> UnitSpec {
        UnitSpec {
            name: "p1".to_string(),
            image: ImageRef::parse(&format!("{repository}:v1")).unwrap(),
            control_port: 8080,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    fn backend_for(repository: &str, program: &str, args: &[&str]) -> ProcessBackend {
        let mut images = BTreeMap::new();
        images.insert(repository.to_string(), PathBuf::from(program));
        ProcessBackend::new(ProcessBackendConfig {
            images,
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
        })
    }

    #[tokio::test]
    async fn unknown_image_is_rejected() {
        let backend = backend_for("avs/performer", "/bin/sleep", &[]);
        let err = backend.create(&spec("other/image")).await.unwrap_err();
        assert!(matches!(err, BackendError::ImageNotSupported(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_and_stops_a_process() {
        let backend = backend_for("avs/performer", "/bin/sleep", &["30"]);
        let unit = backend.create(&spec("avs/performer")).await.unwrap();
        assert!(unit.endpoint.as_deref().unwrap().starts_with("127.0.0.1:"));

        backend.start(&unit.id).await.unwrap();
        backend
            .wait_until_running(&unit.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(backend.inspect(&unit.id).await.unwrap().state, UnitState::Running);

        backend.stop(&unit.id, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            backend.inspect(&unit.id).await.unwrap().state,
            UnitState::Exited { .. }
        ));
        backend.remove(&unit.id, false).await.unwrap();
        assert!(matches!(
            backend.inspect(&unit.id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_unrecoverable_after_restart_limit() {
        let backend = backend_for("avs/performer", "/bin/false", &[]);
        let unit = backend.create(&spec("avs/performer")).await.unwrap();
        let config = LivenessSettings {
            poll_interval: Duration::from_millis(20),
            auto_restart: true,
            max_restarts: 1,
            restart_delay: Duration::from_millis(10),
        };
        let mut events = backend
            .start_liveness_monitoring(&unit.id, &config)
            .await
            .unwrap();
        backend.start(&unit.id).await.unwrap();

        let mut kinds = Vec::new();
        let unrecoverable = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                kinds.push(event.kind);
                if event.is_unrecoverable() {
                    return event;
                }
            }
            panic!("event stream ended early");
        })
        .await
        .unwrap();

        assert_eq!(unrecoverable.restart_count, 1);
        assert!(kinds.contains(&LifecycleKind::Crashed));
        assert!(kinds.contains(&LifecycleKind::Restarted));
        backend.remove(&unit.id, true).await.unwrap();
    }
}
