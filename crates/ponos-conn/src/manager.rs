//! Resilient control connection to one performer endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use ponos_core::config::ConnectionSettings;
use ponos_core::{TaskRequest, TaskResult};

use crate::backoff::RetryPolicy;
use crate::circuit::CircuitState;
use crate::error::{ConnError, ConnResult};
use crate::transport::{Connector, PerformerChannel};

/// Owns the cached control channel to one endpoint.
///
/// Connects lazily, retries transient failures with exponential backoff,
/// and keeps the failure history the circuit breaker is derived from.
/// Concurrent callers share one connect attempt.
pub struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    connection_timeout: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    circuit: parking_lot::Mutex<CircuitState>,
    channel: parking_lot::Mutex<Option<Arc<dyn PerformerChannel>>>,
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: &ConnectionSettings,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            policy: RetryPolicy::from_settings(settings),
            connection_timeout: settings.connection_timeout,
            failure_threshold: settings.circuit_failure_threshold,
            cooldown: settings.circuit_cooldown,
            circuit: parking_lot::Mutex::new(CircuitState::new(Instant::now())),
            channel: parking_lot::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Start from a given failure history instead of a clean one.
    pub fn with_circuit_state(self, state: CircuitState) -> Self {
        *self.circuit.lock() = state;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Copy of the failure history behind the breaker.
    pub fn circuit_state(&self) -> CircuitState {
        *self.circuit.lock()
    }

    /// Pure read of the breaker at the current instant.
    pub fn is_circuit_open(&self) -> bool {
        self.circuit
            .lock()
            .is_open_at(Instant::now(), self.failure_threshold, self.cooldown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Return a ready channel, reconnecting if the cached one went stale.
    pub async fn get_channel(&self) -> ConnResult<Arc<dyn PerformerChannel>> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if let Some(channel) = self.cached_channel() {
            self.circuit.lock().record_success(Instant::now());
            return Ok(channel);
        }

        let _connecting = self.connect_lock.lock().await;
        if let Some(channel) = self.cached_channel() {
            self.circuit.lock().record_success(Instant::now());
            return Ok(channel);
        }

        // Counts as a failure unless it resolves, so a caller timing out
        // mid-backoff still feeds the breaker.
        let pending = PendingConnect::new(&self.circuit);
        match self.connect_with_retry().await {
            Ok(channel) => {
                pending.disarm();
                if self.is_closed() {
                    channel.close();
                    return Err(ConnError::Closed);
                }
                *self.channel.lock() = Some(Arc::clone(&channel));
                self.circuit.lock().record_success(Instant::now());
                Ok(channel)
            }
            Err(e) => {
                let failures = pending.fail();
                warn!(endpoint = %self.endpoint, failures, error = %e, "performer connection failed");
                Err(e)
            }
        }
    }

    /// Count a failure observed outside `get_channel`, such as a call on an
    /// established channel that never answered.
    pub fn record_failure(&self) -> u32 {
        let mut circuit = self.circuit.lock();
        circuit.record_failure();
        circuit.consecutive_failures
    }

    /// Readiness probe bounded by `limit` as a whole.
    ///
    /// A timeout while connecting is counted by `get_channel`; a timeout
    /// on the established channel is counted here.
    pub async fn health_check_within(&self, limit: Duration) -> ConnResult<()> {
        let deadline = Instant::now() + limit;
        let timed_out = || ConnError::Timeout(format!("health check of {} exceeded {limit:?}", self.endpoint));

        let channel = tokio::time::timeout_at(deadline, self.get_channel())
            .await
            .map_err(|_| timed_out())??;
        match tokio::time::timeout_at(deadline, channel.health_check()).await {
            Ok(result) => result,
            Err(_) => {
                let failures = self.record_failure();
                debug!(endpoint = %self.endpoint, failures, "health check timed out on an open channel");
                Err(timed_out())
            }
        }
    }

    /// Probe the performer's readiness over a fresh or cached channel.
    pub async fn health_check(&self) -> ConnResult<()> {
        self.get_channel().await?.health_check().await
    }

    /// Send one task. Only acquiring the channel is retried; the task itself
    /// is sent once.
    pub async fn execute_task(&self, task: TaskRequest) -> ConnResult<TaskResult> {
        self.get_channel().await?.execute_task(task).await
    }

    /// Release the cached channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        debug!(endpoint = %self.endpoint, "connection manager closed");
    }

    /// The cached channel if it can be reused; a stale one is closed and dropped.
    fn cached_channel(&self) -> Option<Arc<dyn PerformerChannel>> {
        let mut slot = self.channel.lock();
        let channel = slot.as_ref()?;
        let state = channel.state();
        if state.is_usable() {
            return Some(Arc::clone(channel));
        }
        debug!(endpoint = %self.endpoint, %state, "dropping stale channel");
        if let Some(stale) = slot.take() {
            stale.close();
        }
        None
    }

    async fn connect_with_retry(&self) -> ConnResult<Arc<dyn PerformerChannel>> {
        let attempts = self.policy.max_retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(ConnError::Closed);
            }
            match self.connect_once().await {
                Ok(channel) => {
                    if attempt > 1 {
                        info!(endpoint = %self.endpoint, attempt, "performer connection established after retry");
                    }
                    return Ok(channel);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(endpoint = %self.endpoint, attempt, error = %e, "connect attempt failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }
        Err(ConnError::RetriesExhausted {
            endpoint: self.endpoint.clone(),
            attempts,
            last: Box::new(last.unwrap_or_else(|| ConnError::Unavailable(self.endpoint.clone()))),
        })
    }

    /// One bounded attempt: connect, then wait for readiness.
    async fn connect_once(&self) -> ConnResult<Arc<dyn PerformerChannel>> {
        let attempt = async {
            let channel = self.connector.connect(&self.endpoint).await?;
            if let Err(e) = channel.wait_ready().await {
                channel.close();
                return Err(e);
            }
            Ok(channel)
        };
        tokio::time::timeout(self.connection_timeout, attempt)
            .await
            .map_err(|_| {
                ConnError::Timeout(format!(
                    "connect to {} exceeded {:?}",
                    self.endpoint, self.connection_timeout
                ))
            })?
    }
}

/// Records a connection failure when dropped while still armed.
struct PendingConnect<'a> {
    circuit: &'a parking_lot::Mutex<CircuitState>,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(circuit: &'a parking_lot::Mutex<CircuitState>) -> Self {
        Self { circuit, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    /// Record the failure now and return the new failure count.
    fn fail(mut self) -> u32 {
        self.armed = false;
        let mut circuit = self.circuit.lock();
        circuit.record_failure();
        circuit.consecutive_failures
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.circuit.lock().record_failure();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.get_mut().take() {
            channel.close();
        }
    }
}
