//! ponos.toml configuration parser.
//!
//! Every section is optional and falls back to its `Default`, so an empty
//! file is a valid configuration running the simulated backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};

use crate::duration::{serde_opt, serde_str};
use crate::types::{ImageRef, TenantId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PonosConfig {
    pub backend: BackendConfig,
    pub connection: ConnectionSettings,
    pub health: HealthSettings,
    pub liveness: LivenessSettings,
    pub drain: DrainSettings,
    pub deployment: DeploymentSettings,
    pub performer: PerformerSettings,
    /// Deployments performed when the daemon starts.
    pub tenants: Vec<TenantDeployment>,
}

// ── Backend ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local child processes.
    Process,
    /// Simulated units, paired with the loopback transport.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub process: ProcessBackendConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Image repository → executable run for units of that image.
    pub images: BTreeMap<String, PathBuf>,
    /// Extra arguments passed to every performer process.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

// ── Connection ────────────────────────────────────────────────────

/// Retry, backoff and circuit-breaker parameters for performer channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    #[serde(with = "serde_str")]
    pub initial_delay: Duration,
    #[serde(with = "serde_str")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    /// Upper bound for a single connect-and-become-ready attempt.
    #[serde(with = "serde_str")]
    pub connection_timeout: Duration,
    /// Failures tolerated before the circuit may open.
    pub circuit_failure_threshold: u32,
    /// How long since the last healthy moment before the circuit may open.
    #[serde(with = "serde_str")]
    pub circuit_cooldown: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 5,
            connection_timeout: Duration::from_secs(10),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "serde_str")]
    pub application_check_interval: Duration,
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
    /// Consecutive failed probes that trigger a backend restart.
    pub escalation_threshold: u32,
    /// Pause after a `restarted` event before reconnecting.
    #[serde(with = "serde_str")]
    pub restart_settle_delay: Duration,
    /// Capacity of each performer's status stream.
    pub status_buffer: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            application_check_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(1),
            escalation_threshold: 3,
            restart_settle_delay: Duration::from_secs(2),
            status_buffer: 32,
        }
    }
}

/// Infrastructure-level liveness monitoring performed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
    pub auto_restart: bool,
    pub max_restarts: u32,
    #[serde(with = "serde_str")]
    pub restart_delay: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            auto_restart: true,
            max_restarts: 5,
            restart_delay: Duration::from_secs(1),
        }
    }
}

// ── Drain / deployment / performer ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSettings {
    /// Grace period handed to the backend when stopping a drained unit.
    #[serde(with = "serde_str")]
    pub stop_timeout: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    #[serde(with = "serde_str")]
    pub default_timeout: Duration,
    /// Fresh deadline for removing a staged performer after a failed deployment.
    #[serde(with = "serde_str")]
    pub cleanup_timeout: Duration,
    /// How often a waiting deployment re-reads the health record.
    #[serde(with = "serde_str")]
    pub progress_interval: Duration,
    /// Finished deployments kept for inspection.
    pub history_limit: usize,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            cleanup_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_secs(5),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformerSettings {
    /// How long a freshly created unit may take to reach "running".
    #[serde(with = "serde_str")]
    pub startup_timeout: Duration,
    /// Port the performer serves its control surface on inside its unit.
    pub control_port: u16,
    /// Upper bound for one task execution; unset means no bound.
    #[serde(with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub task_timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl Default for PerformerSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            control_port: 8080,
            task_timeout: None,
            env: BTreeMap::new(),
        }
    }
}

/// A tenant deployment requested at daemon startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDeployment {
    pub address: String,
    pub image: String,
    #[serde(default, with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl PonosConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: PonosConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let conn = &self.connection;
        ensure!(conn.max_retries >= 1, "connection.max_retries must be at least 1");
        ensure!(
            conn.multiplier >= 1.0,
            "connection.multiplier must be >= 1.0, got {}",
            conn.multiplier
        );
        ensure!(
            conn.initial_delay <= conn.max_delay,
            "connection.initial_delay must not exceed connection.max_delay"
        );
        ensure!(
            !conn.connection_timeout.is_zero(),
            "connection.connection_timeout must be positive"
        );

        let health = &self.health;
        ensure!(
            !health.application_check_interval.is_zero(),
            "health.application_check_interval must be positive"
        );
        ensure!(
            !health.probe_timeout.is_zero(),
            "health.probe_timeout must be positive"
        );
        ensure!(
            health.escalation_threshold >= 1,
            "health.escalation_threshold must be at least 1"
        );
        ensure!(health.status_buffer >= 1, "health.status_buffer must be at least 1");

        ensure!(
            !self.liveness.poll_interval.is_zero(),
            "liveness.poll_interval must be positive"
        );
        ensure!(
            !self.deployment.default_timeout.is_zero(),
            "deployment.default_timeout must be positive"
        );
        ensure!(
            !self.deployment.progress_interval.is_zero(),
            "deployment.progress_interval must be positive"
        );

        if self.backend.kind == BackendKind::Process {
            ensure!(
                !self.backend.process.images.is_empty(),
                "backend.process.images must map at least one image repository"
            );
        }

        for tenant in &self.tenants {
            TenantId::parse(&tenant.address)?;
            ImageRef::parse(&tenant.image)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PonosConfig::from_toml("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.connection, ConnectionSettings::default());
        assert_eq!(config.health.application_check_interval, Duration::from_secs(15));
        assert_eq!(config.health.escalation_threshold, 3);
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn parses_durations_and_tenants() {
        let config = PonosConfig::from_toml(
            r#"
[connection]
initial_delay = "250ms"
max_delay = "5s"
max_retries = 3

[health]
application_check_interval = "30s"
probe_timeout = "2s"

[performer]
task_timeout = "2m"

[[tenants]]
address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
image = "avs/performer:v1"
timeout = "90s"
"#,
        )
        .unwrap();

        assert_eq!(config.connection.initial_delay, Duration::from_millis(250));
        assert_eq!(config.connection.max_delay, Duration::from_secs(5));
        assert_eq!(config.connection.max_retries, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.connection.multiplier, 2.0);
        assert_eq!(config.health.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.performer.task_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn rejects_invalid_duration_strings() {
        let err = PonosConfig::from_toml("[health]\nprobe_timeout = \"soon\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("invalid duration"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = PonosConfig::default();
        config.connection.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = PonosConfig::default();
        config.connection.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = PonosConfig::default();
        config.health.status_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn process_backend_requires_image_map() {
        let err = PonosConfig::from_toml("[backend]\nkind = \"process\"\n").unwrap_err();
        assert!(err.to_string().contains("backend.process.images"));

        let config = PonosConfig::from_toml(
            "[backend]\nkind = \"process\"\n[backend.process.images]\n\"avs/performer\" = \"/usr/local/bin/performer\"\n",
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Process);
    }

    #[test]
    fn validate_rejects_bad_tenant_entries() {
        let err = PonosConfig::from_toml(
            "[[tenants]]\naddress = \"not-an-address\"\nimage = \"avs/performer\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("tenant"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = PonosConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("application_check_interval = \"15s\""));
        let back = PonosConfig::from_toml(&rendered).unwrap();
        assert_eq!(back.health, config.health);
        assert_eq!(back.deployment, config.deployment);
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[drain]\nstop_timeout = \"45s\"").unwrap();
        let config = PonosConfig::from_file(file.path()).unwrap();
        assert_eq!(config.drain.stop_timeout, Duration::from_secs(45));
    }
}
