//! ponosd: the Ponos fleet daemon.
//!
//! Assembles a workload backend, a performer transport, the fleet manager
//! and the deployment orchestrator, rolls out the tenants listed in the
//! config file, then keeps the fleet supervised until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! ponosd run --config /etc/ponos/ponos.toml
//! ponosd check-config --config /etc/ponos/ponos.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ponos_backend::{InMemoryBackend, ProcessBackend, WorkloadBackend};
use ponos_conn::{Connector, HttpConnector, LoopbackConnector};
use ponos_core::config::{BackendKind, PonosConfig};
use ponos_core::{ImageRef, TenantId};
use ponos_fleet::{FleetManager, FleetSettings};
use ponos_rollout::DeploymentOrchestrator;

#[derive(Parser)]
#[command(name = "ponosd", about = "Ponos performer fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet and deploy the configured tenants.
    Run {
        /// Path to the TOML config. Defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a config file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Run { config } => {
            let config = load_config(config.as_deref())?;
            run(config).await
        }
        Command::CheckConfig { config } => {
            let config = PonosConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,ponosd=debug,ponos=debug"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PonosConfig> {
    match path {
        Some(path) => PonosConfig::from_file(path),
        None => {
            info!("no config file given, using defaults");
            Ok(PonosConfig::default())
        }
    }
}

/// Pair a backend with the transport that can reach its performers.
fn build_stack(config: &PonosConfig) -> (Arc<dyn WorkloadBackend>, Arc<dyn Connector>) {
    match config.backend.kind {
        BackendKind::Process => (
            Arc::new(ProcessBackend::new(config.backend.process.clone())),
            Arc::new(HttpConnector::new().with_task_timeout(config.performer.task_timeout)),
        ),
        BackendKind::Memory => (Arc::new(InMemoryBackend::new()), Arc::new(LoopbackConnector::new())),
    }
}

async fn run(config: PonosConfig) -> anyhow::Result<()> {
    let (backend, connector) = build_stack(&config);
    info!(backend = backend.name(), tenants = config.tenants.len(), "ponos daemon starting");

    let fleet = Arc::new(FleetManager::new(
        backend,
        connector,
        FleetSettings::from(&config),
    ));
    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        Arc::clone(&fleet),
        config.deployment.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut deployments = JoinSet::new();
    for requested in &config.tenants {
        let tenant = TenantId::parse(&requested.address)
            .with_context(|| format!("tenant {}", requested.address))?;
        let image = ImageRef::parse(&requested.image)
            .with_context(|| format!("image for tenant {}", requested.address))?;
        let timeout = requested.timeout;
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.child_token();
        deployments.spawn(async move {
            orchestrator.deploy(&tenant, &image, timeout, cancel).await
        });
    }

    let signal = tokio::signal::ctrl_c();
    tokio::pin!(signal);

    let mut interrupted = false;
    while !deployments.is_empty() {
        tokio::select! {
            joined = deployments.join_next() => match joined {
                Some(Ok(result)) if result.is_success() => info!(
                    tenant = %result.tenant,
                    deployment = %result.deployment_id,
                    performer = ?result.performer_id,
                    "deployment completed"
                ),
                Some(Ok(result)) => warn!(
                    tenant = %result.tenant,
                    deployment = %result.deployment_id,
                    status = %result.status,
                    error = ?result.error.as_ref().map(ToString::to_string),
                    "deployment did not complete"
                ),
                Some(Err(e)) => error!(error = %e, "deployment task failed"),
                None => break,
            },
            _ = &mut signal, if !interrupted => {
                info!("shutdown signal received, cancelling deployments");
                interrupted = true;
                cancel.cancel();
            }
        }
    }

    if !interrupted {
        info!(tenants = fleet.tenants().len(), "startup deployments finished, supervising fleet");
        signal.await.context("installing Ctrl-C handler")?;
        info!("shutdown signal received");
    }

    fleet.shutdown().await.context("shutting down the fleet")?;
    info!("ponos daemon stopped");
    Ok(())
}
