//! Dual-level health: backend liveness events plus application probes.

pub mod monitor;
pub mod tracker;

pub use monitor::HealthMonitor;
pub use tracker::{HealthTracker, LifecycleAction, ProbeVerdict};
