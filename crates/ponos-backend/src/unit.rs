//! Units and the lifecycle events a backend reports for them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ponos_core::ImageRef;

/// Backend-assigned identifier of a compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to run for one performer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub image: ImageRef,
    /// Port the performer serves its control surface on.
    pub control_port: u16,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Lifecycle state of a unit as the backend sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Created,
    Running,
    Restarting,
    Exited { code: Option<i32> },
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Created => f.write_str("created"),
            UnitState::Running => f.write_str("running"),
            UnitState::Restarting => f.write_str("restarting"),
            UnitState::Exited { code: Some(code) } => write!(f, "exited({code})"),
            UnitState::Exited { code: None } => f.write_str("exited"),
        }
    }
}

/// Snapshot of a unit returned by `create` and `inspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub id: UnitId,
    pub name: String,
    pub image: ImageRef,
    pub state: UnitState,
    /// Address of the performer's control surface, once known.
    pub endpoint: Option<String>,
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Kind of infrastructure-level lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Healthy,
    Unhealthy,
    Crashed,
    OomKilled,
    Restarting,
    Restarted,
    RestartFailed,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleKind::Started => "started",
            LifecycleKind::Healthy => "healthy",
            LifecycleKind::Unhealthy => "unhealthy",
            LifecycleKind::Crashed => "crashed",
            LifecycleKind::OomKilled => "oom_killed",
            LifecycleKind::Restarting => "restarting",
            LifecycleKind::Restarted => "restarted",
            LifecycleKind::RestartFailed => "restart_failed",
        };
        f.write_str(s)
    }
}

/// Marker a backend puts in a `restart_failed` message when the unit
/// cannot be brought back and must be recreated.
pub const UNRECOVERABLE_MARKER: &str = "unrecoverable";

/// An event pushed by a backend while it monitors a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub unit_id: UnitId,
    pub kind: LifecycleKind,
    pub message: String,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(unit_id: UnitId, kind: LifecycleKind, message: impl Into<String>) -> Self {
        Self {
            unit_id,
            kind,
            message: message.into(),
            restart_count: 0,
            exit_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_restart_count(mut self, count: u32) -> Self {
        self.restart_count = count;
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// A failed restart after which the unit has to be recreated.
    pub fn is_unrecoverable(&self) -> bool {
        self.kind == LifecycleKind::RestartFailed
            && self.message.to_ascii_lowercase().contains(UNRECOVERABLE_MARKER)
    }
}
