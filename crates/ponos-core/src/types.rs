//! Domain types shared across Ponos crates.
//!
//! These types describe tenants, performers, their slots and health, the
//! status events raised for them, and the task payloads sent to them.
//! All of them serialize to JSON for logs, snapshots and the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while parsing identifiers and image references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid tenant address `{0}`: expected 0x followed by 40 hex digits")]
    Tenant(String),

    #[error("invalid image reference `{reference}`: {reason}")]
    Image {
        reference: String,
        reason: &'static str,
    },
}

// ── Tenant ────────────────────────────────────────────────────────

/// Address of the AVS that owns a performer fleet.
///
/// Always held in canonical form: lower-case `0x` followed by 40 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parse and canonicalize an AVS address.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let canonical = raw.trim().to_ascii_lowercase();
        let digits = canonical
            .strip_prefix("0x")
            .ok_or_else(|| ParseError::Tenant(raw.to_string()))?;
        if digits.len() != 40 || hex::decode(digits).is_err() {
            return Err(ParseError::Tenant(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

// ── Identifiers ───────────────────────────────────────────────────

/// Unique identifier of a performer.
///
/// Generated once at creation and kept when the backend unit behind the
/// performer is recreated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformerId(String);

impl PerformerId {
    pub fn generate() -> Self {
        Self(format!("performer-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PerformerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PerformerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PerformerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier of a deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn generate() -> Self {
        Self(format!("deploy-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeploymentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Image ─────────────────────────────────────────────────────────

/// Reference to a performer image: `repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    /// Content digest, e.g. `sha256:…`.
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        let invalid = |reason| ParseError::Image {
            reference: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("empty reference"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                match digest.split_once(':') {
                    Some((algo, hash)) if !algo.is_empty() && !hash.is_empty() => {}
                    _ => return Err(invalid("digest must be algorithm:hash")),
                }
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // Only a colon in the final path segment is a tag; earlier ones
        // belong to a registry host:port.
        let segment_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[segment_start..].rfind(':') {
            Some(offset) => {
                let idx = segment_start + offset;
                (&name[..idx], &name[idx + 1..])
            }
            None => (name, "latest"),
        };

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        if tag.is_empty() {
            return Err(invalid("empty tag"));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.to_string()
    }
}

// ── Performer ─────────────────────────────────────────────────────

/// Role a performer currently occupies in its tenant's fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// Registered as "next", being validated.
    Staged,
    /// "Current": receives tasks.
    InService,
    /// Retiring; finishing in-flight tasks before teardown.
    Draining,
    Removed,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Slot::Staged => "staged",
            Slot::InService => "in_service",
            Slot::Draining => "draining",
            Slot::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Two-level health of a performer.
///
/// `container_healthy` tracks the backend unit (infrastructure liveness),
/// `application_healthy` tracks the performer's own readiness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub container_healthy: bool,
    pub application_healthy: bool,
    pub consecutive_app_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// Both levels healthy: the only state in which promotion is allowed.
    pub fn is_ready(&self) -> bool {
        self.container_healthy && self.application_healthy
    }
}

/// Point-in-time metadata for one performer, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformerInfo {
    pub id: PerformerId,
    pub tenant: TenantId,
    pub image: ImageRef,
    pub slot: Slot,
    pub health: HealthRecord,
    /// Backend identity of the unit currently behind this performer.
    pub unit_id: String,
    pub endpoint: String,
    pub in_flight: usize,
    pub created_at: DateTime<Utc>,
}

// ── Status events ─────────────────────────────────────────────────

/// Kind of status transition raised for a performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Application probe succeeded.
    Healthy,
    /// Application probe failed (or was skipped on an open circuit).
    Unhealthy,
    /// The backend reported the unit crashed, was OOM-killed, or is restarting.
    ContainerDown,
    /// The unit restarted and the control channel was re-established.
    Restarted,
    /// The unit was unrecoverable and has been replaced by a fresh one.
    Recreated,
    /// Repeated probe failures escalated to a backend restart.
    RestartRequested,
}

/// A status transition for one performer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub performer_id: PerformerId,
    pub kind: StatusKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(performer_id: PerformerId, kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            performer_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// A unit of work dispatched to the current performer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_id: task_id.into(),
            payload: payload.into(),
        }
    }
}

/// Output returned by a performer for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(with = "hex_bytes")]
    pub output: Vec<u8>,
}

/// Byte fields travel as hex strings in JSON bodies.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        let raw = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
