//! Health record bookkeeping.
//!
//! Pure state transitions on a `HealthRecord`; the monitor loop decides
//! what to do with the verdicts.

use chrono::{DateTime, Utc};

use ponos_backend::{LifecycleEvent, LifecycleKind};
use ponos_core::HealthRecord;

/// How a lifecycle event affects a performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// The unit is up.
    ContainerUp,
    /// The unit went down or is restarting.
    ContainerDown,
    /// The backend brought the unit back.
    Restarted,
    /// The unit cannot be restarted and must be replaced.
    Recreate,
}

impl LifecycleAction {
    pub fn for_event(event: &LifecycleEvent) -> Self {
        match event.kind {
            LifecycleKind::Started | LifecycleKind::Healthy => LifecycleAction::ContainerUp,
            LifecycleKind::Unhealthy
            | LifecycleKind::Crashed
            | LifecycleKind::OomKilled
            | LifecycleKind::Restarting => LifecycleAction::ContainerDown,
            LifecycleKind::Restarted => LifecycleAction::Restarted,
            LifecycleKind::RestartFailed if event.is_unrecoverable() => LifecycleAction::Recreate,
            LifecycleKind::RestartFailed => LifecycleAction::ContainerDown,
        }
    }
}

/// Outcome of a recorded probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Unhealthy { failures: u32 },
    /// The threshold was reached; the counter has been reset and a restart
    /// should be requested.
    Escalate { failures: u32 },
}

/// Applies lifecycle events and probe results to a health record.
#[derive(Debug, Clone, Copy)]
pub struct HealthTracker {
    escalation_threshold: u32,
}

impl HealthTracker {
    pub fn new(escalation_threshold: u32) -> Self {
        Self {
            escalation_threshold: escalation_threshold.max(1),
        }
    }

    pub fn apply_lifecycle(&self, record: &mut HealthRecord, action: LifecycleAction) {
        match action {
            LifecycleAction::ContainerUp => record.container_healthy = true,
            LifecycleAction::ContainerDown => {
                record.container_healthy = false;
                record.application_healthy = false;
            }
            LifecycleAction::Restarted => {
                record.container_healthy = true;
                record.consecutive_app_failures = 0;
            }
            LifecycleAction::Recreate => {}
        }
    }

    pub fn record_success(&self, record: &mut HealthRecord, now: DateTime<Utc>) -> ProbeVerdict {
        record.application_healthy = true;
        record.consecutive_app_failures = 0;
        record.last_checked_at = Some(now);
        ProbeVerdict::Healthy
    }

    pub fn record_failure(&self, record: &mut HealthRecord, now: DateTime<Utc>) -> ProbeVerdict {
        record.application_healthy = false;
        record.consecutive_app_failures += 1;
        record.last_checked_at = Some(now);
        let failures = record.consecutive_app_failures;
        if failures >= self.escalation_threshold {
            record.consecutive_app_failures = 0;
            ProbeVerdict::Escalate { failures }
        } else {
            ProbeVerdict::Unhealthy { failures }
        }
    }
}

#[cfg(test)]
mod tests {
    use ponos_backend::UnitId;

    use super::*;

    #[test]
    fn escalates_at_threshold_and_resets() {
        let tracker = HealthTracker::new(3);
        let mut record = HealthRecord::default();
        let now = Utc::now();

        assert_eq!(
            tracker.record_failure(&mut record, now),
            ProbeVerdict::Unhealthy { failures: 1 }
        );
        assert_eq!(
            tracker.record_failure(&mut record, now),
            ProbeVerdict::Unhealthy { failures: 2 }
        );
        assert_eq!(
            tracker.record_failure(&mut record, now),
            ProbeVerdict::Escalate { failures: 3 }
        );
        assert_eq!(record.consecutive_app_failures, 0);
        assert!(!record.application_healthy);
    }

    #[test]
    fn success_resets_failures() {
        let tracker = HealthTracker::new(3);
        let mut record = HealthRecord::default();
        tracker.record_failure(&mut record, Utc::now());
        tracker.record_success(&mut record, Utc::now());
        assert!(record.application_healthy);
        assert_eq!(record.consecutive_app_failures, 0);
        assert!(record.last_checked_at.is_some());
    }

    #[test]
    fn lifecycle_kinds_map_to_actions() {
        let unit = UnitId::new("u1");
        let ev = |kind, msg: &str| LifecycleEvent::new(unit.clone(), kind, msg);

        assert_eq!(
            LifecycleAction::for_event(&ev(LifecycleKind::Started, "")),
            LifecycleAction::ContainerUp
        );
        assert_eq!(
            LifecycleAction::for_event(&ev(LifecycleKind::OomKilled, "")),
            LifecycleAction::ContainerDown
        );
        assert_eq!(
            LifecycleAction::for_event(&ev(LifecycleKind::RestartFailed, "spawn failed")),
            LifecycleAction::ContainerDown
        );
        assert_eq!(
            LifecycleAction::for_event(&ev(
                LifecycleKind::RestartFailed,
                "unrecoverable: restart limit 5 reached"
            )),
            LifecycleAction::Recreate
        );
    }

    #[test]
    fn container_down_clears_both_levels() {
        let tracker = HealthTracker::new(3);
        let mut record = HealthRecord {
            container_healthy: true,
            application_healthy: true,
            ..HealthRecord::default()
        };
        tracker.apply_lifecycle(&mut record, LifecycleAction::ContainerDown);
        assert!(!record.container_healthy && !record.application_healthy);

        record.consecutive_app_failures = 2;
        tracker.apply_lifecycle(&mut record, LifecycleAction::Restarted);
        assert!(record.container_healthy);
        assert_eq!(record.consecutive_app_failures, 0);
    }
}
