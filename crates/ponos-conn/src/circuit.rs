//! Circuit breaker state for one performer connection.
//!
//! The breaker has no explicit open/half-open transitions. It is a pure
//! function of the failure history: open iff more than `threshold`
//! consecutive connection failures AND the last healthy moment is older
//! than `cooldown`.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub last_healthy_at: Instant,
}

impl CircuitState {
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_failures: 0,
            last_healthy_at: now,
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_healthy_at = now;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn is_open_at(&self, now: Instant, threshold: u32, cooldown: Duration) -> bool {
        self.consecutive_failures > threshold
            && now.saturating_duration_since(self.last_healthy_at) > cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 5;
    const COOLDOWN: Duration = Duration::from_secs(60);

    fn state(failures: u32, healthy_ago: Duration, now: Instant) -> CircuitState {
        CircuitState {
            consecutive_failures: failures,
            last_healthy_at: now - healthy_ago,
        }
    }

    #[test]
    fn opens_after_threshold_and_cooldown() {
        let now = Instant::now() + Duration::from_secs(600);
        assert!(state(6, Duration::from_secs(120), now).is_open_at(now, THRESHOLD, COOLDOWN));
    }

    #[test]
    fn stays_closed_within_cooldown() {
        let now = Instant::now() + Duration::from_secs(600);
        assert!(!state(6, Duration::from_secs(30), now).is_open_at(now, THRESHOLD, COOLDOWN));
    }

    #[test]
    fn stays_closed_at_threshold() {
        let now = Instant::now() + Duration::from_secs(600);
        assert!(!state(5, Duration::from_secs(120), now).is_open_at(now, THRESHOLD, COOLDOWN));
    }

    #[test]
    fn success_closes_the_circuit() {
        let now = Instant::now() + Duration::from_secs(600);
        let mut s = state(6, Duration::from_secs(120), now);
        s.record_success(now);
        assert_eq!(s.consecutive_failures, 0);
        assert!(!s.is_open_at(now, THRESHOLD, COOLDOWN));
    }
}
