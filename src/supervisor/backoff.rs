use crate::config::{ProcessSpec, RestartPolicy};
use crate::supervisor::state::ExitClass;
use std::time::{Duration, SystemTime};

/// Decide whether an exit should trigger a restart under a policy
pub fn policy_allows_restart(policy: RestartPolicy, exit: ExitClass) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure => !exit.is_clean(),
        RestartPolicy::Always => true,
    }
}

/// Exponential restart backoff with a cap
///
/// delay = initial * 2^attempt, capped at max. Knobs come from the
/// process spec (defaults: initial 1s, cap 60s).
#[derive(Debug, Clone, Copy)]
pub struct RestartBackoff {
    initial_delay: Duration,
    max_delay: Duration,
}

impl RestartBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self::new(
            Duration::from_secs(spec.restart_initial_delay_secs),
            Duration::from_secs(spec.restart_max_delay_secs),
        )
    }

    /// Delay before restart attempt number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let secs = self
            .initial_delay
            .as_secs()
            .saturating_mul(2_u64.saturating_pow(attempt as u32));
        Duration::from_secs(secs).min(self.max_delay)
    }
}

/// Tracks restart history for a process within a sliding window
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    restart_times: Vec<SystemTime>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a restart attempt
    pub fn record_restart(&mut self) {
        self.restart_times.push(SystemTime::now());
    }

    /// Total restarts recorded
    pub fn restart_count(&self) -> usize {
        self.restart_times.len()
    }

    /// Restarts within the last `window_secs` seconds
    pub fn count_recent_restarts(&self, window_secs: u64) -> usize {
        let now = SystemTime::now();
        let window = Duration::from_secs(window_secs);

        self.restart_times
            .iter()
            .filter(|&&time| {
                now.duration_since(time)
                    .map(|d| d < window)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Whether another restart fits under the windowed cap
    pub fn within_limit(&self, max_restarts: usize, window_secs: u64) -> bool {
        self.count_recent_restarts(window_secs) < max_restarts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_never() {
        assert!(!policy_allows_restart(RestartPolicy::Never, ExitClass::Clean));
        assert!(!policy_allows_restart(
            RestartPolicy::Never,
            ExitClass::Abnormal(Some(1))
        ));
    }

    #[test]
    fn test_policy_on_failure() {
        assert!(!policy_allows_restart(
            RestartPolicy::OnFailure,
            ExitClass::Clean
        ));
        assert!(policy_allows_restart(
            RestartPolicy::OnFailure,
            ExitClass::Abnormal(Some(1))
        ));
        assert!(policy_allows_restart(
            RestartPolicy::OnFailure,
            ExitClass::Abnormal(None)
        ));
    }

    #[test]
    fn test_policy_always() {
        assert!(policy_allows_restart(RestartPolicy::Always, ExitClass::Clean));
        assert!(policy_allows_restart(
            RestartPolicy::Always,
            ExitClass::Abnormal(Some(1))
        ));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let backoff = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        // 2^6 = 64, capped at 60
        assert_eq!(backoff.delay_for(6), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_from_spec_defaults() {
        let spec = ProcessSpec::new("web", "/usr/bin/serve");
        let backoff = RestartBackoff::from_spec(&spec);

        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_tracker_windowed_limit() {
        let mut tracker = RestartTracker::new();
        assert!(tracker.within_limit(3, 60));

        tracker.record_restart();
        tracker.record_restart();
        assert!(tracker.within_limit(3, 60));
        assert_eq!(tracker.restart_count(), 2);

        tracker.record_restart();
        assert!(!tracker.within_limit(3, 60));
    }
}
