//! Adaptive scheduler: cadence, backoff and the per-platform circuit breaker.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use stash_core::{Eligibility, PlatformState, RunOutcome};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerPolicy {
    pub max_consecutive_failures: u32,
    pub disable_threshold: f64,
    /// Weight of the newest outcome in the smoothed success rate.
    pub smoothing_weight: f64,
    pub backoff_step: Duration,
    pub max_interval: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            disable_threshold: 0.3,
            smoothing_weight: 0.1,
            backoff_step: Duration::hours(2),
            max_interval: Duration::hours(24),
        }
    }
}

/// What `record_outcome` did to a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Rescheduled,
    BackedOff,
    /// The circuit breaker tripped on this outcome.
    Disabled,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveScheduler {
    policy: SchedulerPolicy,
}

impl AdaptiveScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    pub fn eligibility(&self, state: &PlatformState, now: DateTime<Utc>) -> Eligibility {
        state.eligibility(now)
    }

    /// `min(base + failures * step, max)`; never shorter than for fewer failures.
    pub fn failure_interval(&self, base: Duration, consecutive_failures: u32) -> Duration {
        let penalty = self
            .policy
            .backoff_step
            .num_milliseconds()
            .saturating_mul(i64::from(consecutive_failures));
        let interval = base
            .num_milliseconds()
            .saturating_add(penalty)
            .min(self.policy.max_interval.num_milliseconds());
        Duration::milliseconds(interval)
    }

    fn smooth(&self, rate: f64, observation: f64) -> f64 {
        let w = self.policy.smoothing_weight;
        (rate * (1.0 - w) + observation * w).clamp(0.0, 1.0)
    }

    /// Applies one finished run to `state`. Cancelled runs must not be recorded.
    pub fn record_outcome(
        &self,
        state: &mut PlatformState,
        outcome: &RunOutcome,
        base_interval: Duration,
        now: DateTime<Utc>,
    ) -> Transition {
        state.last_attempt_at = Some(now);

        if outcome.succeeded {
            state.consecutive_failures = 0;
            state.success_rate = self.smooth(state.success_rate, 1.0);
            state.last_success_at = Some(now);
            state.next_eligible_at = now + base_interval;
            state.total_new_items += outcome.new_item_count as u64;
            if outcome.last_item.is_some() {
                state.last_item = outcome.last_item.clone();
            }
            return Transition::Rescheduled;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.success_rate = self.smooth(state.success_rate, 0.0);
        state.last_failure_reason = outcome.failure_summary();
        let backoff = self.failure_interval(base_interval, state.consecutive_failures);
        state.next_eligible_at = now + backoff;
        // Items delivered before a mid-run failure still count.
        state.total_new_items += outcome.new_item_count as u64;

        let too_many = state.consecutive_failures >= self.policy.max_consecutive_failures;
        let too_flaky = state.success_rate < self.policy.disable_threshold;
        if state.enabled && (too_many || too_flaky) {
            state.enabled = false;
            warn!(
                platform = %state.platform,
                consecutive_failures = state.consecutive_failures,
                success_rate = state.success_rate,
                reason = %state.last_failure_reason,
                "platform disabled; manual reset required"
            );
            return Transition::Disabled;
        }

        info!(
            platform = %state.platform,
            consecutive_failures = state.consecutive_failures,
            backoff_minutes = backoff.num_minutes(),
            "platform backed off"
        );
        Transition::BackedOff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stash_core::{ItemCursor, RunFailure};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    fn failed(at: DateTime<Utc>) -> RunOutcome {
        RunOutcome::begin(Uuid::new_v4(), "reddit", at).fail(RunFailure::Fetch, "503", at)
    }

    fn succeeded(at: DateTime<Utc>, new_items: usize) -> RunOutcome {
        let mut outcome = RunOutcome::begin(Uuid::new_v4(), "reddit", at);
        outcome.new_item_count = new_items;
        outcome.last_item = Some(ItemCursor {
            external_id: Some("t3_1".into()),
            url: None,
        });
        outcome.succeed(at)
    }

    #[test]
    fn success_resets_failures_and_uses_base_interval() {
        let scheduler = AdaptiveScheduler::default();
        let mut state = PlatformState::new("reddit", t0());
        state.consecutive_failures = 2;
        state.success_rate = 0.5;

        let transition =
            scheduler.record_outcome(&mut state, &succeeded(t0(), 3), Duration::hours(4), t0());
        assert_eq!(transition, Transition::Rescheduled);
        assert_eq!(state.consecutive_failures, 0);
        assert!((state.success_rate - 0.55).abs() < 1e-9);
        assert_eq!(state.next_eligible_at, t0() + Duration::hours(4));
        assert_eq!(state.last_success_at, Some(t0()));
        assert_eq!(state.total_new_items, 3);
        assert!(state.last_item.is_some());
    }

    #[test]
    fn failure_backs_off_and_records_reason() {
        let scheduler = AdaptiveScheduler::default();
        let mut state = PlatformState::new("reddit", t0());
        let transition =
            scheduler.record_outcome(&mut state, &failed(t0()), Duration::hours(4), t0());
        assert_eq!(transition, Transition::BackedOff);
        assert_eq!(state.consecutive_failures, 1);
        assert!((state.success_rate - 0.9).abs() < 1e-9);
        assert_eq!(state.next_eligible_at, t0() + Duration::hours(6));
        assert_eq!(state.last_failure_reason, "fetch: 503");
        assert_eq!(
            state.eligibility(t0() + Duration::hours(5)),
            Eligibility::CoolingDown {
                until: t0() + Duration::hours(6)
            }
        );
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let scheduler = AdaptiveScheduler::default();
        let base = Duration::hours(6);
        let mut previous = Duration::zero();
        for failures in 0..40 {
            let interval = scheduler.failure_interval(base, failures);
            assert!(interval >= previous);
            assert!(interval <= Duration::hours(24));
            previous = interval;
        }
        assert_eq!(previous, Duration::hours(24));
    }

    #[test]
    fn consecutive_failure_cap_trips_breaker() {
        let scheduler = AdaptiveScheduler::new(SchedulerPolicy {
            max_consecutive_failures: 3,
            ..SchedulerPolicy::default()
        });
        let mut state = PlatformState::new("reddit", t0());
        let mut now = t0();
        let mut transitions = Vec::new();
        for _ in 0..3 {
            let outcome = failed(now);
            transitions.push(scheduler.record_outcome(&mut state, &outcome, Duration::hours(1), now));
            now = state.next_eligible_at;
        }
        assert_eq!(
            transitions,
            vec![Transition::BackedOff, Transition::BackedOff, Transition::Disabled]
        );
        assert!(!state.enabled);
        assert_eq!(state.eligibility(now + Duration::days(30)), Eligibility::Disabled);
    }

    #[test]
    fn low_success_rate_trips_breaker() {
        let scheduler = AdaptiveScheduler::new(SchedulerPolicy {
            max_consecutive_failures: 100,
            ..SchedulerPolicy::default()
        });
        let mut state = PlatformState::new("reddit", t0());
        state.success_rate = 0.32;
        let transition =
            scheduler.record_outcome(&mut state, &failed(t0()), Duration::hours(1), t0());
        assert_eq!(transition, Transition::Disabled);
    }
}
