//! Scheduler policy: concurrency, retry budget, backoff curve, and pacing.
//!
//! The policy is plain data. It can be built in code or parsed from JSON:
//!
//! ```json
//! {
//!   "maxParallelTasks": 2,
//!   "maxRetries": 5,
//!   "backoffBaseMs": 500,
//!   "backoffCapMs": 300000,
//!   "deferOnMeteredNetwork": true,
//!   "deferOnPowerSaver": true
//! }
//! ```
//!
//! Omitted keys take their defaults; unknown keys are rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use driftsync_core::{ErrorClass, Priority};

use crate::environment::{NetworkClass, PowerState, SchedulerEnvironment};
use crate::error::{Result, SchedulerError};
use crate::task::TaskError;

/// Pacing rules for a [`SyncScheduler`](crate::SyncScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SchedulerPolicy {
    /// Tasks allowed to run at once (at least 1).
    pub max_parallel_tasks: usize,

    /// Retries after the first attempt for transient and capacity failures.
    pub max_retries: u32,

    /// Retries for authentication failures. Never more than `max_retries`.
    pub max_auth_retries: u32,

    /// Transient delay is `base * 2^attempt`, capped.
    #[serde(rename = "backoffBaseMs", with = "millis")]
    pub backoff_base: Duration,

    #[serde(rename = "backoffCapMs", with = "millis")]
    pub backoff_cap: Duration,

    /// Capacity delay is `step * attempt`, capped.
    #[serde(rename = "capacityDelayMs", with = "millis")]
    pub capacity_delay: Duration,

    #[serde(rename = "capacityCapMs", with = "millis")]
    pub capacity_cap: Duration,

    /// Random extra transient delay, as a fraction of the exponential term
    /// (0.0 to 1.0).
    pub jitter: f64,

    /// On a metered network, hold large-payload and non-interactive tasks.
    pub defer_on_metered_network: bool,

    /// In power-saver mode, hold non-interactive tasks.
    pub defer_on_power_saver: bool,

    /// How long finished tasks stay queryable before they are dropped.
    #[serde(rename = "retainFinishedMs", with = "millis")]
    pub retain_finished: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 2,
            max_retries: 5,
            max_auth_retries: 1,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(5 * 60),
            capacity_delay: Duration::from_secs(30),
            capacity_cap: Duration::from_secs(10 * 60),
            jitter: 0.25,
            defer_on_metered_network: true,
            defer_on_power_saver: true,
            retain_finished: Duration::from_secs(10 * 60),
        }
    }
}

impl SchedulerPolicy {
    /// Parse a JSON policy document.
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: Self =
            serde_json::from_str(json).map_err(|e| SchedulerError::InvalidPolicy(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check ranges and orderings.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(SchedulerError::InvalidPolicy(
                "maxParallelTasks must be at least 1".into(),
            ));
        }
        if self.backoff_base.is_zero() || self.capacity_delay.is_zero() {
            return Err(SchedulerError::InvalidPolicy(
                "backoff delays must be greater than 0".into(),
            ));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(SchedulerError::InvalidPolicy(
                "backoffCapMs must not be below backoffBaseMs".into(),
            ));
        }
        if self.capacity_cap < self.capacity_delay {
            return Err(SchedulerError::InvalidPolicy(
                "capacityCapMs must not be below capacityDelayMs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SchedulerError::InvalidPolicy(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    pub fn with_max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = n;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_max_auth_retries(mut self, n: u32) -> Self {
        self.max_auth_retries = n;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_capacity_backoff(mut self, step: Duration, cap: Duration) -> Self {
        self.capacity_delay = step;
        self.capacity_cap = cap;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_defer_on_metered_network(mut self, defer: bool) -> Self {
        self.defer_on_metered_network = defer;
        self
    }

    pub fn with_defer_on_power_saver(mut self, defer: bool) -> Self {
        self.defer_on_power_saver = defer;
        self
    }

    pub fn with_retain_finished(mut self, retain: Duration) -> Self {
        self.retain_finished = retain;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Why a task with these traits is held back under `env`, if it is.
    pub fn deferral(
        &self,
        env: &SchedulerEnvironment,
        priority: Priority,
        large_payload: bool,
    ) -> Option<&'static str> {
        let interactive = priority == Priority::Interactive;

        if env.network_class == NetworkClass::None {
            return Some("offline");
        }
        if env.network_class == NetworkClass::Metered
            && self.defer_on_metered_network
            && (large_payload || !interactive)
        {
            return Some("metered network");
        }
        if env.power_state == PowerState::Saver && self.defer_on_power_saver && !interactive {
            return Some("power saver");
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retry
    // ─────────────────────────────────────────────────────────────────────────

    /// Delay before the next attempt, or `None` when the failure is final.
    ///
    /// `attempt` counts executions so far (1 after the first failure);
    /// `auth_failures` counts authentication failures including this one.
    /// `jitter_unit` is a uniform sample from `[0, 1)`, fixed per task.
    pub fn retry_delay(
        &self,
        error: &TaskError,
        attempt: u32,
        auth_failures: u32,
        jitter_unit: f64,
    ) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        if error.authentication && auth_failures > self.max_auth_retries {
            return None;
        }

        match error.class {
            ErrorClass::Fatal => None,
            ErrorClass::Transient => Some(self.transient_delay(attempt, jitter_unit)),
            ErrorClass::Capacity => Some(self.capacity_backoff(attempt)),
        }
    }

    /// `min(base * 2^attempt * (1 + s), cap * (1 - s / 2))` with
    /// `s = jitter * jitter_unit`.
    ///
    /// The cap is jittered as well, so tasks whose backoff has saturated
    /// still retry at different times. For a fixed `jitter_unit` the delay
    /// is non-decreasing in `attempt` and never exceeds `cap`; the scheduler
    /// draws one unit per task.
    pub fn transient_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let exponential = self.backoff_base.saturating_mul(factor).min(self.backoff_cap);

        let spread = (self.jitter * jitter_unit).clamp(0.0, 1.0);
        let spread = if spread.is_nan() { 0.0 } else { spread };
        let ceiling = self.backoff_cap.mul_f64(1.0 - spread / 2.0);

        exponential
            .saturating_add(exponential.mul_f64(spread))
            .min(ceiling)
    }

    /// `min(cap, step * attempt)`.
    pub fn capacity_backoff(&self, attempt: u32) -> Duration {
        self.capacity_delay
            .saturating_mul(attempt.max(1))
            .min(self.capacity_cap)
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transient() -> TaskError {
        TaskError::new(ErrorClass::Transient, "connection reset")
    }

    #[test]
    fn test_defaults_are_valid() {
        let policy = SchedulerPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.max_parallel_tasks, 2);
        assert_eq!(policy.max_retries, 5);
    }

    #[test]
    fn test_from_json() {
        let policy = SchedulerPolicy::from_json(
            r#"{"maxParallelTasks": 4, "maxRetries": 3, "backoffBaseMs": 100,
                "backoffCapMs": 1000, "deferOnMeteredNetwork": false}"#,
        )
        .unwrap();
        assert_eq!(policy.max_parallel_tasks, 4);
        assert_eq!(policy.backoff_base, Duration::from_millis(100));
        assert!(!policy.defer_on_metered_network);
        assert!(policy.defer_on_power_saver);

        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"backoffCapMs\":1000"));
    }

    #[test]
    fn test_rejects_bad_policies() {
        assert!(SchedulerPolicy::from_json(r#"{"maxParallelTasks": 0}"#).is_err());
        assert!(SchedulerPolicy::from_json(r#"{"backoffBaseMs": 10, "backoffCapMs": 5}"#).is_err());
        assert!(SchedulerPolicy::from_json(r#"{"jitter": 1.5}"#).is_err());
        assert!(SchedulerPolicy::from_json(r#"{"maxRetrys": 3}"#).is_err());
        assert!(SchedulerPolicy::from_json("not json").is_err());
    }

    #[test]
    fn test_transient_delay_curve() {
        let policy = SchedulerPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(0.0);

        assert_eq!(policy.transient_delay(0, 0.9), Duration::from_millis(100));
        assert_eq!(policy.transient_delay(1, 0.9), Duration::from_millis(200));
        assert_eq!(policy.transient_delay(3, 0.9), Duration::from_millis(800));
        assert_eq!(policy.transient_delay(4, 0.9), Duration::from_millis(1000));
        assert_eq!(policy.transient_delay(60, 0.9), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = SchedulerPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(60))
            .with_jitter(0.5);
        assert_eq!(policy.transient_delay(1, 0.0), Duration::from_millis(200));
        assert_eq!(policy.transient_delay(1, 0.5), Duration::from_millis(250));
    }

    #[test]
    fn test_saturated_delays_keep_their_spread() {
        let policy = SchedulerPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(0.5);

        let early = policy.transient_delay(20, 0.0);
        let late = policy.transient_delay(20, 0.5);
        assert_eq!(early, Duration::from_millis(1000));
        assert_eq!(late, Duration::from_millis(875));
        // Same unit, same task: saturated retries hold steady.
        assert_eq!(policy.transient_delay(21, 0.5), late);
    }

    #[test]
    fn test_capacity_backoff_is_linear() {
        let policy = SchedulerPolicy::default()
            .with_capacity_backoff(Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(policy.capacity_backoff(1), Duration::from_secs(30));
        assert_eq!(policy.capacity_backoff(3), Duration::from_secs(90));
        assert_eq!(policy.capacity_backoff(4), Duration::from_secs(100));
    }

    #[test]
    fn test_retry_budget() {
        let policy = SchedulerPolicy::default().with_max_retries(2);
        assert!(policy.retry_delay(&transient(), 1, 0, 0.0).is_some());
        assert!(policy.retry_delay(&transient(), 2, 0, 0.0).is_some());
        assert!(policy.retry_delay(&transient(), 3, 0, 0.0).is_none());

        let fatal = TaskError::new(ErrorClass::Fatal, "bad payload");
        assert!(policy.retry_delay(&fatal, 1, 0, 0.0).is_none());
    }

    #[test]
    fn test_auth_retry_limit() {
        let policy = SchedulerPolicy::default().with_max_retries(5).with_max_auth_retries(1);
        let mut auth = transient();
        auth.authentication = true;

        assert!(policy.retry_delay(&auth, 1, 1, 0.0).is_some());
        assert!(policy.retry_delay(&auth, 2, 2, 0.0).is_none());
    }

    #[test]
    fn test_deferral_rules() {
        let policy = SchedulerPolicy::default();
        let offline = SchedulerEnvironment::offline();
        let metered = SchedulerEnvironment::new(NetworkClass::Metered, PowerState::Normal);
        let saver = SchedulerEnvironment::new(NetworkClass::Unmetered, PowerState::Saver);
        let normal = SchedulerEnvironment::default();

        assert_eq!(policy.deferral(&offline, Priority::Interactive, false), Some("offline"));
        assert!(policy.deferral(&metered, Priority::Interactive, true).is_some());
        assert!(policy.deferral(&metered, Priority::Background, false).is_some());
        assert!(policy.deferral(&metered, Priority::Interactive, false).is_none());
        assert!(policy.deferral(&saver, Priority::Normal, false).is_some());
        assert!(policy.deferral(&saver, Priority::Interactive, true).is_none());
        assert!(policy.deferral(&normal, Priority::Background, true).is_none());

        let relaxed = policy.with_defer_on_metered_network(false).with_defer_on_power_saver(false);
        assert!(relaxed.deferral(&metered, Priority::Background, true).is_none());
        assert!(relaxed.deferral(&saver, Priority::Background, true).is_none());
        // Offline always holds.
        assert!(relaxed.deferral(&offline, Priority::Interactive, false).is_some());
    }

    proptest! {
        #[test]
        fn prop_transient_delays_non_decreasing_and_capped(
            base_ms in 1u64..5_000,
            cap_factor in 1u64..1_000,
            jitter in 0.0f64..=1.0,
            unit in 0.0f64..1.0,
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = base * cap_factor as u32;
            let policy = SchedulerPolicy::default().with_backoff(base, cap).with_jitter(jitter);

            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = policy.transient_delay(attempt, unit);
                prop_assert!(delay <= cap);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
