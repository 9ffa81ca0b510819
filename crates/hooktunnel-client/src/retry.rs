//! Exponential backoff policy used while dialing the relay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ELAPSED_TIME: Duration = Duration::from_secs(3 * 60);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff retry policy.
///
/// Zero fields mean "unset"; call [`RetryPolicy::with_defaults`] to get a
/// usable policy. A caller can therefore supply only the fields it cares
/// about:
///
/// ```
/// # use std::time::Duration;
/// # use hooktunnel_client::RetryPolicy;
/// let policy = RetryPolicy {
///     max_elapsed_time: Duration::from_secs(10),
///     ..Default::default()
/// }
/// .with_defaults();
/// assert_eq!(policy.initial_delay, Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms", default)]
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms", default)]
    pub max_delay: Duration,
    /// Total time budget for the retry loop.
    #[serde(rename = "max_elapsed_time_ms", with = "duration_ms", default)]
    pub max_elapsed_time: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default)]
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Fill unset fields with defaults and clamp the policy to its invariants.
    #[must_use]
    pub fn with_defaults(self) -> Self {
        let mut policy = self;
        if policy.initial_delay.is_zero() {
            policy.initial_delay = DEFAULT_INITIAL_DELAY;
        }
        if policy.max_delay.is_zero() {
            policy.max_delay = DEFAULT_MAX_DELAY;
        }
        if policy.max_elapsed_time.is_zero() {
            policy.max_elapsed_time = DEFAULT_MAX_ELAPSED_TIME;
        }
        if policy.multiplier == 0.0 || !policy.multiplier.is_finite() {
            policy.multiplier = DEFAULT_MULTIPLIER;
        }
        // Delays never shrink.
        policy.multiplier = policy.multiplier.max(1.0);
        policy.max_delay = policy.max_delay.max(policy.initial_delay);
        policy.max_elapsed_time = policy.max_elapsed_time.max(policy.initial_delay);
        policy
    }

    /// Delay to wait after `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_secs = current.as_secs_f64() * self.multiplier;
        Duration::try_from_secs_f64(next_secs)
            .unwrap_or(self.max_delay)
            .max(current)
            .min(self.max_delay)
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unset_policy_gets_defaults() {
        let policy = RetryPolicy::default().with_defaults();
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_elapsed_time, Duration::from_secs(180));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_policy_keeps_caller_values() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_elapsed_time: Duration::from_millis(50),
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.max_elapsed_time, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn budget_never_shorter_than_initial_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            max_elapsed_time: Duration::from_secs(1),
            multiplier: 0.5,
        }
        .with_defaults();
        assert_eq!(policy.max_elapsed_time, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert!((policy.multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            ..Default::default()
        }
        .with_defaults();

        // 1s, 2s, 4s, 8s, 16s, 32s, 60s (capped), 60s
        let mut delay = policy.initial_delay;
        let mut seen = vec![delay];
        for _ in 0..7 {
            delay = policy.next_delay(delay);
            seen.push(delay);
        }
        let secs: Vec<u64> = seen.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn next_delay_is_monotonic_and_bounded() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(3),
            max_delay: Duration::from_millis(700),
            multiplier: 1.7,
            ..Default::default()
        }
        .with_defaults();

        let mut delay = policy.initial_delay;
        for _ in 0..100 {
            let next = policy.next_delay(delay);
            assert!(next >= delay);
            assert!(next <= policy.max_delay);
            delay = next;
        }
        assert_eq!(delay, policy.max_delay);
    }

    #[test]
    fn huge_delay_saturates_at_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::MAX,
            multiplier: 4.0,
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(policy.next_delay(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn deserializes_millisecond_fields() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"initial_delay_ms": 10, "max_elapsed_time_ms": 50}"#)
                .unwrap();
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.max_elapsed_time, Duration::from_millis(50));
        assert!(policy.max_delay.is_zero());
        assert!(policy.multiplier.abs() < f64::EPSILON);
    }
}
