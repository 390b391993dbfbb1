use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds as `f64` on the wire, `Duration` in memory.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = f64::deserialize(d)?;
        Duration::try_from_secs_f64(raw).map_err(serde::de::Error::custom)
    }
}

/// Exponential backoff applied after a rate-limited attempt.
///
/// The n-th wait (0-based) is `base * factor^n`, capped at `max_delay`, plus
/// uniform jitter in `[0, jitter * delay]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(rename = "base_secs", with = "secs")]
    pub base: Duration,
    pub factor: f64,
    #[serde(rename = "max_delay_secs", with = "secs")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            factor: 2.0,
            max_delay: Duration::from_secs(960),
            jitter: 0.0,
        }
    }
}

impl Backoff {
    fn base_delay(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.factor.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }

        let range_ms = (delay.as_millis() as f64 * jitter) as u64;
        if range_ms == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=range_ms);
        delay + Duration::from_millis(extra)
    }
}

/// Delay between consecutive generated jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    #[serde(rename = "after_success_secs", with = "secs")]
    pub after_success: Duration,
    #[serde(rename = "after_failure_secs", with = "secs")]
    pub after_failure: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            after_success: Duration::from_secs(2),
            after_failure: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total generate attempts per job, the first one included.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub pacing: Pacing,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::default(),
            pacing: Pacing::default(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_from_one_minute() {
        let backoff = Backoff::default();
        let secs: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![60, 120, 240, 480, 960, 960]);
    }

    #[test]
    fn huge_retry_index_stays_capped() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            factor: 10.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff {
            base: Duration::from_secs(10),
            factor: 2.0,
            max_delay: Duration::from_secs(100),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_secs(20), "{:?}", d);
            assert!(d <= Duration::from_secs(30), "{:?}", d);
        }
    }

    #[test]
    fn zero_retries_still_allows_one_attempt() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn policy_reads_partial_json_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_retries": 3, "backoff": {"base_secs": 0.5}, "pacing": {"after_failure_secs": 10}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.base, Duration::from_millis(500));
        assert_eq!(policy.backoff.factor, 2.0);
        assert_eq!(policy.pacing.after_success, Duration::from_secs(2));
        assert_eq!(policy.pacing.after_failure, Duration::from_secs(10));
    }
}
