//! Capped exponential backoff with jitter for outbox retries.

use std::time::Duration;

use serde::Deserialize;

/// When and how often a failed delivery is retried.
///
/// `delay(n) = min(cap, base * 2^n * (1 + jitter * u))` for a uniform sample
/// `u` in `[0, 1)`. With `jitter < 1` the jittered delay for attempt `n`
/// stays below the un-jittered delay for `n + 1`, so delays grow strictly
/// until they hit the cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Attempts (including the first) before a message is failed.
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub max_delay_ms:  u64,
  /// Fraction of the exponential delay added as random jitter, in `[0, 1)`.
  pub jitter:        f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts:  5,
      base_delay_ms: 2_000,
      max_delay_ms:  15 * 60 * 1_000,
      jitter:        0.5,
    }
  }
}

impl RetryPolicy {
  /// Largest usable jitter fraction; keeps the growth strict.
  const MAX_JITTER: f64 = 0.999;

  /// Whether a message that has made `attempts` attempts may try again.
  pub fn allows_retry(&self, attempts: u32) -> bool { attempts < self.max_attempts }

  /// Backoff after `attempt` attempts, given a uniform `sample` in `[0, 1)`.
  pub fn delay(&self, attempt: u32, sample: f64) -> Duration {
    let exponential = 2u64
      .checked_pow(attempt)
      .and_then(|factor| self.base_delay_ms.checked_mul(factor))
      .unwrap_or(u64::MAX);
    if exponential >= self.max_delay_ms {
      return Duration::from_millis(self.max_delay_ms);
    }

    let jitter = self.jitter.clamp(0.0, Self::MAX_JITTER);
    let sample = sample.clamp(0.0, Self::MAX_JITTER);
    let jittered = exponential as f64 * (1.0 + jitter * sample);
    let millis = jittered.min(self.max_delay_ms as f64) as u64;
    Duration::from_millis(millis)
  }
}
