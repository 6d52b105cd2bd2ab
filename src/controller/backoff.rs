//! Retry backoff and per-resource attempt tracking

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use super::object::ObjectKey;

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Attempts before a resource is reported Degraded
    pub max_retries: u32,
    /// Adds up to 10% random delay so failing resources do not retry in lockstep
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            max_retries: 8,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Exponential: base * 2^attempt, capped at max
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = calculate_backoff(attempt, self.base, self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64 / 10).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max.max(delay))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

/// Consecutive failure counts per resource
#[derive(Default)]
pub struct AttemptTracker {
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl AttemptTracker {
    /// Record a failure and return how many failures preceded it
    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = attempts.entry(key.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset(&self, key: &ObjectKey) {
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        attempts.remove(key);
    }

    pub fn get(&self, key: &ObjectKey) -> u32 {
        let attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        attempts.get(key).copied().unwrap_or(0)
    }
}
