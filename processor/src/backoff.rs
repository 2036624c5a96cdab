use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Exponential backoff between attempts on the same run.
///
/// The delay before attempt `n + 1` is `initial * 2^(n - 1)` capped at `max`,
/// plus a jitter in `[0, jitter]` derived from the run and attempt so that
/// repeated readiness checks agree with each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self, section: &str) -> anyhow::Result<()> {
        if self.initial_backoff_ms == 0 {
            anyhow::bail!("{section}.initial_backoff_ms must be positive");
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            anyhow::bail!("{section}.initial_backoff_ms must not exceed max_backoff_ms");
        }
        Ok(())
    }

    /// Base delay after `attempts` failed attempts, without jitter.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let exponent = (attempts - 1).min(32);
        self.initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }

    fn jitter_for(&self, key: &str, attempts: u32) -> u64 {
        if self.jitter_ms == 0 {
            return 0;
        }
        let mut hasher = DefaultHasher::default();
        key.hash(&mut hasher);
        attempts.hash(&mut hasher);
        hasher.finish() % (self.jitter_ms + 1)
    }

    /// Earliest time the next attempt may start.
    pub fn next_attempt_at(&self, key: &str, attempts: u32, last_attempt_at: Option<u64>) -> u64 {
        match last_attempt_at {
            Some(last) if attempts > 0 => last
                .saturating_add(self.delay_ms(attempts))
                .saturating_add(self.jitter_for(key, attempts)),
            _ => 0,
        }
    }

    pub fn is_ready(&self, key: &str, attempts: u32, last_attempt_at: Option<u64>, now: u64) -> bool {
        now >= self.next_attempt_at(key, attempts, last_attempt_at)
    }
}
