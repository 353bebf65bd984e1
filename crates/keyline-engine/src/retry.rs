//! Bounded exponential backoff for network operations.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pipeline::CancellationToken;
use crate::{EngineError, Result};

/// Retry schedule for catalog queries and tile downloads.
///
/// Delay before attempt `n` (1-based, n >= 2) is
/// `min(base_delay * 2^(n-2), max_delay)`, scaled by a random factor in
/// `1 ± jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let base = self.base_backoff(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(scale)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    ///
    /// Cancellation is checked before every retry.
    pub fn run<T, F>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.jittered(attempt - 1);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    metrics::counter!(crate::telemetry::RETRIES_TOTAL.name).increment(1);
                    thread::sleep(delay);
                    if cancel.is_cancelled() {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Validate a policy loaded from configuration.
pub(crate) fn validate(policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        return Err(EngineError::Config(format!(
            "retry.jitter must be within [0, 1], got {}",
            policy.jitter
        )));
    }
    Ok(())
}
