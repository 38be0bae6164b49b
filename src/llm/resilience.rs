//! Retry with exponential backoff for remote model calls.
//!
//! Only [`crate::Error::Ai`] failures whose kind is retryable are retried.
//! Everything else (client errors, parse failures and any local error) is
//! returned on first occurrence so that retry policy never hides a bug.

use crate::config::LlmConfig;
use crate::Result;
use std::time::{Duration, Instant};

/// Backoff configuration for remote calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Builds retry settings from model configuration.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            ..Self::default()
        }
    }

    /// Settings that never sleep, for tests and batch tooling.
    #[must_use]
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 2.0,
            jitter: false,
        }
    }

    /// Returns the un-jittered delay before retry `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.exponential_base.max(1.0).powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries are spent. The last error is returned unchanged.
///
/// The calling thread sleeps between attempts; callers must not hold shared
/// locks across this call.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last retryable error once
/// retries are exhausted.
pub fn retry_with_backoff<T, F>(config: &RetryConfig, operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = config.jittered(config.delay_for_attempt(attempt));
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = config.max_retries,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying remote call"
                );
                metrics::counter!(
                    "ai_retries_total",
                    "operation" => operation,
                    "kind" => err.ai_kind().map_or("unknown", crate::ErrorKind::as_str)
                )
                .increment(1);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            },
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(operation, attempts = attempt + 1, "Retries exhausted: {err}");
                }
                return Err(err);
            },
        }
    }
}
