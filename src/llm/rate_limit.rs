//! Token-bucket admission control for outbound model calls.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default queries per second.
pub const DEFAULT_QPS: f64 = 10.0;

/// Longest single sleep while waiting for a token.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token bucket shared by every orchestrator call.
///
/// Capacity is `max(qps, 1)` so that rates below one query per second can
/// still admit a call. Refill and decrement happen inside one critical
/// section; the lock is never held while sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    qps: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

enum Admission {
    Granted,
    Wait(Duration),
}

impl RateLimiter {
    /// Creates a limiter admitting `qps` calls per second, starting full.
    ///
    /// Non-finite or non-positive rates fall back to [`DEFAULT_QPS`].
    #[must_use]
    pub fn new(qps: f64) -> Self {
        let qps = if qps.is_finite() && qps > 0.0 {
            qps
        } else {
            tracing::warn!(qps, "Invalid rate limit, using default of {DEFAULT_QPS} qps");
            DEFAULT_QPS
        };
        let capacity = qps.max(1.0);
        Self {
            qps,
            capacity,
            bucket: Mutex::new(Bucket {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns the configured refill rate.
    #[must_use]
    pub const fn qps(&self) -> f64 {
        self.qps
    }

    /// Returns the bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Returns the tokens currently available, after refilling.
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.available
    }

    /// Takes one token, waiting up to `timeout` for it.
    ///
    /// Returns `false` without sleeping when the wait for the next token
    /// would overrun the deadline.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = match self.try_take() {
                Admission::Granted => return true,
                Admission::Wait(wait) => wait,
            };
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if wait > remaining {
                tracing::debug!(
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Rate limiter admission timed out"
                );
                metrics::counter!("rate_limiter_timeouts_total").increment(1);
                return false;
            }
            std::thread::sleep(wait.min(MAX_SLEEP_SLICE));
        }
    }

    fn try_take(&self) -> Admission {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        if bucket.available >= 1.0 {
            bucket.available -= 1.0;
            Admission::Granted
        } else {
            let deficit = 1.0 - bucket.available;
            Admission::Wait(Duration::from_secs_f64(deficit / self.qps))
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.available = elapsed
            .as_secs_f64()
            .mul_add(self.qps, bucket.available)
            .clamp(0.0, self.capacity);
        bucket.last_refill = now;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_QPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_starts_full() {
        let limiter = RateLimiter::new(5.0);
        assert!((limiter.capacity() - 5.0).abs() < f64::EPSILON);
        for _ in 0..5 {
            assert!(limiter.acquire(Duration::ZERO));
        }
        assert!(!limiter.acquire(Duration::ZERO));
    }

    #[test]
    fn test_second_call_waits_for_refill() {
        let limiter = RateLimiter::new(1.0);
        assert!(limiter.acquire(Duration::from_secs(2)));

        let start = Instant::now();
        assert!(limiter.acquire(Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_gives_up_when_wait_exceeds_timeout() {
        let limiter = RateLimiter::new(0.1);
        assert!(limiter.acquire(Duration::ZERO));

        let start = Instant::now();
        assert!(!limiter.acquire(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sub_one_qps_still_admits_first_call() {
        let limiter = RateLimiter::new(0.5);
        assert!((limiter.capacity() - 1.0).abs() < f64::EPSILON);
        assert!(limiter.acquire(Duration::ZERO));
    }

    #[test]
    fn test_invalid_rate_uses_default() {
        assert!((RateLimiter::new(0.0).qps() - DEFAULT_QPS).abs() < f64::EPSILON);
        assert!((RateLimiter::new(f64::NAN).qps() - DEFAULT_QPS).abs() < f64::EPSILON);
        assert!((RateLimiter::new(-3.0).qps() - DEFAULT_QPS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_available_stays_within_capacity() {
        let limiter = RateLimiter::new(3.0);
        std::thread::sleep(Duration::from_millis(50));
        let available = limiter.available();
        assert!((0.0..=limiter.capacity()).contains(&available));
    }

    #[test]
    fn test_concurrent_callers_never_overspend() {
        let limiter = Arc::new(RateLimiter::new(4.0));
        let granted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    if limiter.acquire(Duration::ZERO) {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Four tokens up front plus whatever trickled in during thread spawn.
        let granted = granted.load(Ordering::SeqCst);
        assert!((4..=6).contains(&granted), "granted {granted}");
    }
}
