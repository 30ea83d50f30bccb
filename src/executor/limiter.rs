use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("rate must be a positive number, got {0}")]
pub struct InvalidRate(pub f64);

/// Async rate limiter shared by every worker of one executor.
///
/// Slots are handed out on a fixed grid of `1 / rate` seconds with a burst of one: each
/// caller atomically reserves the next free slot (never earlier than "now") and sleeps
/// until it. Idle time is not banked, so a stalled executor never bursts to catch up.
#[derive(Debug)]
pub struct RateLimiter {
    origin: Instant,
    interval_nanos: u64,
    /// Next free slot, in nanoseconds since `origin`.
    next_slot: AtomicU64,
}

impl RateLimiter {
    /// `rate_per_sec` must be positive and finite.
    pub fn new(rate_per_sec: f64) -> Result<Self, InvalidRate> {
        if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
            return Err(InvalidRate(rate_per_sec));
        }
        let interval_nanos = (1e9 / rate_per_sec).round().max(1.0) as u64;
        Ok(Self {
            origin: Instant::now(),
            interval_nanos,
            next_slot: AtomicU64::new(0),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    pub fn rate(&self) -> f64 {
        1e9 / self.interval_nanos as f64
    }

    /// Reserves the next slot and returns the instant it opens.
    pub fn reserve(&self) -> Instant {
        let now = self.elapsed_nanos();
        let interval = self.interval_nanos;
        let previous = match self.next_slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
            Some(next.max(now).saturating_add(interval))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        self.origin + Duration::from_nanos(previous.max(now))
    }

    /// Waits for permission to dispatch. Dropping the future abandons the reserved slot.
    pub async fn acquire(&self) {
        let slot = self.reserve();
        if slot > Instant::now() {
            tokio::time::sleep_until(slot).await;
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn count_permits(rate: f64, workers: usize, window: Duration) -> usize {
        let limiter = Arc::new(RateLimiter::new(rate).unwrap());
        let permits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    loop {
                        limiter.acquire().await;
                        permits.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        tokio::time::sleep(window).await;
        for h in &handles {
            h.abort();
        }
        permits.load(Ordering::Relaxed)
    }

    #[test]
    fn test_interval_from_rate() {
        let limiter = RateLimiter::new(10.0).unwrap();
        assert_eq!(limiter.interval(), Duration::from_millis(100));
        assert!((limiter.rate() - 10.0).abs() < 1e-9);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_non_positive_rate_is_rejected(#[case] rate: f64) {
        assert!(RateLimiter::new(rate).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservations_are_spaced_by_interval() {
        let limiter = RateLimiter::new(4.0).unwrap();
        let first = limiter.reserve();
        let second = limiter.reserve();
        let third = limiter.reserve();
        assert_eq!(second - first, Duration::from_millis(250));
        assert_eq!(third - second, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_is_not_banked() {
        let limiter = RateLimiter::new(10.0).unwrap();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(5)).await;

        // After a long idle period only one permit is immediately available.
        let now = Instant::now();
        assert_eq!(limiter.reserve(), now);
        assert_eq!(limiter.reserve(), now + Duration::from_millis(100));
    }

    #[rstest]
    #[case(2)]
    #[case(8)]
    #[tokio::test(start_paused = true)]
    async fn test_aggregate_rate_independent_of_workers(#[case] workers: usize) {
        // 10 req/s over 30s -> ~300 permits regardless of worker count
        let permits = count_permits(10.0, workers, Duration::from_secs(30)).await;
        assert!((270..=330).contains(&permits), "got {permits} permits with {workers} workers");
    }
}
