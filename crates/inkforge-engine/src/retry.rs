use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

/// Time source for backoff and polling. Tests substitute a fake that advances on sleep.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cooperative cancellation flag, checked between attempts and polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, clamped to `0.0..=1.0`.
    /// Non-finite values disable jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before the next attempt. A server-provided `Retry-After` wins over the schedule.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(wait) = retry_after {
            return wait.min(self.max_delay);
        }
        let base = self.backoff(attempt);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(8),
            deadline: Duration::from_secs(180),
        }
    }
}

impl PollPolicy {
    /// Wait before poll number `poll` (0-based): doubles each time up to the cap.
    pub fn interval(&self, poll: u32) -> Duration {
        self.initial_interval
            .saturating_mul(1u32 << poll.min(16))
            .min(self.max_interval)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CancelToken, PollPolicy, RetryPolicy};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n, None).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for(2, None);
            assert!(delay >= Duration::from_millis(3190), "{delay:?}");
            assert!(delay <= Duration::from_millis(4810), "{delay:?}");
        }
    }

    #[test]
    fn out_of_range_jitter_is_tamed() {
        for jitter in [f64::NAN, f64::INFINITY, -0.5] {
            let policy = RetryPolicy {
                jitter,
                ..RetryPolicy::default()
            };
            assert_eq!(policy.delay_for(1, None), Duration::from_secs(2), "{jitter}");
        }
        let wide = RetryPolicy {
            jitter: 7.0,
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            assert!(wide.delay_for(1, None) <= Duration::from_secs(4));
        }
    }

    #[test]
    fn retry_after_overrides_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            policy.max_delay
        );
    }

    #[test]
    fn poll_interval_doubles_to_eight_seconds() {
        let policy = PollPolicy::default();
        let intervals: Vec<u64> = (0..6).map(|n| policy.interval(n).as_secs()).collect();
        assert_eq!(intervals, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(policy.deadline, Duration::from_secs(180));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
