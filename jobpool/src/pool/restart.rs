//! Sliding-window budget for replacing crashed persistent units.
//!
//! The budget is shared by every unit of one pool: a single misbehaving
//! unit can use up the restarts of the whole window.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RestartPolicy;

#[derive(Debug)]
pub struct RestartLimiter {
    max_restarts: Option<u32>,
    window: Duration,
    count: u32,
    window_reset_at: Option<Instant>,
}

impl RestartLimiter {
    pub const fn new(policy: &RestartPolicy) -> Self {
        Self {
            max_restarts: policy.max_restarts,
            window: policy.window,
            count: 0,
            window_reset_at: None,
        }
    }

    /// Ask for one restart at `now`. Counts it and returns true when the
    /// current window still has budget.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let reset_at = *self.window_reset_at.get_or_insert(now + self.window);
        if now >= reset_at {
            self.count = 0;
            self.window_reset_at = Some(now + self.window);
        }

        if self.max_restarts.is_some_and(|max| self.count >= max) {
            return false;
        }
        self.count += 1;
        true
    }

    /// Restarts granted in the current window.
    pub const fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: Option<u32>, window_ms: u64) -> RestartLimiter {
        RestartLimiter::new(
            &RestartPolicy::default()
                .with_max_restarts(max)
                .with_window(Duration::from_millis(window_ms)),
        )
    }

    #[test]
    fn test_bounded_within_window() {
        let mut limiter = limiter(Some(2), 1000);
        let start = Instant::now();

        assert!(limiter.try_acquire(start));
        assert!(limiter.try_acquire(start + Duration::from_millis(10)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(20)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(999)));
        assert_eq!(limiter.count(), 2);
    }

    #[test]
    fn test_window_reset_restores_budget() {
        let mut limiter = limiter(Some(1), 100);
        let start = Instant::now();

        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + Duration::from_millis(50)));
        assert!(limiter.try_acquire(start + Duration::from_millis(100)));
        assert_eq!(limiter.count(), 1);
        // The new window starts at the reset, not at the old boundary.
        assert!(!limiter.try_acquire(start + Duration::from_millis(150)));
        assert!(limiter.try_acquire(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_budget() {
        let mut limiter = limiter(Some(0), 1000);
        assert!(!limiter.try_acquire(Instant::now()));
        assert_eq!(limiter.count(), 0);
    }

    #[test]
    fn test_unlimited() {
        let mut limiter = limiter(None, 1000);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.try_acquire(now));
        }
        assert_eq!(limiter.count(), 100);
    }
}
