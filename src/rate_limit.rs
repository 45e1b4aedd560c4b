//! Per-key fixed-window attempt counting.
//!
//! Each key gets its own window, opened by its first recorded failure and
//! closed `window` later. Once a key's failures exceed `limit` inside the
//! window it is blocked until that window ends.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    failures: u32,
}

#[derive(Debug)]
pub struct AttemptLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl AttemptLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.is_blocked_at(key, Instant::now())
    }

    pub fn record_failure(&self, key: &str) -> u32 {
        self.record_failure_at(key, Instant::now())
    }

    fn is_blocked_at(&self, key: &str, now: Instant) -> bool {
        match self.windows.get(key) {
            Some(w) if now.duration_since(w.opened_at) < self.window => w.failures > self.limit,
            _ => false,
        }
    }

    fn record_failure_at(&self, key: &str, now: Instant) -> u32 {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            opened_at: now,
            failures: 0,
        });
        if now.duration_since(entry.opened_at) >= self.window {
            *entry = Window {
                opened_at: now,
                failures: 0,
            };
        }
        entry.failures += 1;
        entry.failures
    }

    /// Drops keys whose window has ended.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.opened_at) < self.window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_limit_is_exceeded() {
        let limiter = AttemptLimiter::new(2, Duration::from_secs(300));
        let start = Instant::now();

        assert_eq!(limiter.record_failure_at("uid-1", start), 1);
        assert_eq!(limiter.record_failure_at("uid-1", start), 2);
        assert!(!limiter.is_blocked_at("uid-1", start));
        assert_eq!(limiter.record_failure_at("uid-1", start), 3);
        assert!(limiter.is_blocked_at("uid-1", start));
        assert!(!limiter.is_blocked_at("uid-2", start));
    }

    #[test]
    fn window_resets_per_key() {
        let window = Duration::from_secs(60);
        let limiter = AttemptLimiter::new(0, window);
        let start = Instant::now();

        limiter.record_failure_at("a", start);
        limiter.record_failure_at("b", start + Duration::from_secs(50));
        assert!(limiter.is_blocked_at("a", start + Duration::from_secs(59)));

        let later = start + Duration::from_secs(61);
        assert!(!limiter.is_blocked_at("a", later));
        assert!(limiter.is_blocked_at("b", later));
        assert_eq!(limiter.record_failure_at("a", later), 1);
    }

    #[test]
    fn prune_forgets_closed_windows() {
        let limiter = AttemptLimiter::new(1, Duration::from_millis(0));
        limiter.record_failure("uid");
        limiter.prune();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
