//! Sliding-window admission control for outbound device requests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Rate limit exceeded: {limit} requests per {}s, retry in {:.1}s",
    .window.as_secs(),
    .retry_after.as_secs_f64()
)]
pub struct RateLimitExceeded {
    pub limit: usize,
    pub window: Duration,
    /// Time until the oldest admitted request leaves the window.
    pub retry_after: Duration,
}

/// At most `max_requests` admissions in any trailing `window`.
///
/// Timestamps older than the window are evicted lazily on each check.
/// A rejected request leaves the window untouched.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn limit(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit a request if the window has room.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Admit a request, or report how long to wait before retrying.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        self.try_acquire_at(Instant::now())
    }

    /// Admissions still available in the current window.
    pub fn remaining(&self) -> usize {
        let now = Instant::now();
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);
        self.max_requests.saturating_sub(admitted.len())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);

        if admitted.len() >= self.max_requests {
            let retry_after = admitted
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(RateLimitExceeded {
                limit: self.max_requests,
                window: self.window,
                retry_after,
            });
        }

        admitted.push_back(now);
        Ok(())
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // A panic while holding the lock cannot leave the queue inconsistent.
        self.admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
