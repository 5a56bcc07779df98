//! Per-session broadcast rate limiter
//!
//! A fixed window counter: `limit` broadcasts per `window`, refilled in one
//! step once the window has expired.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    remaining: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::starting_at(limit, window, Instant::now())
    }

    fn starting_at(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            remaining: limit,
            window_start: now,
        }
    }

    /// Take one unit of capacity if any is left
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Same as `try_consume` with an explicit clock, for tests
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.window {
            self.remaining = self.limit;
            self.window_start = now;
        }

        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
