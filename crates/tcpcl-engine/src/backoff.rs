//! Reconnect backoff for outbound ducts.
//!
//! Each failed connect pushes the next attempt out by the current window,
//! then doubles the window up to the limit. A successful connect resets it.

use std::cmp::min;
use std::time::Duration;

use tokio::time::Instant;

pub struct Backoff {
    start: Duration,
    limit: Duration,
    window: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(start: Duration, limit: Duration) -> Self {
        Backoff {
            start,
            limit: limit.max(start),
            window: start,
            next_attempt: None,
        }
    }

    /// Whether a connection attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Record a failed attempt at `now`.
    pub fn failed(&mut self, now: Instant) {
        self.next_attempt = Some(now + self.window);
        self.window = min(self.window.saturating_mul(2), self.limit);
    }

    pub fn reset(&mut self) {
        self.window = self.start;
        self.next_attempt = None;
    }

    /// Window the next failure will wait.
    pub fn window(&self) -> Duration {
        self.window
    }
}
