//! Sliding-window limiter for outgoing sends.
//!
//! Each sink worker owns one, so there is no locking; callers pass the
//! current instant, which keeps the limiter deterministic under test.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum sends allowed in the window
    pub max_actions: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_actions: u32, window: Duration) -> Self {
        Self {
            max_actions,
            window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

#[derive(Debug)]
pub struct SlidingWindow {
    config: RateLimitConfig,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            timestamps: VecDeque::new(),
        }
    }

    fn cleanup(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a send at `now` if the window has room, otherwise report how
    /// long until the oldest send leaves the window.
    pub fn check_and_record(&mut self, now: Instant) -> RateLimitResult {
        if self.config.max_actions == 0 {
            return RateLimitResult::Allowed;
        }

        self.cleanup(now);

        if self.timestamps.len() >= self.config.max_actions as usize {
            if let Some(&oldest) = self.timestamps.front() {
                let elapsed = now.saturating_duration_since(oldest);
                return RateLimitResult::Denied {
                    retry_after: self.config.window.saturating_sub(elapsed),
                };
            }
        }

        self.timestamps.push_back(now);
        RateLimitResult::Allowed
    }

    pub fn in_window(&mut self, now: Instant) -> usize {
        self.cleanup(now);
        self.timestamps.len()
    }
}
