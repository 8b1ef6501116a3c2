use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_WINDOW_ENTRIES: usize = 1000; // Prevent unbounded growth

/// Sliding window rate limiter for inbound messages.
///
/// Unlike a fixed window that resets at fixed intervals, this tracks
/// individual message timestamps and only counts messages within the
/// sliding window. This prevents "clock edge" attacks where an attacker
/// sends max messages just before and after a window boundary.
#[derive(Debug)]
pub struct RateLimiter {
    /// Ring buffer of admitted-message instants.
    window: VecDeque<Instant>,
    /// Window width.
    width: Duration,
}

impl RateLimiter {
    /// Creates a sliding window limiter with the given window width.
    #[must_use]
    pub fn new(width: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(16),
            width,
        }
    }

    /// Remove entries older than the window width.
    fn expire_old_entries(&mut self, now: Instant) {
        while let Some(&stamp) = self.window.front() {
            if now.duration_since(stamp) >= self.width {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check the message budget and record the message in a single pass.
    /// Returns `false` if the message exceeds the budget (and must be
    /// dropped), `true` if it was admitted and recorded.
    pub fn check_and_record(&mut self, capacity: u32) -> bool {
        let now = Instant::now();
        self.expire_old_entries(now);

        if self.window.len() >= capacity as usize {
            return false;
        }

        self.window.push_back(now);

        if self.window.len() > MAX_WINDOW_ENTRIES {
            self.window.pop_front();
        }

        true
    }

    /// Number of admitted messages currently inside the window.
    #[must_use]
    #[allow(dead_code)]
    pub fn current_count(&self) -> usize {
        self.window.len()
    }
}
