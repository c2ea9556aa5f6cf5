// Sliding-window rate statistics
// Used for tick arrival rate and viewport emission rate

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::constants::RATE_WINDOW_SECS;

/// Counts events and reports their rate over a trailing window.
///
/// `record` is amortised O(1): entries older than the window are evicted as
/// new ones arrive, so the buffer never holds more than one window of events.
#[derive(Debug, Clone)]
pub struct RateStats {
    window: Duration,
    events: VecDeque<Instant>,
    total: u64,
}

impl Default for RateStats {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(RATE_WINDOW_SECS))
    }
}

impl RateStats {
    pub fn new(window: Duration) -> Self {
        RateStats {
            window,
            events: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.events.push_back(now);
        self.total += 1;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events per second over the window ending at `now`.
    pub fn rate_hz(&self, now: Instant) -> f64 {
        let in_window = self
            .events
            .iter()
            .rev()
            .take_while(|&&t| now.saturating_duration_since(t) <= self.window)
            .count();
        in_window as f64 / self.window.as_secs_f64()
    }

    /// Events recorded since construction or the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.events.clear();
        self.total = 0;
    }
}
