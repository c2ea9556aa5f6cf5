// Per-tool emission throttle
// Decouples the tracking input rate from the rate at which viewports are updated

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Leaky-bucket throttle keyed by tool name.
///
/// A tool is due when at least one emission interval has passed since its
/// last emission slot. Ticks arriving in between are dropped, never queued.
/// Slots advance by exactly one interval, so arrival jitter does not stretch
/// the window; after a gap of two or more intervals the schedule restarts at
/// the arriving tick.
#[derive(Debug, Clone)]
pub struct EmissionThrottle {
    interval: Duration,
    last_emitted: HashMap<String, Instant>,
}

impl EmissionThrottle {
    /// `target_rate_hz` must be positive; non-positive rates disable throttling.
    pub fn new(target_rate_hz: f64) -> Self {
        let interval = if target_rate_hz.is_finite() && target_rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / target_rate_hz)
        } else {
            Duration::ZERO
        };
        EmissionThrottle {
            interval,
            last_emitted: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true and records the emission if `tool` is due at `now`.
    pub fn should_emit(&mut self, tool: &str, now: Instant) -> bool {
        match self.last_emitted.get_mut(tool) {
            Some(last) => {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < self.interval {
                    return false;
                }
                *last = if elapsed >= self.interval * 2 {
                    now
                } else {
                    *last + self.interval
                };
                true
            }
            None => {
                self.last_emitted.insert(tool.to_string(), now);
                true
            }
        }
    }

    /// Forget every tool's last emission
    pub fn reset(&mut self) {
        self.last_emitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hundred_hz_into_twenty_five() {
        let mut throttle = EmissionThrottle::new(25.0);
        let start = Instant::now();
        let emitted: Vec<u64> = (0..100)
            .filter(|i| throttle.should_emit("pointer", start + Duration::from_millis(i * 10)))
            .collect();
        assert_eq!(emitted.len(), 25);
        assert_eq!(&emitted[..4], &[0, 4, 8, 12]);
    }

    #[test]
    fn test_jittered_arrivals_keep_target_rate() {
        let mut throttle = EmissionThrottle::new(25.0);
        let start = Instant::now();
        let emitted = (0..100u64)
            .filter(|&i| {
                // 10 ms spacing, each tick up to 0.1 ms early or late
                let jitter_us = ((i * 37 + 11) % 200) as i64 - 100;
                let at = start + Duration::from_micros(1_000 + i * 10_000);
                let at = if jitter_us < 0 {
                    at - Duration::from_micros(jitter_us.unsigned_abs())
                } else {
                    at + Duration::from_micros(jitter_us as u64)
                };
                throttle.should_emit("pointer", at)
            })
            .count();
        assert!((24..=26).contains(&emitted), "got {emitted}");
    }

    #[test]
    fn test_schedule_restarts_after_gap() {
        let mut throttle = EmissionThrottle::new(10.0);
        let start = Instant::now();
        assert!(throttle.should_emit("pointer", start));
        // Long pause, then ticks resume: no burst of catch-up emissions
        let resumed = start + Duration::from_millis(1_000);
        assert!(throttle.should_emit("pointer", resumed));
        assert!(!throttle.should_emit("pointer", resumed + Duration::from_millis(10)));
        assert!(throttle.should_emit("pointer", resumed + Duration::from_millis(100)));
    }

    #[test]
    fn test_tools_are_independent() {
        let mut throttle = EmissionThrottle::new(10.0);
        let now = Instant::now();
        assert!(throttle.should_emit("pointer", now));
        assert!(throttle.should_emit("reference", now));
        assert!(!throttle.should_emit("pointer", now + Duration::from_millis(50)));
        assert!(throttle.should_emit("pointer", now + Duration::from_millis(100)));
    }

    #[test]
    fn test_reset_and_unthrottled() {
        let mut throttle = EmissionThrottle::new(1.0);
        let now = Instant::now();
        assert!(throttle.should_emit("pointer", now));
        assert!(!throttle.should_emit("pointer", now));
        throttle.reset();
        assert!(throttle.should_emit("pointer", now));

        let mut open = EmissionThrottle::new(0.0);
        assert_eq!(open.interval(), Duration::ZERO);
        assert!(open.should_emit("pointer", now));
        assert!(open.should_emit("pointer", now));
    }
}
