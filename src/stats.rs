//! Throughput statistics and receive-loop pacing.

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Rates over the last completed window, per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    pub valid_message_rate: f64,
    pub valid_byte_rate: f64,
    pub byte_rate: f64,
    pub aligned_byte_rate: f64,
    pub available_byte_rate: f64,
}

/// Byte and message counts from one receive iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationCounts {
    pub valid_messages: usize,
    pub valid_bytes: usize,
    /// Bytes processed, including the carried remainder.
    pub bytes: usize,
    pub aligned_bytes: usize,
    /// Bytes read from the transport this iteration.
    pub available_bytes: usize,
}

/// Accumulates counts and turns them into rates once per window.
#[derive(Debug, Clone)]
pub struct RateCounter {
    window: Duration,
    reference: Option<Instant>,
    totals: IterationCounts,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            reference: None,
            totals: IterationCounts::default(),
        }
    }

    /// Add one iteration. `window_start` marks when the first counted bytes
    /// started arriving (loop start minus the preceding sleep).
    ///
    /// Returns fresh rates when the window has elapsed; counters then restart.
    pub fn record(
        &mut self,
        counts: IterationCounts,
        window_start: Instant,
        now: Instant,
    ) -> Option<RateStats> {
        let reference = *self.reference.get_or_insert(window_start);

        self.totals.valid_messages += counts.valid_messages;
        self.totals.valid_bytes += counts.valid_bytes;
        self.totals.bytes += counts.bytes;
        self.totals.aligned_bytes += counts.aligned_bytes;
        self.totals.available_bytes += counts.available_bytes;

        let elapsed = now.saturating_duration_since(reference);
        if elapsed <= self.window || elapsed.is_zero() {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let rates = RateStats {
            valid_message_rate: self.totals.valid_messages as f64 / secs,
            valid_byte_rate: self.totals.valid_bytes as f64 / secs,
            byte_rate: self.totals.bytes as f64 / secs,
            aligned_byte_rate: self.totals.aligned_bytes as f64 / secs,
            available_byte_rate: self.totals.available_bytes as f64 / secs,
        };
        self.reference = None;
        self.totals = IterationCounts::default();

        info!(
            "CPC valid message rate: {:.2} kHz",
            rates.valid_message_rate / 1000.0
        );
        Some(rates)
    }
}

/// Sleep scheduling for the receive loop.
///
/// Each iteration sleeps for whatever is left of the target period after
/// processing. Overruns do not accumulate: the next sleep is simply zero.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    target: Duration,
    next_sleep: Duration,
}

impl Pacer {
    pub fn new(target: Duration) -> Self {
        Self {
            target,
            next_sleep: target,
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    pub fn next_sleep(&self) -> Duration {
        self.next_sleep
    }

    /// Recompute the sleep from how long this iteration took.
    pub fn update(&mut self, loop_start: Instant, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(loop_start);
        self.next_sleep = match self.target.checked_sub(elapsed) {
            Some(rest) if !rest.is_zero() => rest,
            _ => {
                warn!(
                    "CPC running behind: iteration took {:?}, target {:?}",
                    elapsed, self.target
                );
                Duration::ZERO
            }
        };
        self.next_sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(valid: usize) -> IterationCounts {
        IterationCounts {
            valid_messages: valid,
            valid_bytes: valid * 14,
            bytes: valid * 14 + 3,
            aligned_bytes: valid * 14,
            available_bytes: valid * 14,
        }
    }

    #[test]
    fn rates_appear_after_window_and_reset() {
        let window = Duration::from_secs(5);
        let mut counter = RateCounter::new(window);
        let t0 = Instant::now();

        assert!(counter
            .record(counts(20), t0, t0 + Duration::from_secs(1))
            .is_none());
        let rates = counter
            .record(counts(80), t0, t0 + Duration::from_secs(10))
            .unwrap();
        assert!((rates.valid_message_rate - 10.0).abs() < 1e-9);
        assert!((rates.valid_byte_rate - 140.0).abs() < 1e-9);

        // Counters restarted: a new window begins at the next record.
        let t1 = t0 + Duration::from_secs(10);
        assert!(counter
            .record(counts(1), t1, t1 + Duration::from_secs(1))
            .is_none());
    }

    #[test]
    fn pacer_sleeps_for_remaining_period() {
        let mut pacer = Pacer::new(Duration::from_millis(20));
        let start = Instant::now();
        let sleep = pacer.update(start, start + Duration::from_millis(5));
        assert_eq!(sleep, Duration::from_millis(15));
    }

    #[test]
    fn pacer_does_not_sleep_when_behind() {
        let mut pacer = Pacer::new(Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(
            pacer.update(start, start + Duration::from_millis(35)),
            Duration::ZERO
        );
        assert_eq!(pacer.next_sleep(), Duration::ZERO);
    }
}
