//! Poll cadence.
//!
//! Backends need a few seconds before any task can be ready, so the first
//! wait is drawn from a longer band than the waits between later polls.

use std::time::Duration;

use rand::Rng;

const DEFAULT_INITIAL_MIN_SECS: u64 = 5;
const DEFAULT_INITIAL_MAX_SECS: u64 = 10;
const DEFAULT_SUBSEQUENT_MIN_SECS: u64 = 2;
const DEFAULT_SUBSEQUENT_MAX_SECS: u64 = 5;

/// Inclusive range a single wait is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayBand {
    min: Duration,
    max: Duration,
}

impl DelayBand {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: if max < min { min } else { max },
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let mut rng = rand::thread_rng();
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Waits applied before each poll of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub initial: DelayBand,
    pub subsequent: DelayBand,
}

impl PollSchedule {
    pub fn new(initial: DelayBand, subsequent: DelayBand) -> Self {
        Self {
            initial,
            subsequent,
        }
    }

    /// Deterministic schedule, mostly useful in tests.
    pub fn fixed(initial: Duration, subsequent: Duration) -> Self {
        Self::new(DelayBand::fixed(initial), DelayBand::fixed(subsequent))
    }

    /// Delay before the poll numbered `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.initial.sample()
        } else {
            self.subsequent.sample()
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(
            DelayBand::new(
                Duration::from_secs(DEFAULT_INITIAL_MIN_SECS),
                Duration::from_secs(DEFAULT_INITIAL_MAX_SECS),
            ),
            DelayBand::new(
                Duration::from_secs(DEFAULT_SUBSEQUENT_MIN_SECS),
                Duration::from_secs(DEFAULT_SUBSEQUENT_MAX_SECS),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bands_stay_in_range() {
        let schedule = PollSchedule::default();
        for _ in 0..50 {
            let first = schedule.delay_for(0);
            assert!(first >= Duration::from_secs(5) && first <= Duration::from_secs(10));
            let next = schedule.delay_for(3);
            assert!(next >= Duration::from_secs(2) && next <= Duration::from_secs(5));
        }
    }

    #[test]
    fn inverted_band_collapses_to_min() {
        let band = DelayBand::new(Duration::from_secs(4), Duration::from_secs(1));
        assert_eq!(band.sample(), Duration::from_secs(4));
    }
}
