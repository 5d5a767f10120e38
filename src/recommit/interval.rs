use std::time::Duration;

use crate::config::BuilderConfig;

/// Lowest interval an operator may configure.
pub const DEFAULT_RECOMMIT_FLOOR: Duration = Duration::from_secs(1);
/// Upper bound the interval can grow to.
pub const DEFAULT_MAX_RECOMMIT_INTERVAL: Duration = Duration::from_secs(15);
/// Weight given to the new target when the interval is adjusted.
pub const DEFAULT_ADJUST_RATIO: f64 = 0.1;
/// Pushes increases up and decreases down by a fixed amount.
pub const DEFAULT_ADJUST_BIAS: Duration = Duration::from_millis(200);
/// Increase ratios below this are raised to it.
pub const MIN_FILL_RATIO: f64 = 0.1;

/// Adaptive period between re-assembly attempts.
///
/// Each adjustment moves the current interval a fixed share (`adjust_ratio`) of the way
/// toward a target. Increases target `current / ratio + bias` and are capped at `max`;
/// decreases target `min - bias` and never go below `min`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommitInterval {
    min: Duration,
    current: Duration,
    max: Duration,
    floor: Duration,
    adjust_ratio: f64,
    adjust_bias: Duration,
}

impl RecommitInterval {
    pub fn new(min: Duration, max: Duration, floor: Duration, adjust_ratio: f64, adjust_bias: Duration) -> Self {
        let min = min.max(floor);
        Self { min, current: min, max: max.max(min), floor, adjust_ratio, adjust_bias }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(
            config.min_recommit_interval,
            config.max_recommit_interval,
            config.min_recommit_floor,
            config.interval_adjust_ratio,
            config.interval_adjust_bias,
        )
    }

    pub const fn min(&self) -> Duration {
        self.min
    }

    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Grows the interval after an attempt was interrupted having filled `ratio` of the block.
    pub fn increase(&mut self, ratio: f64) -> Duration {
        let ratio = if ratio.is_finite() { ratio.max(MIN_FILL_RATIO) } else { MIN_FILL_RATIO };
        let prev = self.current.as_nanos() as f64;
        let target = prev / ratio + self.adjust_bias.as_nanos() as f64;
        let next = (prev * (1.0 - self.adjust_ratio) + self.adjust_ratio * target).min(self.max.as_nanos() as f64);
        self.current = Duration::from_nanos(next as u64);
        self.current
    }

    /// Shrinks the interval back toward the configured minimum.
    pub fn decrease(&mut self) -> Duration {
        let prev = self.current.as_nanos() as f64;
        let target = self.min.as_nanos() as f64 - self.adjust_bias.as_nanos() as f64;
        let next = (prev * (1.0 - self.adjust_ratio) + self.adjust_ratio * target).max(self.min.as_nanos() as f64);
        self.current = Duration::from_nanos(next as u64);
        self.current
    }

    /// Resets both the minimum and the current interval. Values below the floor are raised to it.
    pub fn set(&mut self, interval: Duration) -> Duration {
        let interval = interval.max(self.floor);
        self.min = interval;
        self.current = interval;
        self.max = self.max.max(interval);
        interval
    }
}

impl Default for RecommitInterval {
    fn default() -> Self {
        Self::from_config(&BuilderConfig::default())
    }
}
