//! Completion moderation configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RingError};

/// Bounds and targets for adaptive completion moderation
///
/// The hardware-supported range differs between device generations, so
/// every bound is a parameter rather than a constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Push moderation settings to the hardware at all
    pub enabled: bool,
    /// Recompute from traffic; otherwise the defaults stay in place
    pub adaptive: bool,
    /// Nominal time between two recomputations
    pub interval: Duration,
    pub default_period_usec: u32,
    pub default_count: u32,
    pub min_period_usec: u32,
    pub max_period_usec: u32,
    pub min_count: u32,
    pub max_count: u32,
    /// Below this byte rate (bytes/s) moderation is minimal
    pub latency_byte_rate: u64,
    /// At or above this byte rate (bytes/s) the maximum period applies
    pub saturation_byte_rate: u64,
    /// Target completion events per second
    pub interrupt_rate: u32,
    /// Idle intervals before the thresholds start backing off
    pub idle_backoff_rounds: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adaptive: true,
            interval: Duration::from_millis(250),
            default_period_usec: 50,
            default_count: 48,
            min_period_usec: 0,
            max_period_usec: 250,
            min_count: 1,
            max_count: 560,
            latency_byte_rate: 8 * 1024 * 1024,
            saturation_byte_rate: 1024 * 1024 * 1024,
            interrupt_rate: 5000,
            idle_backoff_rounds: 5,
        }
    }
}

impl ModerationConfig {
    /// Moderation switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Fixed default thresholds, no adaptation
    pub fn fixed() -> Self {
        Self {
            adaptive: false,
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_period_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_period_usec = min;
        self.max_period_usec = max;
        self
    }

    pub fn with_count_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_count = min;
        self.max_count = max;
        self
    }

    pub fn with_defaults(mut self, period_usec: u32, count: u32) -> Self {
        self.default_period_usec = period_usec;
        self.default_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(RingError::invalid_parameter(
                "interval",
                "Moderation interval cannot be zero",
            ));
        }

        if self.min_period_usec > self.max_period_usec
            || !(self.min_period_usec..=self.max_period_usec).contains(&self.default_period_usec)
        {
            return Err(RingError::invalid_parameter(
                "period",
                "Default period must lie within [min, max]",
            ));
        }

        if self.min_count > self.max_count
            || !(self.min_count..=self.max_count).contains(&self.default_count)
        {
            return Err(RingError::invalid_parameter(
                "count",
                "Default count must lie within [min, max]",
            ));
        }

        if self.latency_byte_rate >= self.saturation_byte_rate {
            return Err(RingError::invalid_parameter(
                "latency_byte_rate",
                "Latency threshold must be below the saturation rate",
            ));
        }

        if self.interrupt_rate == 0 {
            return Err(RingError::invalid_parameter(
                "interrupt_rate",
                "Interrupt rate cannot be zero",
            ));
        }

        if self.idle_backoff_rounds == 0 {
            return Err(RingError::invalid_parameter(
                "idle_backoff_rounds",
                "Backoff needs at least one idle round",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ModerationConfig::default().validate().is_ok());
        assert!(ModerationConfig::fixed().validate().is_ok());
    }

    #[test]
    fn test_rejects_default_outside_bounds() {
        let config = ModerationConfig::default().with_period_bounds(100, 200);
        assert!(config.validate().is_err());

        let config = ModerationConfig::default().with_count_bounds(64, 32);
        assert!(config.validate().is_err());
    }
}
