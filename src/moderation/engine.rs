//! Rate-adaptive completion moderation
//!
//! The receive path feeds cumulative packet and byte counters through
//! [`CqModeration::observe`]. Every interval the ring calls
//! [`CqModeration::recompute`], which turns the delta since the previous
//! round into a coalescing period and count:
//!
//! - below the latency byte rate both thresholds drop to their minimum
//! - above it the period grows linearly with byte rate up to the maximum,
//!   reached at the saturation rate
//! - the count targets the configured interrupt rate for the observed
//!   packet rate
//!
//! Idle intervals are counted as missed rounds. Once enough of them pile up
//! the thresholds are halved toward their minimum on every idle round.

use log::debug;

use crate::error::Result;
use crate::hw::CompletionQueue;

use super::config::ModerationConfig;

/// Adaptive moderation state of one completion queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationInfo {
    /// Coalescing period currently applied, in microseconds
    pub period: u32,
    /// Coalescing count currently applied
    pub count: u32,
    pub packets: u64,
    pub bytes: u64,
    pub prev_packets: u64,
    pub prev_bytes: u64,
    /// Consecutive intervals without completions
    pub missed_rounds: u32,
}

/// Completion moderation engine
#[derive(Debug)]
pub struct CqModeration {
    config: ModerationConfig,
    info: ModerationInfo,
    adjustments: u64,
}

impl CqModeration {
    pub fn new(config: ModerationConfig) -> Result<Self> {
        config.validate()?;
        let info = ModerationInfo {
            period: config.default_period_usec,
            count: config.default_count,
            ..Default::default()
        };
        Ok(Self {
            config,
            info,
            adjustments: 0,
        })
    }

    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    pub fn info(&self) -> &ModerationInfo {
        &self.info
    }

    /// Number of settings pushed to the hardware so far
    pub fn adjustments(&self) -> u64 {
        self.adjustments
    }

    /// Settings to program when the completion queue is created
    pub fn initial(&self) -> Option<(u32, u32)> {
        self.config
            .enabled
            .then_some((self.config.default_period_usec, self.config.default_count))
    }

    /// Account for newly harvested completions
    pub fn observe(&mut self, packets: u64, bytes: u64) {
        self.info.packets = self.info.packets.wrapping_add(packets);
        self.info.bytes = self.info.bytes.wrapping_add(bytes);
    }

    /// Derive new thresholds from the traffic since the last round
    ///
    /// Returns the new `(period, count)` when it differs from what is
    /// currently applied.
    pub fn recompute(&mut self) -> Option<(u32, u32)> {
        if !self.config.enabled || !self.config.adaptive {
            return None;
        }

        let packets = self.info.packets.wrapping_sub(self.info.prev_packets);
        let bytes = self.info.bytes.wrapping_sub(self.info.prev_bytes);
        self.info.prev_packets = self.info.packets;
        self.info.prev_bytes = self.info.bytes;

        let target = if packets == 0 {
            self.info.missed_rounds = self.info.missed_rounds.saturating_add(1);
            if self.info.missed_rounds < self.config.idle_backoff_rounds {
                return None;
            }
            self.backoff()
        } else {
            let rounds = u64::from(self.info.missed_rounds) + 1;
            self.info.missed_rounds = 0;
            let interval_ms = (self.config.interval.as_millis() as u64).max(1) * rounds;
            let byte_rate = bytes.saturating_mul(1000) / interval_ms;
            let packet_rate = packets.saturating_mul(1000) / interval_ms;
            (self.period_for(byte_rate), self.count_for(byte_rate, packet_rate))
        };

        (target != (self.info.period, self.info.count)).then_some(target)
    }

    /// Program `(period, count)` on the hardware queue
    pub fn apply(&mut self, cq: &mut dyn CompletionQueue, period: u32, count: u32) -> Result<()> {
        let period = period.clamp(self.config.min_period_usec, self.config.max_period_usec);
        let count = count.clamp(self.config.min_count, self.config.max_count);
        cq.modify_moderation(period, count)?;

        debug!(
            "CQ moderation {}us/{} -> {}us/{}",
            self.info.period, self.info.count, period, count
        );
        self.info.period = period;
        self.info.count = count;
        self.adjustments += 1;
        Ok(())
    }

    /// Coalescing period for a byte rate; non-decreasing in the rate
    pub fn period_for(&self, byte_rate: u64) -> u32 {
        let config = &self.config;
        if byte_rate <= config.latency_byte_rate {
            return config.min_period_usec;
        }
        if byte_rate >= config.saturation_byte_rate {
            return config.max_period_usec;
        }
        let span = u128::from(config.max_period_usec - config.min_period_usec);
        let offset = u128::from(byte_rate - config.latency_byte_rate);
        let range = u128::from(config.saturation_byte_rate - config.latency_byte_rate);
        config.min_period_usec + (span * offset / range) as u32
    }

    fn count_for(&self, byte_rate: u64, packet_rate: u64) -> u32 {
        if byte_rate <= self.config.latency_byte_rate {
            return self.config.min_count;
        }
        let per_interrupt = packet_rate / u64::from(self.config.interrupt_rate);
        per_interrupt.clamp(
            u64::from(self.config.min_count),
            u64::from(self.config.max_count),
        ) as u32
    }

    fn backoff(&self) -> (u32, u32) {
        (
            (self.info.period / 2).max(self.config.min_period_usec),
            (self.info.count / 2).max(self.config.min_count),
        )
    }
}
