//! Ring configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffers::BufferPoolConfig;
use crate::error::{Result, RingError};
use crate::moderation::ModerationConfig;

/// How received packets reach the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Buffers are handed to a receive sink on every poll
    PerConsumer,
    /// Completions become event records collected with `poll_events`
    Batched,
}

/// Configuration for a ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring name, used in logs
    pub name: String,
    pub ring_id: u32,
    /// Send queue depth; one transmit credit per work request
    pub tx_depth: u32,
    /// Receive buffers kept posted to the device
    pub rx_depth: u32,
    pub tx_pool: BufferPoolConfig,
    pub zc_pool: BufferPoolConfig,
    pub rx_pool: BufferPoolConfig,
    pub delivery: DeliveryMode,
    pub moderation: ModerationConfig,
    /// Upper bound for one blocking notification wait; `None` waits forever
    pub notification_timeout: Option<Duration>,
    /// Completions harvested per poll call
    pub poll_budget: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            name: "ring".to_string(),
            ring_id: 0,
            tx_depth: 2048,
            rx_depth: 1024,
            tx_pool: BufferPoolConfig::new("tx"),
            zc_pool: BufferPoolConfig::new("zc").with_capacity(1024),
            rx_pool: BufferPoolConfig::new("rx")
                .with_buffer_size(crate::config::DEFAULT_RX_BUFFER_SIZE)
                .with_capacity(2048),
            delivery: DeliveryMode::PerConsumer,
            moderation: ModerationConfig::default(),
            notification_timeout: Some(Duration::from_millis(100)),
            poll_budget: crate::config::DEFAULT_POLL_BUDGET,
        }
    }
}

impl RingConfig {
    /// Create a new configuration with custom name and id
    pub fn new(name: impl Into<String>, ring_id: u32) -> Self {
        Self {
            name: name.into(),
            ring_id,
            ..Default::default()
        }
    }

    pub fn with_depths(mut self, tx_depth: u32, rx_depth: u32) -> Self {
        self.tx_depth = tx_depth;
        self.rx_depth = rx_depth;
        self
    }

    pub fn with_tx_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.tx_pool = pool;
        self
    }

    pub fn with_rx_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.rx_pool = pool;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_moderation(mut self, moderation: ModerationConfig) -> Self {
        self.moderation = moderation;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tx_depth == 0 || self.rx_depth == 0 {
            return Err(RingError::invalid_parameter(
                "depth",
                "Queue depths cannot be zero",
            ));
        }

        if self.rx_pool.capacity < self.rx_depth as usize {
            return Err(RingError::invalid_parameter(
                "rx_pool",
                format!(
                    "Receive pool capacity {} cannot keep {} buffers posted",
                    self.rx_pool.capacity, self.rx_depth
                ),
            ));
        }

        if self.poll_budget == 0 {
            return Err(RingError::invalid_parameter(
                "poll_budget",
                "Poll budget cannot be zero",
            ));
        }

        self.tx_pool.validate()?;
        self.zc_pool.validate()?;
        self.rx_pool.validate()?;
        self.moderation.validate()?;
        Ok(())
    }
}

/// Builder pattern for ring configuration
pub struct RingConfigBuilder {
    config: RingConfig,
}

impl RingConfigBuilder {
    pub fn new(name: impl Into<String>, ring_id: u32) -> Self {
        Self {
            config: RingConfig::new(name, ring_id),
        }
    }

    pub fn tx_depth(mut self, depth: u32) -> Self {
        self.config.tx_depth = depth;
        self
    }

    pub fn rx_depth(mut self, depth: u32) -> Self {
        self.config.rx_depth = depth;
        self
    }

    pub fn tx_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.config.tx_pool = pool;
        self
    }

    pub fn zc_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.config.zc_pool = pool;
        self
    }

    pub fn rx_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.config.rx_pool = pool;
        self
    }

    pub fn delivery(mut self, delivery: DeliveryMode) -> Self {
        self.config.delivery = delivery;
        self
    }

    pub fn moderation(mut self, moderation: ModerationConfig) -> Self {
        self.config.moderation = moderation;
        self
    }

    pub fn notification_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.notification_timeout = timeout;
        self
    }

    pub fn poll_budget(mut self, budget: usize) -> Self {
        self.config.poll_budget = budget;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<RingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
