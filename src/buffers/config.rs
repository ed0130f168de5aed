//! Buffer pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RingError};

/// Configuration for a ring buffer pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Name of the pool, used in logs
    pub name: String,
    /// Size of each buffer in bytes
    pub buffer_size: usize,
    /// Maximum number of buffers the pool may materialize
    pub capacity: usize,
    /// Number of buffers materialized per growth step
    pub grow_step: usize,
    /// Alignment of each buffer start
    pub alignment: usize,
    /// Materialize the full capacity at construction instead of on demand
    pub prefill: bool,
    /// How long a blocking acquisition may wait
    pub acquire_timeout: Option<Duration>,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            name: "tx".to_string(),
            buffer_size: 2048,
            capacity: 4096,
            grow_step: 256,
            alignment: crate::config::DEFAULT_ALIGNMENT,
            prefill: false,
            acquire_timeout: Some(Duration::from_millis(100)),
        }
    }
}

impl BufferPoolConfig {
    /// Create a new configuration with custom name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set maximum buffer count
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set growth step
    pub fn with_grow_step(mut self, step: usize) -> Self {
        self.grow_step = step;
        self
    }

    /// Set buffer alignment
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set prefill behavior
    pub fn with_prefill(mut self, prefill: bool) -> Self {
        self.prefill = prefill;
        self
    }

    /// Set blocking acquisition timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(RingError::invalid_parameter(
                "buffer_size",
                "Buffer size cannot be zero",
            ));
        }

        if self.buffer_size > u32::MAX as usize {
            return Err(RingError::invalid_parameter(
                "buffer_size",
                "Buffer size must fit a scatter/gather length",
            ));
        }

        if self.capacity == 0 {
            return Err(RingError::invalid_parameter(
                "capacity",
                "Capacity cannot be zero",
            ));
        }

        if self.grow_step == 0 {
            return Err(RingError::invalid_parameter(
                "grow_step",
                "Growth step cannot be zero",
            ));
        }

        if !self.alignment.is_power_of_two() || self.alignment > 4096 {
            return Err(RingError::invalid_parameter(
                "alignment",
                "Alignment must be a power of two no larger than a page",
            ));
        }

        Ok(())
    }

    /// Distance between consecutive buffers in a region
    pub fn stride(&self) -> usize {
        (self.buffer_size + self.alignment - 1) & !(self.alignment - 1)
    }

    /// Memory needed to materialize the full capacity
    pub fn total_memory_required(&self) -> usize {
        self.stride() * self.capacity
    }
}

/// Builder pattern for buffer pool configuration
pub struct BufferPoolConfigBuilder {
    config: BufferPoolConfig,
}

impl BufferPoolConfigBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: BufferPoolConfig::new(name),
        }
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn grow_step(mut self, step: usize) -> Self {
        self.config.grow_step = step;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = alignment;
        self
    }

    pub fn prefill(mut self, enable: bool) -> Self {
        self.config.prefill = enable;
        self
    }

    /// Set timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = Some(timeout);
        self
    }

    /// Blocking acquisitions wait indefinitely
    pub fn no_timeout(mut self) -> Self {
        self.config.acquire_timeout = None;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<BufferPoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates() {
        let config = BufferPoolConfigBuilder::new("zc")
            .buffer_size(1500)
            .capacity(64)
            .grow_step(16)
            .build()
            .unwrap();
        assert_eq!(config.stride(), 1536);
        assert_eq!(config.total_memory_required(), 1536 * 64);

        let err = BufferPoolConfigBuilder::new("bad").alignment(3).build();
        assert!(err.is_err());

        let err = BufferPoolConfig::new("bad").with_capacity(0).validate();
        assert!(err.is_err());
    }
}
