//! Zero-copy buffer management
//!
//! Buffers live in anonymous memory regions and are handed out by bounded
//! pools as reference-counted descriptors. Pools grow lazily and donate
//! their free buffers to a process-wide pool when a ring shuts down.

pub mod buffer;
pub mod config;
pub mod global;
pub mod pool;
pub mod region;
pub mod stats;

// Re-export main types
pub use buffer::{BufferDescriptor, BufferId, BufferKind};
pub use config::{BufferPoolConfig, BufferPoolConfigBuilder};
pub use global::GlobalBufferPool;
pub use pool::BufferPool;
pub use region::{BufferRegion, RawBuffer};
pub use stats::{AtomicBufferPoolStats, BufferPoolStats};
