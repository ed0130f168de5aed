//! # nicring - Kernel-Bypass NIC Ring Engine
//!
//! nicring drives one hardware transmit/receive queue pair directly from user
//! space: zero-copy buffer pools feed the queues, completions are harvested
//! by polling or after a hardware notification, and received packets reach
//! the application either through a per-consumer sink or as batched event
//! records.
//!
//! ## Features
//!
//! - **Zero-copy buffer pools**: lazy growth, multi-owner reference counting,
//!   deferred release and donation to a process-wide pool
//! - **Adaptive completion moderation**: coalescing thresholds follow the
//!   observed byte rate and back off after idle intervals
//! - **Batched event completions**: a FIFO lane plus a fast-path slot, with
//!   exactly-once delivery per hardware event
//! - **Offload contexts**: inline TLS (transmit and receive) and storage
//!   protocol contexts with in-flight tracking
//! - **Narrow hardware interface**: the ring only sees capability traits; a
//!   software NIC implements them for tests and tools
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                         Ring                          │
//! ├───────────────────────────┬───────────────────────────┤
//! │  Transmit domain (lock)   │  Receive domain (lock)    │
//! │  - send / credits         │  - rx posting / reclaim   │
//! │  - tx completions         │  - rx completions         │
//! │  - offload contexts       │  - CQ moderation          │
//! ├───────────────────────────┴───────────────────────────┤
//! │  Buffer pools (own locks)  │  Event queue (spin lock) │
//! └───────────────────────────────────────────────────────┘
//!           │                              │
//!           ▼                              ▼
//! ┌─────────────────────────┐    ┌─────────────────────────┐
//! │  Hardware interface     │    │  Application            │
//! │  (queue pair, CQs)      │    │  (sinks, event records) │
//! └─────────────────────────┘    └─────────────────────────┘
//! ```

// Core modules
pub mod error;
pub mod buffers;
pub mod hw;
pub mod sync;

// Ring engine
pub mod moderation;
pub mod events;
pub mod offload;
pub mod ring;

// Main API re-exports
pub use error::{RingError, Result};
pub use buffers::{
    BufferDescriptor, BufferId, BufferKind, BufferPool, BufferPoolConfig, BufferPoolConfigBuilder,
    BufferPoolStats, AtomicBufferPoolStats, GlobalBufferPool,
};
pub use hw::{
    HwCapabilities, HwError, L2Address, NetDevice, OffloadCaps, QueuePairFactory, RateLimit,
    TlsInfo, TxAttributes,
};
pub use hw::sim::{SimConfig, SimDevice, SimNic};
pub use moderation::{CqModeration, ModerationConfig, ModerationInfo};
pub use events::{ConsumerId, EventCompletion, EventFlags, EventQueue, Lane, PacketRef};
pub use offload::{
    ContextRole, OffloadContext, OffloadEvent, OffloadStats, RxCallback, TlsProgressParams,
};
pub use ring::{
    ArmResult, DeliveryMode, Packet, QueueKind, Ring, RingConfig, RingConfigBuilder, RingStats,
    RxGuard, RxSink,
};
pub use sync::{CompletionChannel, PollSequence, SequenceNumber, WaitOutcome};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default receive buffer size, enough for a standard MTU frame
    pub const DEFAULT_RX_BUFFER_SIZE: usize = 2048;

    /// Default alignment for buffer starts
    pub const DEFAULT_ALIGNMENT: usize = 64;

    /// Completions harvested per poll call
    pub const DEFAULT_POLL_BUDGET: usize = 64;

    /// Upper bound for a blocking send waiting on transmit credits
    pub const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_millis(100);

    /// Granularity of blocking waits that poll between sleeps
    pub const BLOCKING_POLL_SLICE: Duration = Duration::from_millis(1);
}
