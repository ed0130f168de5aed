//! Batched event-completion delivery
//!
//! In batched mode the ring turns hardware completions into
//! [`EventCompletion`] records that the application collects in bulk
//! instead of polling per consumer.

pub mod completion;
pub mod queue;

pub use completion::{ConsumerId, EventCompletion, EventFlags, PacketRef};
pub use queue::{ConsumerState, EventQueue, EventQueueStats, Lane};
