//! Synchronization primitives for the ring's polling and blocking paths
//!
//! - Poll sequence numbers that let callers detect new completions cheaply
//! - eventfd-based completion channels for blocking waits

pub mod notify;
pub mod sequence;

pub use notify::{ChannelStats, CompletionChannel, WaitOutcome};
pub use sequence::{PollSequence, SequenceNumber};
