//! Completion-queue poll sequence numbers
//!
//! Every poll that harvests at least one completion advances the queue's
//! sequence. Callers keep the last value they saw as a cursor and compare it
//! against the current one to detect new activity without re-scanning.
//! Cursors are only meaningful for the queue they were taken from; the
//! queue is named alongside the cursor wherever one is passed in.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sequence number type for strong typing
pub type SequenceNumber = u64;

/// Monotonic poll sequence of one completion queue
#[derive(Debug)]
pub struct PollSequence {
    queue_id: u32,
    polls: AtomicU64,
}

impl PollSequence {
    /// Create a sequence for queue `queue_id`, starting at zero polls
    pub fn new(queue_id: u32) -> Self {
        Self::at(queue_id, 0)
    }

    fn at(queue_id: u32, polls: SequenceNumber) -> Self {
        Self {
            queue_id,
            polls: AtomicU64::new(polls),
        }
    }

    /// Current sequence, with acquire ordering
    pub fn current(&self) -> SequenceNumber {
        self.polls.load(Ordering::Acquire)
    }

    /// Advance after a productive poll and return the new value
    pub fn advance(&self) -> SequenceNumber {
        self.polls.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publish the current value into a caller cursor
    pub fn publish(&self, cursor: &mut SequenceNumber) {
        *cursor = self.current();
    }

    /// Whether completions were harvested since `cursor` was taken
    pub fn has_advanced_since(&self, cursor: SequenceNumber) -> bool {
        self.current() != cursor
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let seq = PollSequence::new(3);
        let start = seq.current();
        assert_eq!(seq.queue_id(), 3);

        let first = seq.advance();
        let second = seq.advance();
        assert!(first > start);
        assert!(second > first);
        assert_eq!(seq.current(), second);
    }

    #[test]
    fn test_cursor_detects_activity() {
        let seq = PollSequence::new(1);
        let mut cursor = 0;
        seq.publish(&mut cursor);
        assert!(!seq.has_advanced_since(cursor));

        seq.advance();
        assert!(seq.has_advanced_since(cursor));
    }

    #[test]
    fn test_no_wrap_past_32_bits() {
        let seq = PollSequence::at(2, u64::from(u32::MAX));
        let before = seq.current();
        let after = seq.advance();
        assert_eq!(after, 1 << 32);
        assert!(after > before);
        assert!(seq.has_advanced_since(before));
    }
}
