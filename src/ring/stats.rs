//! Ring statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of ring counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Transmit completions reporting an error
    pub tx_errors: u64,
    /// Sends refused for lack of credits or a full queue
    pub tx_backpressure: u64,
    pub tx_completions: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_completions: u64,
    /// Offload work completions
    pub offload_completions: u64,
    /// Notifications received from completion channels
    pub notifications: u64,
    /// Moderation settings pushed to the hardware
    pub moderation_changes: u64,
    /// Zero-copy completions reported to the user
    pub zc_completions: u64,
}

impl RingStats {
    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "RingStats {{ tx: {} pkts / {} bytes ({} errors, {} backpressure), \
             rx: {} pkts / {} bytes ({} errors), offload: {}, notifications: {} }}",
            self.tx_packets,
            self.tx_bytes,
            self.tx_errors,
            self.tx_backpressure,
            self.rx_packets,
            self.rx_bytes,
            self.rx_errors,
            self.offload_completions,
            self.notifications
        )
    }
}

/// Thread-safe ring counters
#[derive(Debug, Default)]
pub struct AtomicRingStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
    pub tx_backpressure: AtomicU64,
    pub tx_completions: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_completions: AtomicU64,
    pub offload_completions: AtomicU64,
    pub notifications: AtomicU64,
    pub moderation_changes: AtomicU64,
    pub zc_completions: AtomicU64,
}

impl AtomicRingStats {
    pub fn record_send(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_receive(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> RingStats {
        RingStats {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            tx_backpressure: self.tx_backpressure.load(Ordering::Relaxed),
            tx_completions: self.tx_completions.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_completions: self.rx_completions.load(Ordering::Relaxed),
            offload_completions: self.offload_completions.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            moderation_changes: self.moderation_changes.load(Ordering::Relaxed),
            zc_completions: self.zc_completions.load(Ordering::Relaxed),
        }
    }
}
