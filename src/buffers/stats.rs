//! Buffer pool statistics tracking

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of buffer pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers currently materialized (free + borrowed)
    pub materialized: usize,
    /// Buffers currently borrowed
    pub borrowed: usize,
    /// Peak number of buffers borrowed simultaneously
    pub peak_borrowed: usize,
    /// Buffers handed out
    pub acquisitions: u64,
    /// Buffers returned to the free list
    pub releases: u64,
    /// Acquisitions that failed
    pub failures: u64,
    /// Growth steps performed
    pub growths: u64,
    /// Buffers donated to the process-wide pool
    pub donated: u64,
    /// Releases that had to be deferred because the pool lock was busy
    pub deferred: u64,
}

impl BufferPoolStats {
    /// Fraction of materialized buffers currently borrowed
    pub fn utilization(&self) -> f64 {
        if self.materialized == 0 {
            return 0.0;
        }
        self.borrowed as f64 / self.materialized as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "BufferPoolStats {{ materialized: {}, borrowed: {}, peak: {}, \
             acquisitions: {}, releases: {}, failures: {}, utilization: {:.2}% }}",
            self.materialized,
            self.borrowed,
            self.peak_borrowed,
            self.acquisitions,
            self.releases,
            self.failures,
            self.utilization() * 100.0
        )
    }
}

/// Thread-safe counters for a buffer pool
#[derive(Debug, Default)]
pub struct AtomicBufferPoolStats {
    pub materialized: AtomicUsize,
    pub borrowed: AtomicUsize,
    pub peak_borrowed: AtomicUsize,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub failures: AtomicU64,
    pub growths: AtomicU64,
    pub donated: AtomicU64,
    pub deferred: AtomicU64,
}

impl AtomicBufferPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` buffers handed out; `borrowed` is the new total
    pub fn record_acquire(&self, count: usize, borrowed: usize) {
        self.acquisitions.fetch_add(count as u64, Ordering::Relaxed);
        self.borrowed.store(borrowed, Ordering::Relaxed);
        self.peak_borrowed.fetch_max(borrowed, Ordering::Relaxed);
    }

    /// Record `count` buffers returned; `borrowed` is the new total
    pub fn record_release(&self, count: usize, borrowed: usize) {
        self.releases.fetch_add(count as u64, Ordering::Relaxed);
        self.borrowed.store(borrowed, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_growth(&self, materialized: usize) {
        self.growths.fetch_add(1, Ordering::Relaxed);
        self.materialized.store(materialized, Ordering::Relaxed);
    }

    pub fn record_donation(&self, count: usize, materialized: usize) {
        self.donated.fetch_add(count as u64, Ordering::Relaxed);
        self.materialized.store(materialized, Ordering::Relaxed);
    }

    pub fn record_deferred(&self, count: usize) {
        self.deferred.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> BufferPoolStats {
        BufferPoolStats {
            materialized: self.materialized.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            peak_borrowed: self.peak_borrowed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
            donated: self.donated.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}
