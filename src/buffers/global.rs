//! Process-wide buffer pool
//!
//! Rings that shut down donate their free buffers here; growing pools take
//! from here before mapping new memory. Buffers are keyed by shape so a pool
//! only receives buffers of its own size and stride.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;

use super::region::RawBuffer;

lazy_static! {
    static ref SHARED_GLOBAL_POOL: Arc<GlobalBufferPool> = Arc::new(GlobalBufferPool::new());
}

/// Free buffers handed off between rings
#[derive(Debug, Default)]
pub struct GlobalBufferPool {
    free: Mutex<HashMap<(usize, usize), Vec<RawBuffer>>>,
}

impl GlobalBufferPool {
    /// Create a standalone pool (tests and embedders)
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool shared by every ring in the process
    pub fn shared() -> Arc<GlobalBufferPool> {
        Arc::clone(&SHARED_GLOBAL_POOL)
    }

    /// Add buffers to the pool
    pub fn donate(&self, buffers: Vec<RawBuffer>) {
        if buffers.is_empty() {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        for buffer in buffers {
            free.entry(buffer.shape()).or_default().push(buffer);
        }
    }

    /// Take up to `max` buffers of the given shape
    pub fn take(&self, shape: (usize, usize), max: usize) -> Vec<RawBuffer> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        match free.get_mut(&shape) {
            Some(list) => {
                let keep = list.len().saturating_sub(max);
                list.split_off(keep)
            }
            None => Vec::new(),
        }
    }

    /// Number of free buffers of the given shape
    pub fn available(&self, shape: (usize, usize)) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&shape)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::region::BufferRegion;

    #[test]
    fn test_donate_and_take_by_shape() {
        let global = GlobalBufferPool::new();
        let small = BufferRegion::new(256, 256, 4).unwrap();
        let large = BufferRegion::new(2048, 2048, 2).unwrap();

        global.donate(small.buffers());
        global.donate(large.buffers());

        assert_eq!(global.available((256, 256)), 4);
        assert_eq!(global.available((2048, 2048)), 2);

        let taken = global.take((256, 256), 3);
        assert_eq!(taken.len(), 3);
        assert_eq!(global.available((256, 256)), 1);
        assert!(global.take((512, 512), 8).is_empty());
    }
}
