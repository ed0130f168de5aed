//! Anonymous memory regions carved into fixed-size packet buffers
//!
//! A region is mapped once and never moves, so raw buffer addresses stay
//! valid for as long as any [`RawBuffer`] keeps the region alive. These are
//! the addresses handed to the NIC in scatter/gather entries.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, RingError};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// A mapped region holding `count` buffers of `stride` bytes
#[derive(Debug)]
pub struct BufferRegion {
    id: u64,
    /// Memory mapping, kept alive for the base pointer
    _mmap: MmapMut,
    base: NonNull<u8>,
    buffer_size: usize,
    stride: usize,
    count: usize,
}

impl BufferRegion {
    /// Map a region for `count` buffers
    pub fn new(buffer_size: usize, stride: usize, count: usize) -> Result<Arc<Self>> {
        if count == 0 || stride < buffer_size {
            return Err(RingError::invalid_parameter(
                "count",
                "Region must hold at least one buffer of the requested size",
            ));
        }

        let len = stride
            .checked_mul(count)
            .ok_or_else(|| RingError::invalid_parameter("count", "Region size overflows"))?;

        let mut mmap = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|e| RingError::from_io(e, "Failed to map buffer region"))?;

        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| RingError::invalid_parameter("region", "Mapping returned null"))?;

        Ok(Arc::new(Self {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            _mmap: mmap,
            base,
            buffer_size,
            stride,
            count,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Split the region into raw buffers
    pub fn buffers(self: &Arc<Self>) -> Vec<RawBuffer> {
        (0..self.count)
            .map(|index| RawBuffer {
                region: Arc::clone(self),
                index,
            })
            .collect()
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.count);
        // SAFETY: index < count, so the offset stays inside the mapping
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.stride)) }
    }
}

// The mapping is owned by the region and only accessed through buffer
// ownership rules enforced by the pool.
unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

/// One buffer-sized slot of a region
#[derive(Debug, Clone)]
pub struct RawBuffer {
    region: Arc<BufferRegion>,
    index: usize,
}

impl RawBuffer {
    pub fn ptr(&self) -> NonNull<u8> {
        self.region.slot_ptr(self.index)
    }

    pub fn addr(&self) -> u64 {
        self.ptr().as_ptr() as u64
    }

    pub fn capacity(&self) -> usize {
        self.region.buffer_size
    }

    /// Pool key: buffers are interchangeable only with equal size and stride
    pub fn shape(&self) -> (usize, usize) {
        (self.region.buffer_size, self.region.stride)
    }

    pub fn region_id(&self) -> u64 {
        self.region.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_split() {
        let region = BufferRegion::new(1500, 1536, 8).unwrap();
        let buffers = region.buffers();
        assert_eq!(buffers.len(), 8);
        assert_eq!(buffers[1].addr() - buffers[0].addr(), 1536);
        assert_eq!(buffers[0].capacity(), 1500);
        assert_eq!(buffers[0].addr() % 64, 0);
    }

    #[test]
    fn test_region_rejects_small_stride() {
        assert!(BufferRegion::new(2048, 1024, 4).is_err());
        assert!(BufferRegion::new(64, 64, 0).is_err());
    }
}
