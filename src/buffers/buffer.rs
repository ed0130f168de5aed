//! Zero-copy buffer descriptors
//!
//! A [`BufferDescriptor`] is an owned token for one reference to a pool
//! buffer. Tokens are not `Clone`; additional references are created with
//! [`BufferDescriptor::share`] and every token goes back through
//! [`BufferPool::release`](super::BufferPool::release). The buffer returns to
//! the free list when its last reference is released. A token dropped
//! without an explicit release is reclaimed through the pool's deferred path.

use std::{
    fmt,
    mem::ManuallyDrop,
    slice,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RingError};
use crate::hw::{Lkey, Sge};

use super::pool::PoolShared;
use super::region::RawBuffer;

/// Type tag of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// Ring-owned transmit buffer
    Tx,
    /// Ring-owned receive buffer
    Rx,
    /// Transmit buffer whose completion is reported back to the user
    ZeroCopy,
}

/// Stable identity of a pool buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub pool_id: u64,
    pub slot: usize,
}

/// Pool-side state shared by all tokens of one buffer
#[derive(Debug)]
pub(crate) struct BufferHeader {
    pub(crate) raw: RawBuffer,
    pub(crate) pool_id: u64,
    pub(crate) slot: usize,
    pub(crate) kind: BufferKind,
    pub(crate) owner_ring: u32,
    pub(crate) refs: AtomicU32,
    pub(crate) pool: Weak<PoolShared>,
}

impl BufferHeader {
    /// Drop `count` references; returns true when the last one went away
    pub(crate) fn drop_refs(&self, count: u32) -> Result<bool> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current < count {
                return Err(RingError::consistency(format!(
                    "buffer {}:{} released {} references but holds {}",
                    self.pool_id, self.slot, count, current
                )));
            }
            match self.refs.compare_exchange_weak(
                current,
                current - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current == count),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Owned reference to one zero-copy network buffer
pub struct BufferDescriptor {
    header: ManuallyDrop<Arc<BufferHeader>>,
    len: usize,
    hw_timestamp: u64,
    flow_tag: u32,
    zc_context: Option<u64>,
}

impl BufferDescriptor {
    pub(crate) fn new(header: Arc<BufferHeader>) -> Self {
        Self {
            header: ManuallyDrop::new(header),
            len: 0,
            hw_timestamp: 0,
            flow_tag: 0,
            zc_context: None,
        }
    }

    /// Give up the token without running the drop-reclaim path
    pub(crate) fn into_header(mut self) -> Arc<BufferHeader> {
        // SAFETY: the header is taken exactly once and `self` is forgotten
        // right after, so Drop never observes the emptied slot.
        let header = unsafe { ManuallyDrop::take(&mut self.header) };
        std::mem::forget(self);
        header
    }

    pub(crate) fn header(&self) -> &Arc<BufferHeader> {
        &self.header
    }

    /// Identity of the underlying buffer
    pub fn id(&self) -> BufferId {
        BufferId {
            pool_id: self.header.pool_id,
            slot: self.header.slot,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.header.kind
    }

    /// Ring that owns the pool this buffer came from
    pub fn owner_ring(&self) -> u32 {
        self.header.owner_ring
    }

    /// Current number of references (tokens plus logical references)
    pub fn ref_count(&self) -> u32 {
        self.header.refs.load(Ordering::Acquire)
    }

    /// Create another token for the same buffer
    pub fn share(&self) -> BufferDescriptor {
        self.header.refs.fetch_add(1, Ordering::AcqRel);
        BufferDescriptor {
            header: ManuallyDrop::new(Arc::clone(&self.header)),
            len: self.len,
            hw_timestamp: self.hw_timestamp,
            flow_tag: self.flow_tag,
            zc_context: self.zc_context,
        }
    }

    /// Add a logical reference carried by this token
    ///
    /// Settle it with [`BufferPool::release_multi_ref`](super::BufferPool::release_multi_ref).
    pub fn add_ref(&self) {
        self.header.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.header.raw.capacity()
    }

    /// Set the payload length
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(RingError::invalid_parameter(
                "len",
                format!("{} exceeds buffer capacity {}", len, self.capacity()),
            ));
        }
        self.len = len;
        Ok(())
    }

    /// Address of the payload as seen by the NIC
    pub fn addr(&self) -> u64 {
        self.header.raw.addr()
    }

    /// Scatter/gather entry covering the payload
    pub fn sge(&self, lkey: Lkey) -> Sge {
        Sge {
            addr: self.addr(),
            length: self.len as u32,
            lkey,
        }
    }

    /// Payload bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region outlives the header we hold and len <= capacity
        unsafe { slice::from_raw_parts(self.header.raw.ptr().as_ptr(), self.len) }
    }

    /// Mutable payload, only while this token is the sole reference
    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        if self.ref_count() != 1 {
            return None;
        }
        // SAFETY: a single reference means no other token can observe the
        // buffer, and `&mut self` prevents sharing for the borrow's duration.
        Some(unsafe { slice::from_raw_parts_mut(self.header.raw.ptr().as_ptr(), self.len) })
    }

    /// Copy `data` into the buffer and set the length
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity() {
            return Err(RingError::invalid_parameter(
                "data",
                format!("{} bytes exceed buffer capacity {}", data.len(), self.capacity()),
            ));
        }
        if self.ref_count() != 1 {
            return Err(RingError::invalid_parameter(
                "buffer",
                "cannot write a buffer that is shared",
            ));
        }
        // SAFETY: sole reference, bounds checked above
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.header.raw.ptr().as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }

    pub fn hw_timestamp(&self) -> u64 {
        self.hw_timestamp
    }

    pub fn set_hw_timestamp(&mut self, ticks: u64) {
        self.hw_timestamp = ticks;
    }

    /// Steering tag of the received frame
    pub fn flow_tag(&self) -> u32 {
        self.flow_tag
    }

    pub fn set_flow_tag(&mut self, tag: u32) {
        self.flow_tag = tag;
    }

    /// User context reported with zero-copy completions
    pub fn zc_context(&self) -> Option<u64> {
        self.zc_context
    }

    pub fn set_zc_context(&mut self, ctx: Option<u64>) {
        self.zc_context = ctx;
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        // SAFETY: Drop runs once and into_header forgets self, so the header
        // is still present here.
        let header = unsafe { ManuallyDrop::take(&mut self.header) };
        match header.pool.upgrade() {
            Some(pool) => pool.reclaim_dropped(header),
            None => log::trace!("buffer {}:{} outlived its pool", header.pool_id, header.slot),
        }
    }
}

impl AsRef<[u8]> for BufferDescriptor {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
