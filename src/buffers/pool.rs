//! Buffer pool with lazy growth, reference counting and deferred release

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, TryLockError,
    },
    time::{Duration, Instant},
};

use log::{debug, error, trace};

use crate::error::{Result, RingError};

use super::{
    buffer::{BufferDescriptor, BufferHeader, BufferKind},
    config::BufferPoolConfig,
    global::GlobalBufferPool,
    region::{BufferRegion, RawBuffer},
    stats::{AtomicBufferPoolStats, BufferPoolStats},
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a blocked acquire sleeps before re-checking deferred returns
const DEFERRED_RECHECK: Duration = Duration::from_millis(10);

/// A bounded pool of zero-copy buffers
///
/// Cloning the handle shares the pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    id: u64,
    config: BufferPoolConfig,
    kind: BufferKind,
    owner_ring: u32,
    state: Mutex<PoolState>,
    available: Condvar,
    stats: AtomicBufferPoolStats,
    global: Arc<GlobalBufferPool>,
    /// Buffers whose last reference was dropped while the pool lock was busy
    deferred: spin::Mutex<Vec<Arc<BufferHeader>>>,
    missing_refs: AtomicUsize,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Arc<BufferHeader>>,
    borrowed: usize,
    materialized: usize,
    next_slot: usize,
}

impl BufferPool {
    /// Create a pool that grows from the process-wide global pool
    pub fn new(config: BufferPoolConfig, kind: BufferKind, owner_ring: u32) -> Result<Self> {
        Self::with_global(config, kind, owner_ring, GlobalBufferPool::shared())
    }

    /// Create a pool backed by a specific global pool
    pub fn with_global(
        config: BufferPoolConfig,
        kind: BufferKind,
        owner_ring: u32,
        global: Arc<GlobalBufferPool>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            kind,
            owner_ring,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            stats: AtomicBufferPoolStats::new(),
            global,
            deferred: spin::Mutex::new(Vec::new()),
            missing_refs: AtomicUsize::new(0),
        });

        if shared.config.prefill {
            let mut state = shared.lock_state();
            let capacity = shared.config.capacity;
            shared.grow(&mut state, capacity)?;
        }

        debug!(
            "Created {:?} buffer pool '{}' (id {}, capacity {}, buffer size {})",
            kind, shared.config.name, shared.id, shared.config.capacity, shared.config.buffer_size
        );

        Ok(Self { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> BufferKind {
        self.shared.kind
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.shared.config
    }

    /// Maximum number of buffers the pool may materialize
    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Acquire `count` buffers
    ///
    /// Without `blocking` the call fails with `ResourceExhausted` when the
    /// pool cannot satisfy the whole request, leaving the pool untouched.
    /// With `blocking` it waits up to the configured acquire timeout.
    pub fn acquire(&self, count: usize, blocking: bool) -> Result<Vec<BufferDescriptor>> {
        let timeout = if blocking {
            Some(self.shared.config.acquire_timeout)
        } else {
            None
        };
        self.shared.acquire(count, timeout)
    }

    /// Acquire `count` buffers, waiting at most `timeout`
    pub fn acquire_timeout(&self, count: usize, timeout: Duration) -> Result<Vec<BufferDescriptor>> {
        self.shared.acquire(count, Some(Some(timeout)))
    }

    /// Acquire as many buffers as are available, at most `max`, without waiting
    pub fn acquire_up_to(&self, max: usize) -> Result<Vec<BufferDescriptor>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.shared.lock_state();
        self.shared.settle_deferred(&mut state)?;

        let growable = self.shared.config.capacity - state.materialized;
        let count = max.min(state.free.len() + growable);
        if count == 0 {
            return Ok(Vec::new());
        }
        if state.free.len() < count {
            let needed = count - state.free.len();
            self.shared.grow(&mut state, needed)?;
        }
        self.shared.hand_out(&mut state, count)
    }

    /// Release one reference per descriptor
    ///
    /// Returns the number of buffers that went back to the free list.
    ///
    /// Every descriptor is checked against this pool before any reference is
    /// dropped. On a mismatch the whole list is rejected and each token falls
    /// back to its own pool through the drop path.
    pub fn release(&self, buffers: Vec<BufferDescriptor>) -> Result<usize> {
        self.shared.check_owners(&buffers)?;
        let (headers, failure) = PoolShared::drop_tokens(buffers);
        let mut state = self.shared.lock_state();
        self.shared.settle_deferred(&mut state)?;
        let returned = self.shared.return_free(&mut state, headers)?;
        failure.map_or(Ok(returned), Err)
    }

    /// Release a descriptor carrying `refs` references
    pub fn release_multi_ref(&self, buffer: BufferDescriptor, refs: u32) -> Result<bool> {
        if refs == 0 {
            return Err(RingError::invalid_parameter(
                "refs",
                "At least one reference must be released",
            ));
        }
        let header = buffer.into_header();
        self.shared.check_owner(&header)?;
        if !header.drop_refs(refs)? {
            return Ok(false);
        }
        let mut state = self.shared.lock_state();
        self.shared.settle_deferred(&mut state)?;
        self.shared.return_free(&mut state, vec![header])?;
        Ok(true)
    }

    /// Release without waiting for the pool lock
    ///
    /// References are always dropped. Buffers that reach zero while the lock
    /// is contended are parked and settled by the next locked operation.
    pub fn try_release(&self, buffers: Vec<BufferDescriptor>) -> Result<usize> {
        self.shared.check_owners(&buffers)?;
        let (headers, failure) = PoolShared::drop_tokens(buffers);
        let returned = self.shared.try_return(headers)?;
        failure.map_or(Ok(returned), Err)
    }

    /// Donate every free buffer to the global pool
    pub fn return_to_global(&self) -> Result<usize> {
        let mut state = self.shared.lock_state();
        self.shared.settle_deferred(&mut state)?;

        let raw: Vec<RawBuffer> = state.free.drain(..).map(|h| h.raw.clone()).collect();
        let donated = raw.len();
        state.materialized -= donated;
        self.shared.global.donate(raw);
        self.shared
            .stats
            .record_donation(donated, state.materialized);

        if donated > 0 {
            debug!(
                "Pool '{}' donated {} buffers to the global pool",
                self.shared.config.name, donated
            );
        }
        Ok(donated)
    }

    /// Buffers currently on the free list
    pub fn free_count(&self) -> usize {
        self.shared.lock_state().free.len()
    }

    /// Buffers currently handed out
    pub fn borrowed(&self) -> usize {
        self.shared.lock_state().borrowed
    }

    /// Buffers currently backed by memory
    pub fn materialized(&self) -> usize {
        self.shared.lock_state().materialized
    }

    /// Buffers whose return is parked on the deferred list
    pub fn missing_refs(&self) -> usize {
        self.shared.missing_refs.load(Ordering::Acquire)
    }

    /// Settle deferred returns now
    pub fn flush_deferred(&self) -> Result<usize> {
        let mut state = self.shared.lock_state();
        self.shared.settle_deferred(&mut state)
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.shared.stats.snapshot()
    }
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `timeout`: None = non-blocking, Some(None) = wait forever
    fn acquire(
        self: &Arc<Self>,
        count: usize,
        timeout: Option<Option<Duration>>,
    ) -> Result<Vec<BufferDescriptor>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.config.capacity {
            self.stats.record_failure();
            return Err(RingError::exhausted(count, self.config.capacity));
        }

        let deadline = timeout.flatten().map(|t| Instant::now() + t);
        let mut state = self.lock_state();
        self.settle_deferred(&mut state)?;

        loop {
            let growable = self.config.capacity - state.materialized;
            if state.free.len() + growable >= count {
                if state.free.len() < count {
                    let needed = count - state.free.len();
                    self.grow(&mut state, needed)?;
                }
                return self.hand_out(&mut state, count);
            }

            if timeout.is_none() {
                self.stats.record_failure();
                return Err(RingError::exhausted(count, state.free.len() + growable));
            }

            // Bounded slices: a deferred return parked just before this
            // thread started waiting would otherwise go unnoticed
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.stats.record_failure();
                        return Err(RingError::exhausted(count, state.free.len() + growable));
                    }
                    (deadline - now).min(DEFERRED_RECHECK)
                }
                None => DEFERRED_RECHECK,
            };
            state = self
                .available
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            self.settle_deferred(&mut state)?;
        }
    }

    fn hand_out(&self, state: &mut PoolState, count: usize) -> Result<Vec<BufferDescriptor>> {
        let split = state.free.len() - count;
        let headers = state.free.split_off(split);
        let mut buffers = Vec::with_capacity(count);
        for header in headers {
            if header.refs.swap(1, Ordering::AcqRel) != 0 {
                return Err(self.violation(format!(
                    "free buffer {}:{} still referenced",
                    header.pool_id, header.slot
                )));
            }
            buffers.push(BufferDescriptor::new(header));
        }

        state.borrowed += count;
        if state.borrowed > self.config.capacity || state.materialized > self.config.capacity {
            return Err(self.violation(format!(
                "pool '{}' borrowed {} of {} materialized, capacity {}",
                self.config.name, state.borrowed, state.materialized, self.config.capacity
            )));
        }

        self.stats.record_acquire(count, state.borrowed);
        trace!("Pool '{}' handed out {} buffers", self.config.name, count);
        Ok(buffers)
    }

    fn grow(self: &Arc<Self>, state: &mut PoolState, needed: usize) -> Result<()> {
        let room = self.config.capacity - state.materialized;
        let count = needed.max(self.config.grow_step).min(room);
        if count == 0 {
            return Ok(());
        }

        let shape = (self.config.buffer_size, self.config.stride());
        let mut raw = self.global.take(shape, count);
        let from_global = raw.len();
        if raw.len() < count {
            let region = BufferRegion::new(shape.0, shape.1, count - raw.len())?;
            raw.extend(region.buffers());
        }

        for buffer in raw {
            let slot = state.next_slot;
            state.next_slot += 1;
            state.free.push(Arc::new(BufferHeader {
                raw: buffer,
                pool_id: self.id,
                slot,
                kind: self.kind,
                owner_ring: self.owner_ring,
                refs: Default::default(),
                pool: Arc::downgrade(self),
            }));
        }
        state.materialized += count;
        self.stats.record_growth(state.materialized);

        debug!(
            "Pool '{}' grew by {} buffers ({} from global), {} of {} materialized",
            self.config.name, count, from_global, state.materialized, self.config.capacity
        );
        Ok(())
    }

    fn check_owners(&self, buffers: &[BufferDescriptor]) -> Result<()> {
        buffers
            .iter()
            .try_for_each(|buffer| self.check_owner(buffer.header()))
    }

    /// Drop one reference per token
    ///
    /// Buffers whose last reference went away are returned even when a later
    /// token reports a reference count violation.
    fn drop_tokens(buffers: Vec<BufferDescriptor>) -> (Vec<Arc<BufferHeader>>, Option<RingError>) {
        let mut headers = Vec::with_capacity(buffers.len());
        let mut failure = None;
        for buffer in buffers {
            let header = buffer.into_header();
            match header.drop_refs(1) {
                Ok(true) => headers.push(header),
                Ok(false) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        (headers, failure)
    }

    fn check_owner(&self, header: &BufferHeader) -> Result<()> {
        if header.pool_id != self.id {
            return Err(self.violation(format!(
                "buffer {}:{} released to pool {}",
                header.pool_id, header.slot, self.id
            )));
        }
        Ok(())
    }

    fn return_free(&self, state: &mut PoolState, headers: Vec<Arc<BufferHeader>>) -> Result<usize> {
        let returned = headers.len();
        if returned == 0 {
            return Ok(0);
        }
        if returned > state.borrowed {
            return Err(self.violation(format!(
                "pool '{}' returned {} buffers with only {} borrowed",
                self.config.name, returned, state.borrowed
            )));
        }
        state.borrowed -= returned;
        state.free.extend(headers);
        self.stats.record_release(returned, state.borrowed);
        self.available.notify_all();
        Ok(returned)
    }

    fn try_return(&self, headers: Vec<Arc<BufferHeader>>) -> Result<usize> {
        if headers.is_empty() {
            return Ok(0);
        }
        match self.state.try_lock() {
            Ok(mut state) => {
                self.settle_deferred(&mut state)?;
                self.return_free(&mut state, headers)
            }
            Err(TryLockError::Poisoned(e)) => {
                let mut state = e.into_inner();
                self.settle_deferred(&mut state)?;
                self.return_free(&mut state, headers)
            }
            Err(TryLockError::WouldBlock) => {
                let count = headers.len();
                self.deferred.lock().extend(headers);
                self.missing_refs.fetch_add(count, Ordering::AcqRel);
                self.stats.record_deferred(count);
                // Waiters settle the parked buffers once they hold the lock
                self.available.notify_all();
                Ok(0)
            }
        }
    }

    fn settle_deferred(&self, state: &mut PoolState) -> Result<usize> {
        if self.missing_refs.load(Ordering::Acquire) == 0 {
            return Ok(0);
        }
        let parked: Vec<_> = std::mem::take(&mut *self.deferred.lock());
        self.missing_refs.fetch_sub(parked.len(), Ordering::AcqRel);
        self.return_free(state, parked)
    }

    /// Reclaim a token that was dropped instead of released
    pub(crate) fn reclaim_dropped(&self, header: Arc<BufferHeader>) {
        trace!(
            "Buffer {}:{} dropped without release",
            header.pool_id,
            header.slot
        );
        let result = match header.drop_refs(1) {
            Ok(true) => self.try_return(vec![header]),
            Ok(false) => Ok(0),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to reclaim dropped buffer: {}", e);
        }
    }

    fn violation(&self, message: String) -> RingError {
        error!("Buffer pool consistency violation: {}", message);
        RingError::consistency(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::config::BufferPoolConfigBuilder;
    use std::thread;

    fn pool(capacity: usize, step: usize) -> BufferPool {
        let config = BufferPoolConfigBuilder::new("test")
            .buffer_size(256)
            .capacity(capacity)
            .grow_step(step)
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        BufferPool::with_global(config, BufferKind::Tx, 1, Arc::new(GlobalBufferPool::new())).unwrap()
    }

    #[test]
    fn test_deferred_return_wakes_blocked_acquire() {
        let config = BufferPoolConfigBuilder::new("deferred")
            .buffer_size(128)
            .capacity(1)
            .grow_step(1)
            .no_timeout()
            .build()
            .unwrap();
        let pool =
            BufferPool::with_global(config, BufferKind::Tx, 1, Arc::new(GlobalBufferPool::new()))
                .unwrap();
        let held = pool.acquire(1, false).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let acquired = pool.acquire(1, true).map(|buffers| buffers.len());
                done_tx.send(acquired.is_ok()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(30));

        {
            // Contended lock: the return is parked instead of applied
            let _state = pool.shared.lock_state();
            assert_eq!(pool.try_release(held).unwrap(), 0);
            assert_eq!(pool.missing_refs(), 1);
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
        assert_eq!(pool.flush_deferred().unwrap(), 0);
        assert_eq!(pool.missing_refs(), 0);
        assert_eq!(pool.borrowed(), 0);
    }

    #[test]
    fn test_lazy_growth() {
        let pool = pool(64, 16);
        assert_eq!(pool.materialized(), 0);

        let buffers = pool.acquire(3, false).unwrap();
        assert_eq!(pool.materialized(), 16);
        assert_eq!(pool.borrowed(), 3);
        assert_eq!(pool.free_count(), 13);

        assert_eq!(pool.release(buffers).unwrap(), 3);
        assert_eq!(pool.borrowed(), 0);
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn test_non_blocking_exhaustion_leaves_pool_unchanged() {
        let pool = pool(8, 8);
        let held = pool.acquire(3, false).unwrap();
        let free_before = pool.free_count();

        let err = pool.acquire(6, false).unwrap_err();
        assert!(matches!(
            err,
            RingError::ResourceExhausted { requested: 6, available: 5 }
        ));
        assert_eq!(pool.free_count(), free_before);
        assert_eq!(pool.borrowed(), 3);
        assert_eq!(pool.stats().failures, 1);

        pool.release(held).unwrap();
    }

    #[test]
    fn test_shared_buffer_returns_on_last_reference() {
        let pool = pool(4, 4);
        let mut buffers = pool.acquire(1, false).unwrap();
        let first = buffers.pop().unwrap();
        let second = first.share();
        assert_eq!(first.ref_count(), 2);

        assert_eq!(pool.release(vec![first]).unwrap(), 0);
        assert_eq!(pool.borrowed(), 1);
        assert_eq!(pool.release(vec![second]).unwrap(), 1);
        assert_eq!(pool.borrowed(), 0);
    }

    #[test]
    fn test_release_multi_ref() {
        let pool = pool(4, 4);
        let buffer = pool.acquire(1, false).unwrap().pop().unwrap();
        buffer.add_ref();
        buffer.add_ref();
        assert_eq!(buffer.ref_count(), 3);
        assert!(pool.release_multi_ref(buffer, 3).unwrap());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_over_release_is_consistency_violation() {
        let pool = pool(4, 4);
        let buffer = pool.acquire(1, false).unwrap().pop().unwrap();
        let err = pool.release_multi_ref(buffer, 2).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_foreign_release_is_consistency_violation() {
        let a = pool(4, 4);
        let b = pool(4, 4);
        let buffers = a.acquire(1, false).unwrap();
        let err = b.release(buffers).unwrap_err();
        assert!(matches!(err, RingError::ConsistencyViolation { .. }));
    }

    #[test]
    fn test_dropped_descriptor_is_reclaimed() {
        let pool = pool(4, 4);
        let buffers = pool.acquire(2, false).unwrap();
        drop(buffers);
        assert_eq!(pool.borrowed(), 0);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_try_release_defers_when_locked() {
        let pool = pool(4, 4);
        let buffers = pool.acquire(2, false).unwrap();
        {
            let _guard = pool.shared.lock_state();
            assert_eq!(pool.try_release(buffers).unwrap(), 0);
        }
        assert_eq!(pool.missing_refs(), 2);
        assert_eq!(pool.stats().deferred, 2);
        assert_eq!(pool.flush_deferred().unwrap(), 2);
        assert_eq!(pool.missing_refs(), 0);
        assert_eq!(pool.borrowed(), 0);
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let pool = pool(2, 2);
        let held = pool.acquire(2, false).unwrap();

        let releaser = pool.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            releaser.release(held).unwrap();
        });

        let buffers = pool.acquire_timeout(2, Duration::from_secs(5)).unwrap();
        assert_eq!(buffers.len(), 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let pool = pool(2, 2);
        let _held = pool.acquire(2, false).unwrap();
        let err = pool.acquire(1, true).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_return_to_global_and_regrow() {
        let global = Arc::new(GlobalBufferPool::new());
        let config = BufferPoolConfig::new("rx").with_buffer_size(512).with_capacity(8).with_grow_step(8);
        let first = BufferPool::with_global(config.clone(), BufferKind::Rx, 1, global.clone()).unwrap();
        drop(first.acquire(1, false).unwrap());
        assert_eq!(first.return_to_global().unwrap(), 8);
        assert_eq!(first.materialized(), 0);
        assert_eq!(global.available((512, config.stride())), 8);

        let second = BufferPool::with_global(config, BufferKind::Rx, 2, global.clone()).unwrap();
        let buffers = second.acquire(4, false).unwrap();
        assert_eq!(buffers[0].owner_ring(), 2);
        assert_eq!(global.available((512, 512)), 0);
        assert_eq!(second.stats().growths, 1);
    }

    #[test]
    fn test_fill_requires_unique_reference() {
        let pool = pool(2, 2);
        let mut buffer = pool.acquire(1, false).unwrap().pop().unwrap();
        buffer.fill(b"hello").unwrap();
        assert_eq!(buffer.as_slice(), b"hello");

        let shared = buffer.share();
        assert!(buffer.fill(b"again").is_err());
        assert!(buffer.payload_mut().is_none());
        assert_eq!(shared.as_slice(), b"hello");
        pool.release(vec![buffer, shared]).unwrap();
    }
}
