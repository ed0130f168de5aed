//! Ring orchestrator
//!
//! A [`Ring`] owns one hardware queue pair, its two completion queues and
//! the buffer pools feeding them. Two locking domains split the work:
//!
//! - the transmit domain guards send posting, transmit completions, credits
//!   and every offload context mutation
//! - the receive domain guards receive posting, reclamation and moderation
//!
//! The event completion queue has its own spin lock and each buffer pool its
//! own mutex, so buffer replenishment never blocks hardware posting.

pub mod config;
pub mod stats;

mod offload;
mod rx;
mod tx;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::SystemTime,
};

use log::{error, info, warn};

use crate::buffers::{BufferKind, BufferPool};
use crate::error::{Result, RingError};
use crate::events::EventQueue;
use crate::hw::{
    HwCapabilities, HwQueues, L2Address, L2AddressCache, LroCaps, Lkey, NetDevice,
    QueuePairDesc, QueuePairFactory,
};
use crate::moderation::{CqModeration, ModerationInfo};
use crate::sync::{CompletionChannel, PollSequence, SequenceNumber};

pub use config::{DeliveryMode, RingConfig, RingConfigBuilder};
pub use rx::{RxGuard, RxSink};
pub use stats::{AtomicRingStats, RingStats};
pub use tx::Packet;

use rx::RxDomain;
use tx::TxDomain;

/// Which completion queue an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Tx,
    Rx,
}

/// Result of arming a completion queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmResult {
    /// Notification armed; the caller may block on the channel
    Armed,
    /// Completions arrived after the caller's cursor; poll instead of waiting
    AlreadyPending,
}

/// One hardware queue pair with its completion queues and buffer pools
pub struct Ring {
    config: RingConfig,
    caps: HwCapabilities,
    device: Arc<dyn NetDevice>,
    tx: Mutex<TxDomain>,
    rx: Mutex<RxDomain>,
    tx_pool: BufferPool,
    zc_pool: BufferPool,
    rx_pool: BufferPool,
    events: EventQueue,
    tx_channel: Arc<CompletionChannel>,
    rx_channel: Arc<CompletionChannel>,
    tx_sequence: PollSequence,
    rx_sequence: PollSequence,
    up: AtomicBool,
    faulted: AtomicBool,
    mtu: AtomicU32,
    l2_address: L2AddressCache,
    stats: AtomicRingStats,
}

impl Ring {
    /// Create a ring on the queue pair built by `factory`
    ///
    /// Capabilities are queried once here. Receive buffers are posted up to
    /// the configured depth and the initial moderation is programmed.
    pub fn new(
        config: RingConfig,
        factory: &dyn QueuePairFactory,
        device: Arc<dyn NetDevice>,
    ) -> Result<Self> {
        config.validate()?;
        let id = config.ring_id;
        let caps = factory.capabilities();

        let tx_channel = Arc::new(CompletionChannel::new(format!("{}-tx", config.name))?);
        let rx_channel = Arc::new(CompletionChannel::new(format!("{}-rx", config.name))?);
        let desc = QueuePairDesc {
            ring_id: id,
            tx_depth: config.tx_depth,
            rx_depth: config.rx_depth,
            tx_channel: Arc::clone(&tx_channel),
            rx_channel: Arc::clone(&rx_channel),
        };
        let HwQueues {
            send,
            recv,
            tx_cq,
            mut rx_cq,
        } = factory.create(&desc)?;

        let tx_pool = BufferPool::new(config.tx_pool.clone(), BufferKind::Tx, id)?;
        let zc_pool = BufferPool::new(config.zc_pool.clone(), BufferKind::ZeroCopy, id)?;
        let rx_pool = BufferPool::new(config.rx_pool.clone(), BufferKind::Rx, id)?;

        let mut moderation = CqModeration::new(config.moderation.clone())?;
        if let Some((period, count)) = moderation.initial() {
            moderation.apply(rx_cq.as_mut(), period, count)?;
        }

        let up = device.is_up();
        let mtu = device.mtu();
        let l2_address = L2AddressCache::new(Some(device.l2_address()));

        let ring = Self {
            tx: Mutex::new(TxDomain::new(send, tx_cq, config.tx_depth, caps.offloads)),
            rx: Mutex::new(RxDomain::new(recv, rx_cq, moderation)),
            tx_sequence: PollSequence::new(id.wrapping_mul(2)),
            rx_sequence: PollSequence::new(id.wrapping_mul(2).wrapping_add(1)),
            config,
            caps,
            device,
            tx_pool,
            zc_pool,
            rx_pool,
            events: EventQueue::new(),
            tx_channel,
            rx_channel,
            up: AtomicBool::new(up),
            faulted: AtomicBool::new(false),
            mtu: AtomicU32::new(mtu),
            l2_address,
            stats: AtomicRingStats::default(),
        };

        {
            let mut rx = ring.lock_rx_domain();
            ring.replenish_rx_locked(&mut rx)?;
        }

        info!(
            "Ring '{}' (id {}) created: tx depth {}, rx depth {}, {}",
            ring.config.name,
            id,
            ring.config.tx_depth,
            ring.config.rx_depth,
            if up { "up" } else { "down" }
        );
        Ok(ring)
    }

    pub fn id(&self) -> u32 {
        self.config.ring_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    // ---- link state ----

    /// Whether the interface is active; posting fails with `RingDown` if not
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Whether a consistency violation disabled the ring
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Mark the ring active and refill the receive queue
    pub fn start_active(&self) -> Result<()> {
        self.check_usable()?;
        if !self.up.swap(true, Ordering::AcqRel) {
            info!("Ring '{}' is up", self.config.name);
        }
        let mut rx = self.lock_rx_domain();
        let result = self.replenish_rx_locked(&mut rx);
        self.guard(result).map(|_| ())
    }

    /// Mark the ring inactive; already posted work can still be drained
    pub fn stop_active(&self) {
        if self.up.swap(false, Ordering::AcqRel) {
            info!("Ring '{}' is down", self.config.name);
        }
    }

    /// Re-read link state, MTU and address from the device
    pub fn refresh_link_state(&self) -> bool {
        let up = self.device.is_up();
        if self.up.swap(up, Ordering::AcqRel) != up {
            info!(
                "Ring '{}' link is {}",
                self.config.name,
                if up { "up" } else { "down" }
            );
        }
        self.mtu.store(self.device.mtu(), Ordering::Release);

        let address = self.device.l2_address();
        if self.l2_address.get().as_ref() != Some(&address) {
            self.l2_address.replace(address);
        }
        up
    }

    // ---- capabilities ----

    pub fn capabilities(&self) -> &HwCapabilities {
        &self.caps
    }

    pub fn max_inline_data(&self) -> u32 {
        self.caps.max_inline_bytes
    }

    pub fn max_send_sge(&self) -> u32 {
        self.caps.max_send_sge
    }

    /// Largest payload one send may carry
    pub fn max_payload_size(&self) -> u32 {
        if self.caps.tso.supported {
            self.caps.tso.max_payload
        } else {
            self.mtu()
        }
    }

    pub fn max_header_size(&self) -> u16 {
        self.caps.tso.max_header
    }

    pub fn is_tso(&self) -> bool {
        self.caps.tso.supported
    }

    pub fn lro_caps(&self) -> LroCaps {
        self.caps.lro
    }

    pub fn is_lro(&self) -> bool {
        self.caps.lro.supported
    }

    pub fn hw_dummy_send_supported(&self) -> bool {
        self.caps.dummy_send
    }

    /// Key of the memory backing ring-owned buffers
    pub fn tx_lkey(&self) -> Lkey {
        self.caps.tx_lkey
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    // ---- device ----

    pub fn l2_address(&self) -> Option<L2Address> {
        self.l2_address.get()
    }

    /// Install a new link-layer address, disposing of the previous one
    pub fn replace_l2_address(&self, address: L2Address) {
        self.l2_address.replace(address);
    }

    pub fn convert_hw_time(&self, hw_ticks: u64) -> SystemTime {
        self.device.convert_hw_time(hw_ticks)
    }

    // ---- observation ----

    /// Channel signalled by the queue; `interrupt` cancels a blocked wait
    pub fn channel(&self, kind: QueueKind) -> &Arc<CompletionChannel> {
        match kind {
            QueueKind::Tx => &self.tx_channel,
            QueueKind::Rx => &self.rx_channel,
        }
    }

    /// Current poll sequence of a queue
    pub fn sequence(&self, kind: QueueKind) -> SequenceNumber {
        match kind {
            QueueKind::Tx => self.tx_sequence.current(),
            QueueKind::Rx => self.rx_sequence.current(),
        }
    }

    pub fn tx_pool(&self) -> &BufferPool {
        &self.tx_pool
    }

    pub fn zc_pool(&self) -> &BufferPool {
        &self.zc_pool
    }

    pub fn rx_pool(&self) -> &BufferPool {
        &self.rx_pool
    }

    pub fn moderation_info(&self) -> ModerationInfo {
        self.lock_rx_domain().moderation.info().clone()
    }

    pub fn stats(&self) -> RingStats {
        self.stats.snapshot()
    }

    // ---- teardown ----

    /// Harvest every outstanding completion without blocking
    ///
    /// Works on a ring that is down or faulted and may be called repeatedly.
    /// Received packets are handed to the event queue in batched mode and
    /// returned to the pool otherwise; nothing is reposted.
    pub fn drain_and_process(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let harvested = self.drain_tx_once()? + self.drain_rx_once()?;
            if harvested == 0 {
                return Ok(total);
            }
            total += harvested;
        }
    }

    // ---- internals ----

    fn lock_tx(&self) -> MutexGuard<'_, TxDomain> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rx_domain(&self) -> MutexGuard<'_, RxDomain> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(RingError::RingFaulted);
        }
        Ok(())
    }

    fn check_postable(&self) -> Result<()> {
        self.check_usable()?;
        if !self.is_up() {
            return Err(RingError::RingDown);
        }
        Ok(())
    }

    /// Latch the faulted state on consistency violations
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(RingError::ConsistencyViolation { message }) = &result {
            if !self.faulted.swap(true, Ordering::AcqRel) {
                error!(
                    "Ring '{}' disabled after consistency violation: {}",
                    self.config.name, message
                );
            }
        }
        result
    }

    /// Empty both event lanes, keeping the packet buffers they held
    fn take_event_buffers(&self) -> Vec<crate::buffers::BufferDescriptor> {
        let mut buffers = Vec::new();
        while let Some(record) = self.events.take_fast().or_else(|| self.events.pop()) {
            if let Some(packet) = record.packet {
                buffers.extend(packet.buffers);
            }
        }
        buffers
    }

    /// Return buffers to the pool matching their kind
    fn release_buffers(&self, buffers: Vec<crate::buffers::BufferDescriptor>) -> Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }
        let mut tx = Vec::new();
        let mut zc = Vec::new();
        let mut rx = Vec::new();
        for buffer in buffers {
            match buffer.kind() {
                BufferKind::Tx => tx.push(buffer),
                BufferKind::ZeroCopy => zc.push(buffer),
                BufferKind::Rx => rx.push(buffer),
            }
        }
        self.tx_pool.release(tx)?;
        self.zc_pool.release(zc)?;
        self.rx_pool.release(rx)?;
        Ok(())
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.config.name)
            .field("id", &self.config.ring_id)
            .field("up", &self.is_up())
            .field("faulted", &self.is_faulted())
            .finish_non_exhaustive()
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.stop_active();
        if let Err(e) = self.drain_and_process() {
            warn!("Ring '{}' drain failed during teardown: {}", self.config.name, e);
        }

        let posted = self.rx.get_mut().unwrap_or_else(|e| e.into_inner()).take_posted();
        if let Err(e) = self.rx_pool.release(posted) {
            warn!("Ring '{}' failed to release receive buffers: {}", self.config.name, e);
        }
        let undelivered = self.take_event_buffers();
        if let Err(e) = self.release_buffers(undelivered) {
            warn!("Ring '{}' failed to release undelivered packets: {}", self.config.name, e);
        }

        let tx = self.tx.get_mut().unwrap_or_else(|e| e.into_inner());
        for hw in tx.offload.drain_hw_objects() {
            if let Err(e) = tx.send.destroy_context(hw) {
                warn!("Failed to destroy offload context {}: {}", hw, e);
            }
        }
        let abandoned = tx.inflight.len();
        tx.inflight.clear();
        if abandoned > 0 {
            warn!(
                "Ring '{}' dropped {} uncompleted transmit work requests",
                self.config.name, abandoned
            );
        }

        for pool in [&self.tx_pool, &self.zc_pool, &self.rx_pool] {
            if let Err(e) = pool.return_to_global() {
                warn!("Pool '{}' could not be donated: {}", pool.config().name, e);
            }
        }
        info!("Ring '{}' destroyed", self.config.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPoolConfig;
    use crate::hw::sim::SimNic;
    use crate::hw::TxAttributes;

    fn small_config() -> RingConfig {
        RingConfigBuilder::new("unit", 3)
            .tx_depth(8)
            .rx_depth(4)
            .tx_pool(BufferPoolConfig::new("tx").with_capacity(16).with_grow_step(4))
            .rx_pool(BufferPoolConfig::new("rx").with_capacity(8).with_grow_step(4))
            .build()
            .unwrap()
    }

    #[test]
    fn test_construction_posts_receive_buffers() {
        let nic = SimNic::default();
        let ring = Ring::new(small_config(), &nic, nic.device()).unwrap();
        assert!(ring.is_up());
        assert_eq!(ring.rx_posted(), 4);
        assert_eq!(nic.posted_rx(), 4);
        assert_eq!(ring.rx_pool().borrowed(), 4);
        assert_eq!(ring.mtu(), 1500);
        assert!(ring.is_tso());
        assert_eq!(ring.max_payload_size(), 256 * 1024);
        assert_eq!(ring.tx_lkey(), 0x1000);
    }

    #[test]
    fn test_consistency_violation_faults_ring() {
        let nic = SimNic::default();
        let ring = Ring::new(small_config(), &nic, nic.device()).unwrap();
        assert!(ring.credits_return(1).unwrap_err().is_fatal());
        assert!(ring.is_faulted());
        assert!(matches!(
            ring.send(Packet::Bytes(b"x"), TxAttributes::empty(), None),
            Err(RingError::RingFaulted)
        ));
        // Draining stays available on a faulted ring
        assert!(ring.drain_and_process().is_ok());
    }

    #[test]
    fn test_link_refresh_follows_device() {
        let nic = SimNic::default();
        let device = nic.device();
        let ring = Ring::new(small_config(), &nic, device.clone()).unwrap();

        device.set_up(false);
        device.set_mtu(9000);
        device.set_l2_address(L2Address::Ethernet([2, 0, 0, 0, 0, 9]));
        assert!(!ring.refresh_link_state());
        assert!(!ring.is_up());
        assert_eq!(ring.mtu(), 9000);
        assert_eq!(ring.l2_address(), Some(L2Address::Ethernet([2, 0, 0, 0, 0, 9])));

        device.set_up(true);
        assert!(ring.refresh_link_state());
    }

    #[test]
    fn test_drop_returns_buffers_to_global_pool() {
        let nic = SimNic::default();
        let ring = Ring::new(small_config(), &nic, nic.device()).unwrap();
        ring.send(Packet::Bytes(&[7u8; 100]), TxAttributes::empty(), None)
            .unwrap();
        let rx_pool = ring.rx_pool().clone();
        drop(ring);
        assert_eq!(rx_pool.borrowed(), 0);
        assert_eq!(rx_pool.materialized(), 0);
    }
}
