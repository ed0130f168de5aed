//! Transmit domain: send posting, credits and transmit completion harvesting

use std::{
    collections::HashMap,
    sync::MutexGuard,
    time::Instant,
};

use log::{trace, warn};

use crate::buffers::{BufferDescriptor, BufferKind, BufferPool};
use crate::error::{Result, RingError};
use crate::hw::{
    CompletionQueue, CompletionStatus, HwError, Lkey, OffloadCaps, OffloadWork, RateLimit,
    SendQueue, SendRequest, TxAttributes, WrId,
};
use crate::offload::{
    ContextId, OffloadContext, OffloadEvent, OffloadManager, RxCallback, TlsProgressParams,
};
use crate::sync::{SequenceNumber, WaitOutcome};

use super::{AtomicRingStats, Ring};

/// Outbound packet handed to [`Ring::send`]
#[derive(Debug)]
pub enum Packet<'a> {
    /// Payload copied into ring buffers, or inlined with `INLINE`
    Bytes(&'a [u8]),
    /// Buffers already filled by the caller; ownership moves to the ring
    Buffers(Vec<BufferDescriptor>),
}

/// What completed offload work means to its context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum OffloadOp {
    RxSetup,
    RxResync,
    ProgressQuery,
    Other,
}

/// Work the hardware still references, keyed by work request id
#[derive(Debug)]
pub(super) enum TxWork {
    Packet {
        buffers: Vec<BufferDescriptor>,
        context: Option<ContextId>,
    },
    Offload {
        context: Option<ContextId>,
        buffer: Option<BufferDescriptor>,
        op: OffloadOp,
    },
}

pub(super) type PendingCallback = (RxCallback, OffloadContext, OffloadEvent);

pub(super) struct TxDomain {
    pub(super) send: Box<dyn SendQueue>,
    pub(super) cq: Box<dyn CompletionQueue>,
    pub(super) inflight: HashMap<WrId, TxWork>,
    next_wr_id: WrId,
    credits: u32,
    max_credits: u32,
    pub(super) offload: OffloadManager,
    user_lkeys: HashMap<(u64, usize), Lkey>,
    pub(super) armed_sn: Option<SequenceNumber>,
    zc_completed: Vec<u64>,
    /// Offload callbacks to run once the transmit lock is dropped
    pub(super) callbacks: Vec<PendingCallback>,
}

impl TxDomain {
    pub(super) fn new(
        send: Box<dyn SendQueue>,
        cq: Box<dyn CompletionQueue>,
        depth: u32,
        offloads: OffloadCaps,
    ) -> Self {
        Self {
            send,
            cq,
            inflight: HashMap::new(),
            next_wr_id: 1,
            credits: depth,
            max_credits: depth,
            offload: OffloadManager::new(offloads),
            user_lkeys: HashMap::new(),
            armed_sn: None,
            zc_completed: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub(super) fn next_wr_id(&mut self) -> WrId {
        let id = self.next_wr_id;
        self.next_wr_id = self.next_wr_id.wrapping_add(1);
        id
    }

    pub(super) fn credits(&self) -> u32 {
        self.credits
    }

    pub(super) fn take_credit(&mut self) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        true
    }

    pub(super) fn return_credits(&mut self, count: u32) -> Result<()> {
        let credits = self.credits + count;
        if credits > self.max_credits {
            return Err(RingError::consistency(format!(
                "transmit credits {} exceed queue depth {}",
                credits, self.max_credits
            )));
        }
        self.credits = credits;
        Ok(())
    }
}

impl Ring {
    /// Post a packet on the send queue
    ///
    /// Completion is asynchronous: buffers return to their pool when the
    /// matching transmit completion is harvested. Without `BLOCKING` the call
    /// fails with `ResourceExhausted` when buffers are short and with a
    /// transient `HardwareRejected` when the queue is out of credits.
    pub fn send(
        &self,
        packet: Packet<'_>,
        attrs: TxAttributes,
        context: Option<OffloadContext>,
    ) -> Result<()> {
        self.check_postable()?;

        if attrs.contains(TxAttributes::DUMMY) && !self.caps.dummy_send {
            return Err(RingError::Unsupported {
                feature: "dummy send",
            });
        }
        if attrs.contains(TxAttributes::TSO) && !self.caps.tso.supported {
            return Err(RingError::Unsupported { feature: "tso" });
        }
        if let Some(ctx) = context {
            if !ctx.role().is_tx() {
                return Err(RingError::invalid_parameter(
                    "context",
                    format!("context {} is not a transmit context", ctx.id()),
                ));
            }
        }

        let blocking = attrs.contains(TxAttributes::BLOCKING);
        let (buffers, inline_data, bytes) = match packet {
            Packet::Bytes(data) => self.stage_bytes(data, attrs, blocking)?,
            Packet::Buffers(buffers) => self.stage_buffers(buffers)?,
        };

        let deadline = Instant::now() + crate::config::DEFAULT_BLOCKING_WAIT;
        let mut tx = self.lock_tx();
        loop {
            if tx.take_credit() {
                break;
            }
            // Out of credits: harvest once before giving up
            let polled = self.process_tx_locked(&mut tx);
            if let Err(e) = self.guard(polled) {
                drop(tx);
                self.discard(buffers);
                return Err(e);
            }
            if tx.take_credit() {
                break;
            }
            if !blocking || Instant::now() >= deadline {
                AtomicRingStats::add(&self.stats.tx_backpressure, 1);
                self.finish_tx(tx);
                self.discard(buffers);
                return Err(RingError::backpressure("no transmit credits"));
            }
            if let Err(e) = tx.cq.arm_notification() {
                self.finish_tx(tx);
                self.discard(buffers);
                return Err(e.into());
            }
            self.finish_tx(tx);
            if let Err(e) = self.wait_tx_slice() {
                self.discard(buffers);
                return Err(e);
            }
            tx = self.lock_tx();
        }

        let hw_context = match context {
            Some(ctx) => match tx.offload.lookup(ctx) {
                Ok(hw) => Some(hw),
                Err(e) => {
                    let returned = tx.return_credits(1);
                    self.finish_tx(tx);
                    self.discard(buffers);
                    self.guard(returned)?;
                    return Err(e);
                }
            },
            None => None,
        };

        let wr_id = tx.next_wr_id();
        let request = SendRequest {
            wr_id,
            sges: buffers.iter().map(|b| b.sge(self.caps.tx_lkey)).collect(),
            inline_data,
            attrs,
            context: hw_context,
            mss: if attrs.contains(TxAttributes::TSO) {
                self.mtu().saturating_sub(40).min(u32::from(u16::MAX)) as u16
            } else {
                0
            },
        };

        match tx.send.post_send(request) {
            Ok(()) => {
                let context = context.map(|ctx| ctx.id());
                if let Some(id) = context {
                    tx.offload.begin_post(id);
                }
                tx.inflight.insert(wr_id, TxWork::Packet { buffers, context });
                self.stats.record_send(bytes);
                trace!("Ring {} posted send {} ({} bytes)", self.id(), wr_id, bytes);
                self.finish_tx(tx);
                Ok(())
            }
            Err(hw) => {
                let returned = tx.return_credits(1);
                self.finish_tx(tx);
                self.discard(buffers);
                self.guard(returned)?;
                Err(self.post_failure(hw))
            }
        }
    }

    /// Acquire transmit buffers for the caller to fill
    ///
    /// A blocking acquisition harvests transmit completions while it waits,
    /// since those are what return buffers to the pool.
    pub fn acquire_tx_buffers(&self, count: usize, blocking: bool) -> Result<Vec<BufferDescriptor>> {
        self.check_usable()?;
        self.acquire_from(&self.tx_pool, count, blocking)
    }

    /// Acquire zero-copy buffers for the caller to fill
    pub fn acquire_zc_buffers(&self, count: usize, blocking: bool) -> Result<Vec<BufferDescriptor>> {
        self.check_usable()?;
        self.acquire_from(&self.zc_pool, count, blocking)
    }

    /// Harvest transmit completions and release their buffers
    pub fn poll_and_process_tx(&self, cursor: &mut SequenceNumber) -> Result<usize> {
        self.check_usable()?;
        let mut tx = self.lock_tx();
        let result = self.process_tx_locked(&mut tx);
        self.finish_tx(tx);
        let count = self.guard(result)?;
        self.tx_sequence.publish(cursor);
        Ok(count)
    }

    /// Reserve `count` work request credits; false when not enough are left
    pub fn credits_get(&self, count: u32) -> bool {
        let mut tx = self.lock_tx();
        if tx.credits() < count {
            return false;
        }
        for _ in 0..count {
            tx.take_credit();
        }
        true
    }

    /// Give back credits reserved with [`credits_get`](Self::credits_get)
    pub fn credits_return(&self, count: u32) -> Result<()> {
        let result = self.lock_tx().return_credits(count);
        self.guard(result)
    }

    /// Credits currently available
    pub fn credits(&self) -> u32 {
        self.lock_tx().credits()
    }

    /// Transmit work requests posted and not yet completed
    pub fn tx_in_flight(&self) -> usize {
        self.lock_tx().inflight.len()
    }

    /// Post a fence that orders later work after everything already posted
    pub fn post_nop_fence(&self) -> Result<()> {
        self.check_postable()?;
        let mut tx = self.lock_tx();
        let result = self.post_work_locked(&mut tx, OffloadWork::NopFence, None, None, OffloadOp::Other);
        self.finish_tx(tx);
        self.guard(result).map(|_| ())
    }

    /// Program packet pacing on the send queue
    pub fn modify_rate_limit(&self, limit: RateLimit) -> Result<()> {
        if !self.caps.rate_limit {
            return Err(RingError::Unsupported {
                feature: "rate limit",
            });
        }
        self.check_postable()?;
        let mut tx = self.lock_tx();
        tx.send.modify_rate_limit(limit)?;
        Ok(())
    }

    /// Key for user memory sent zero-copy; registrations are cached
    pub fn tx_user_lkey(&self, addr: u64, len: usize) -> Result<Lkey> {
        self.check_usable()?;
        let mut tx = self.lock_tx();
        if let Some(lkey) = tx.user_lkeys.get(&(addr, len)) {
            return Ok(*lkey);
        }
        let lkey = tx.send.register_memory(addr, len)?;
        tx.user_lkeys.insert((addr, len), lkey);
        Ok(lkey)
    }

    /// Detach a zero-copy user context from buffers still in flight
    ///
    /// Their completions will no longer be reported for `zc_context`.
    pub fn reset_inflight_zc_context(&self, zc_context: u64) -> usize {
        let mut tx = self.lock_tx();
        let mut reset = 0;
        for work in tx.inflight.values_mut() {
            if let TxWork::Packet { buffers, .. } = work {
                for buffer in buffers.iter_mut() {
                    if buffer.zc_context() == Some(zc_context) {
                        buffer.set_zc_context(None);
                        reset += 1;
                    }
                }
            }
        }
        reset
    }

    /// Zero-copy user contexts whose buffers completed since the last call
    pub fn take_zc_completions(&self) -> Vec<u64> {
        std::mem::take(&mut self.lock_tx().zc_completed)
    }

    // ---- internals ----

    fn stage_bytes(
        &self,
        data: &[u8],
        attrs: TxAttributes,
        blocking: bool,
    ) -> Result<(Vec<BufferDescriptor>, Option<Vec<u8>>, usize)> {
        if data.is_empty() && !attrs.contains(TxAttributes::DUMMY) {
            return Err(RingError::invalid_parameter("packet", "Empty payload"));
        }
        if attrs.contains(TxAttributes::INLINE) && data.len() <= self.caps.max_inline_bytes as usize {
            return Ok((Vec::new(), Some(data.to_vec()), data.len()));
        }

        let buffer_size = self.tx_pool.config().buffer_size;
        let needed = data.len().div_ceil(buffer_size).max(1);
        if needed > self.caps.max_send_sge as usize {
            return Err(RingError::invalid_parameter(
                "packet",
                format!(
                    "{} bytes need {} buffers, the send queue takes {}",
                    data.len(),
                    needed,
                    self.caps.max_send_sge
                ),
            ));
        }

        let mut buffers = self.acquire_from(&self.tx_pool, needed, blocking)?;
        for (buffer, chunk) in buffers.iter_mut().zip(data.chunks(buffer_size)) {
            buffer.fill(chunk)?;
        }
        Ok((buffers, None, data.len()))
    }

    fn stage_buffers(
        &self,
        buffers: Vec<BufferDescriptor>,
    ) -> Result<(Vec<BufferDescriptor>, Option<Vec<u8>>, usize)> {
        if buffers.is_empty() {
            return Err(RingError::invalid_parameter("packet", "No buffers to send"));
        }
        if buffers.len() > self.caps.max_send_sge as usize {
            let count = buffers.len();
            self.discard(buffers);
            return Err(RingError::invalid_parameter(
                "packet",
                format!("{} buffers exceed {} scatter/gather entries", count, self.caps.max_send_sge),
            ));
        }
        if let Some(foreign) = buffers
            .iter()
            .find(|b| b.owner_ring() != self.id() || b.kind() == BufferKind::Rx)
        {
            let message = format!(
                "buffer {:?} of ring {} cannot be sent on ring {}",
                foreign.id(),
                foreign.owner_ring(),
                self.id()
            );
            // Foreign buffers go back through their own pool on drop
            drop(buffers);
            return Err(RingError::invalid_parameter("packet", message));
        }
        let bytes = buffers.iter().map(|b| b.len()).sum();
        Ok((buffers, None, bytes))
    }

    pub(super) fn acquire_from(
        &self,
        pool: &BufferPool,
        count: usize,
        blocking: bool,
    ) -> Result<Vec<BufferDescriptor>> {
        if !blocking {
            return pool.acquire(count, false);
        }

        let deadline = pool
            .config()
            .acquire_timeout
            .map(|timeout| Instant::now() + timeout);
        loop {
            match pool.acquire(count, false) {
                Err(RingError::ResourceExhausted { .. }) => {}
                other => return other,
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return pool.acquire(count, false);
            }
            if self.drain_tx_once()? == 0 {
                match pool.acquire_timeout(count, crate::config::BLOCKING_POLL_SLICE) {
                    Err(RingError::ResourceExhausted { .. }) => {}
                    other => return other,
                }
            }
        }
    }

    /// Post configuration work on the send queue; caller holds the lock
    pub(super) fn post_work_locked(
        &self,
        tx: &mut TxDomain,
        work: OffloadWork,
        context: Option<ContextId>,
        buffer: Option<BufferDescriptor>,
        op: OffloadOp,
    ) -> Result<WrId> {
        if !tx.take_credit() {
            self.process_tx_locked(tx)?;
            if !tx.take_credit() {
                if let Some(buffer) = buffer {
                    self.release_buffers(vec![buffer])?;
                }
                AtomicRingStats::add(&self.stats.tx_backpressure, 1);
                return Err(RingError::backpressure("no transmit credits for offload work"));
            }
        }

        let wr_id = tx.next_wr_id();
        match tx.send.post_offload(wr_id, work) {
            Ok(()) => {
                if let Some(id) = context {
                    tx.offload.begin_post(id);
                }
                tx.inflight.insert(wr_id, TxWork::Offload { context, buffer, op });
                Ok(wr_id)
            }
            Err(hw) => {
                tx.return_credits(1)?;
                if let Some(buffer) = buffer {
                    self.release_buffers(vec![buffer])?;
                }
                Err(self.post_failure(hw))
            }
        }
    }

    /// Harvest one budget of transmit completions; caller holds the lock
    pub(super) fn process_tx_locked(&self, tx: &mut TxDomain) -> Result<usize> {
        let completions = tx.cq.poll(self.config.poll_budget);
        if completions.is_empty() {
            return Ok(0);
        }

        let mut released = Vec::new();
        let mut result = Ok(());
        for completion in &completions {
            let Some(work) = tx.inflight.remove(&completion.wr_id) else {
                result = Err(RingError::consistency(format!(
                    "transmit completion for unknown work request {}",
                    completion.wr_id
                )));
                break;
            };
            if let Err(e) = tx.return_credits(1) {
                result = Err(e);
                break;
            }
            AtomicRingStats::add(&self.stats.tx_completions, 1);
            if let CompletionStatus::Error(syndrome) = completion.status {
                AtomicRingStats::add(&self.stats.tx_errors, 1);
                warn!(
                    "Ring {} transmit work {} failed with syndrome {:#x}",
                    self.id(),
                    completion.wr_id,
                    syndrome
                );
            }

            match work {
                TxWork::Packet { buffers, context } => {
                    if let Some(id) = context {
                        if let Err(e) = tx.offload.end_post(id) {
                            released.extend(buffers);
                            result = Err(e);
                            break;
                        }
                    }
                    for buffer in &buffers {
                        if let Some(zc) = buffer.zc_context() {
                            tx.zc_completed.push(zc);
                            AtomicRingStats::add(&self.stats.zc_completions, 1);
                        }
                    }
                    released.extend(buffers);
                }
                TxWork::Offload { context, buffer, op } => {
                    AtomicRingStats::add(&self.stats.offload_completions, 1);
                    if let Some(id) = context {
                        if let Err(e) = tx.offload.end_post(id) {
                            released.extend(buffer);
                            result = Err(e);
                            break;
                        }
                        let event = match (completion.status, op) {
                            (_, OffloadOp::Other) => None,
                            (CompletionStatus::Error(syndrome), _) => {
                                Some(OffloadEvent::Failed(syndrome))
                            }
                            (CompletionStatus::Flushed, _) => None,
                            (CompletionStatus::Success, OffloadOp::RxSetup) => {
                                Some(OffloadEvent::SetupComplete)
                            }
                            (CompletionStatus::Success, OffloadOp::RxResync) => {
                                Some(OffloadEvent::ResyncComplete)
                            }
                            (CompletionStatus::Success, OffloadOp::ProgressQuery) => buffer
                                .as_ref()
                                .and_then(|b| TlsProgressParams::parse(b.as_slice()))
                                .map(OffloadEvent::ProgressParams),
                        };
                        if let (Some(event), Some(callback), Some(role)) =
                            (event, tx.offload.callback(id), tx.offload.role_of(id))
                        {
                            tx.callbacks
                                .push((callback, OffloadContext::new(id, role), event));
                        }
                    }
                    released.extend(buffer);
                }
            }
        }

        self.tx_sequence.advance();
        self.release_buffers(released)?;
        result.map(|()| completions.len())
    }

    /// Harvest without the usability check; used by teardown and blocking paths
    pub(super) fn drain_tx_once(&self) -> Result<usize> {
        let mut tx = self.lock_tx();
        let result = self.process_tx_locked(&mut tx);
        self.finish_tx(tx);
        self.guard(result)
    }

    /// Drop the transmit lock and run offload callbacks collected under it
    pub(super) fn finish_tx(&self, mut tx: MutexGuard<'_, TxDomain>) {
        let callbacks = std::mem::take(&mut tx.callbacks);
        drop(tx);
        for (callback, ctx, event) in callbacks {
            callback(ctx, event);
        }
    }

    /// Return staged buffers after a failed send
    fn discard(&self, buffers: Vec<BufferDescriptor>) {
        if let Err(e) = self.guard(self.release_buffers(buffers)) {
            warn!("Ring {} failed to return unsent buffers: {}", self.id(), e);
        }
    }

    fn wait_tx_slice(&self) -> Result<()> {
        match self.tx_channel.wait(Some(crate::config::BLOCKING_POLL_SLICE))? {
            WaitOutcome::Notified => {
                self.lock_tx().cq.ack_events(1);
                Ok(())
            }
            WaitOutcome::TimedOut => Ok(()),
        }
    }

    fn post_failure(&self, hw: HwError) -> RingError {
        let err = RingError::from(hw);
        if err.is_transient() {
            AtomicRingStats::add(&self.stats.tx_backpressure, 1);
        } else {
            AtomicRingStats::add(&self.stats.tx_errors, 1);
            warn!("Ring {} post rejected: {}", self.id(), err);
        }
        err
    }
}
