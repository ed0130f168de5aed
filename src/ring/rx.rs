//! Receive domain: posting, harvesting, reclamation, notification and
//! batched event delivery

use std::{
    collections::{HashMap, VecDeque},
    sync::MutexGuard,
};

use log::trace;

use crate::buffers::{BufferDescriptor, BufferKind};
use crate::error::{Result, RingError};
use crate::events::{ConsumerId, EventCompletion, EventFlags, EventQueue, Lane, PacketRef};
use crate::hw::{CompletionQueue, CompletionStatus, RecvQueue, RecvRequest, WrId};
use crate::moderation::CqModeration;
use crate::sync::{SequenceNumber, WaitOutcome};

use super::{ArmResult, AtomicRingStats, DeliveryMode, QueueKind, Ring};

/// Destination of received buffers in per-consumer delivery mode
pub trait RxSink {
    fn deliver(&mut self, buffer: BufferDescriptor);
}

impl RxSink for Vec<BufferDescriptor> {
    fn deliver(&mut self, buffer: BufferDescriptor) {
        self.push(buffer);
    }
}

impl RxSink for VecDeque<BufferDescriptor> {
    fn deliver(&mut self, buffer: BufferDescriptor) {
        self.push_back(buffer);
    }
}

pub(super) struct RxDomain {
    recv: Box<dyn RecvQueue>,
    cq: Box<dyn CompletionQueue>,
    posted: HashMap<WrId, BufferDescriptor>,
    next_wr_id: WrId,
    pub(super) moderation: CqModeration,
    armed_sn: Option<SequenceNumber>,
}

impl RxDomain {
    pub(super) fn new(
        recv: Box<dyn RecvQueue>,
        cq: Box<dyn CompletionQueue>,
        moderation: CqModeration,
    ) -> Self {
        Self {
            recv,
            cq,
            posted: HashMap::new(),
            next_wr_id: 1,
            moderation,
            armed_sn: None,
        }
    }

    /// Buffers still posted to the device, for teardown
    pub(super) fn take_posted(&mut self) -> Vec<BufferDescriptor> {
        self.posted.drain().map(|(_, buffer)| buffer).collect()
    }
}

/// Held receive lock, for [`Ring::reclaim_recv_buffers_no_lock`]
pub struct RxGuard<'a> {
    inner: MutexGuard<'a, RxDomain>,
}

impl Ring {
    /// Take the receive lock
    ///
    /// Meant for protocol code that reclaims buffers from inside a section
    /// already serialized with receive processing.
    pub fn lock_rx(&self) -> RxGuard<'_> {
        RxGuard {
            inner: self.lock_rx_domain(),
        }
    }

    /// Harvest receive completions
    ///
    /// Buffers go to `sink` in per-consumer mode and become event records in
    /// batched mode. The receive queue is refilled before returning. Never
    /// blocks.
    pub fn poll_and_process_rx(
        &self,
        cursor: &mut SequenceNumber,
        sink: &mut dyn RxSink,
    ) -> Result<usize> {
        self.check_usable()?;
        let harvested = {
            let mut rx = self.lock_rx_domain();
            let result = self.harvest_rx_locked(&mut rx, true);
            self.guard(result)?
        };
        let count = harvested.len();
        self.dispatch_rx(harvested, sink);
        self.rx_sequence.publish(cursor);
        Ok(count)
    }

    /// Return received buffers to circulation
    ///
    /// Buffers nobody else references are reposted while the receive queue
    /// has room; the rest go back to the pool.
    pub fn reclaim_recv_buffers(&self, buffers: Vec<BufferDescriptor>) -> Result<usize> {
        self.check_usable()?;
        let mut rx = self.lock_rx_domain();
        let result = self.reclaim_locked(&mut rx, buffers);
        self.guard(result)
    }

    /// [`reclaim_recv_buffers`](Self::reclaim_recv_buffers) for callers
    /// already holding the receive lock
    pub fn reclaim_recv_buffers_no_lock(
        &self,
        rx: &mut RxGuard<'_>,
        buffers: Vec<BufferDescriptor>,
    ) -> Result<usize> {
        self.check_usable()?;
        let result = self.reclaim_locked(&mut rx.inner, buffers);
        self.guard(result)
    }

    /// Return one buffer without taking any ring lock
    ///
    /// Returns true when the buffer went back to the free list immediately.
    pub fn reclaim_recv_single_buffer(&self, buffer: BufferDescriptor) -> Result<bool> {
        self.check_rx_owned(&buffer)?;
        let result = self.rx_pool.try_release(vec![buffer]);
        self.guard(result).map(|returned| returned == 1)
    }

    /// Drop one reference to a receive buffer
    pub fn release_rx_buffer(&self, buffer: BufferDescriptor) -> Result<()> {
        self.check_rx_owned(&buffer)?;
        let result = self.rx_pool.release(vec![buffer]);
        self.guard(result).map(|_| ())
    }

    /// Receive buffers currently posted to the device
    pub fn rx_posted(&self) -> usize {
        self.lock_rx_domain().posted.len()
    }

    /// Arm completion notification for a blocking wait
    ///
    /// `sn` is the caller's last published cursor. When the queue has been
    /// polled since, completions may be waiting and the caller should poll
    /// instead of blocking. Arming again at an equal or older cursor is a
    /// no-op.
    pub fn request_notification(&self, kind: QueueKind, sn: SequenceNumber) -> Result<ArmResult> {
        self.check_usable()?;
        let sequence = match kind {
            QueueKind::Tx => &self.tx_sequence,
            QueueKind::Rx => &self.rx_sequence,
        };
        if sequence.has_advanced_since(sn) {
            return Ok(ArmResult::AlreadyPending);
        }

        match kind {
            QueueKind::Tx => {
                let mut tx = self.lock_tx();
                if tx.armed_sn.is_some_and(|armed| armed >= sn) {
                    return Ok(ArmResult::Armed);
                }
                tx.cq.arm_notification()?;
                tx.armed_sn = Some(sn);
            }
            QueueKind::Rx => {
                let mut rx = self.lock_rx_domain();
                if rx.armed_sn.is_some_and(|armed| armed >= sn) {
                    return Ok(ArmResult::Armed);
                }
                rx.cq.arm_notification()?;
                rx.armed_sn = Some(sn);
            }
        }
        trace!(
            "Ring {} armed {:?} notification on queue {} at poll {}",
            self.id(),
            kind,
            sequence.queue_id(),
            sn
        );
        Ok(ArmResult::Armed)
    }

    /// Block until the queue signals or the wait is interrupted, then poll
    ///
    /// Waits at most the configured notification timeout and polls either
    /// way. Fails with `Interrupted` when the channel was interrupted.
    pub fn wait_for_notification_and_process(
        &self,
        kind: QueueKind,
        cursor: &mut SequenceNumber,
        sink: &mut dyn RxSink,
    ) -> Result<usize> {
        self.check_usable()?;
        let outcome = self.channel(kind).wait(self.config.notification_timeout)?;
        if outcome == WaitOutcome::Notified {
            match kind {
                QueueKind::Tx => {
                    let mut tx = self.lock_tx();
                    tx.cq.ack_events(1);
                    tx.armed_sn = None;
                }
                QueueKind::Rx => {
                    let mut rx = self.lock_rx_domain();
                    rx.cq.ack_events(1);
                    rx.armed_sn = None;
                }
            }
            AtomicRingStats::add(&self.stats.notifications, 1);
        }

        match kind {
            QueueKind::Tx => self.poll_and_process_tx(cursor),
            QueueKind::Rx => self.poll_and_process_rx(cursor, sink),
        }
    }

    /// Recompute receive completion moderation from recent traffic
    ///
    /// Returns the `(period usec, count)` pair pushed to the hardware, or
    /// `None` when the setting did not change.
    pub fn adapt_cq_moderation(&self) -> Result<Option<(u32, u32)>> {
        self.check_usable()?;
        let mut guard = self.lock_rx_domain();
        let rx = &mut *guard;
        let Some((period, count)) = rx.moderation.recompute() else {
            return Ok(None);
        };
        rx.moderation.apply(rx.cq.as_mut(), period, count)?;
        AtomicRingStats::add(&self.stats.moderation_changes, 1);
        let info = rx.moderation.info();
        Ok(Some((info.period, info.count)))
    }

    // ---- batched event delivery ----

    /// Collect up to `max` event records into `out`
    ///
    /// The fast-path slot is served first, then the queued lane. In batched
    /// mode the receive queue is polled when records are still missing.
    pub fn poll_events(&self, out: &mut Vec<EventCompletion>, max: usize) -> Result<usize> {
        self.check_usable()?;
        if max == 0 {
            return Ok(0);
        }

        let start = out.len();
        self.events.begin_drain();
        self.collect_events(out, max);

        if out.len() - start < max && self.config.delivery == DeliveryMode::Batched {
            let harvested = {
                let mut rx = self.lock_rx_domain();
                let result = self.harvest_rx_locked(&mut rx, true);
                match self.guard(result) {
                    Ok(harvested) => harvested,
                    Err(e) => {
                        drop(rx);
                        self.events.end_drain();
                        return Err(e);
                    }
                }
            };
            self.dispatch_rx(harvested, &mut Vec::<BufferDescriptor>::new());
            self.collect_events(out, max - (out.len() - start));
        }

        self.events.end_drain();
        Ok(out.len() - start)
    }

    /// Surface a non-packet event (connection accepted, hang-up, error)
    pub fn post_event(&self, consumer: ConsumerId, events: EventFlags) -> Lane {
        self.events.deliver(consumer, events, None)
    }

    /// Value reported as `user_data` in records for `consumer`
    pub fn set_user_data(&self, consumer: ConsumerId, user_data: u64) {
        self.events.set_user_data(consumer, user_data);
    }

    /// Forget a consumer; buffers of its undelivered record are released
    ///
    /// Returns the events that were still pending for it.
    pub fn remove_consumer(&self, consumer: ConsumerId) -> Result<Option<EventFlags>> {
        let Some(record) = self.events.remove(consumer) else {
            return Ok(None);
        };
        if let Some(packet) = record.packet {
            let result = self.release_buffers(packet.buffers);
            self.guard(result)?;
        }
        Ok(Some(record.events))
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    // ---- internals ----

    /// Post receive buffers until the queue is back at its depth
    pub(super) fn replenish_rx_locked(&self, rx: &mut RxDomain) -> Result<usize> {
        let missing = (self.config.rx_depth as usize).saturating_sub(rx.posted.len());
        if missing == 0 {
            return Ok(0);
        }

        let mut buffers = self.rx_pool.acquire_up_to(missing)?.into_iter();
        let mut posted = 0;
        while let Some(buffer) = buffers.next() {
            if !self.post_rx_locked(rx, buffer)? {
                self.rx_pool.release(buffers.collect())?;
                break;
            }
            posted += 1;
        }
        if posted > 0 {
            trace!("Ring {} posted {} receive buffers", self.id(), posted);
        }
        Ok(posted)
    }

    /// False when the device refused the buffer; it is released then
    fn post_rx_locked(&self, rx: &mut RxDomain, mut buffer: BufferDescriptor) -> Result<bool> {
        buffer.set_len(buffer.capacity())?;
        buffer.set_hw_timestamp(0);
        buffer.set_flow_tag(0);

        let wr_id = rx.next_wr_id;
        rx.next_wr_id = rx.next_wr_id.wrapping_add(1);
        let request = RecvRequest {
            wr_id,
            sge: buffer.sge(self.caps.tx_lkey),
        };
        match rx.recv.post_receive(request) {
            Ok(()) => {
                buffer.set_len(0)?;
                rx.posted.insert(wr_id, buffer);
                Ok(true)
            }
            Err(e) => {
                trace!("Ring {} receive post refused: {}", self.id(), e);
                self.rx_pool.release(vec![buffer])?;
                Ok(false)
            }
        }
    }

    fn harvest_rx_locked(&self, rx: &mut RxDomain, repost: bool) -> Result<Vec<BufferDescriptor>> {
        let completions = rx.cq.poll(self.config.poll_budget);
        if completions.is_empty() {
            return Ok(Vec::new());
        }

        let mut ready = Vec::with_capacity(completions.len());
        let mut failed = Vec::new();
        let (mut packets, mut bytes) = (0u64, 0u64);
        for completion in &completions {
            let Some(mut buffer) = rx.posted.remove(&completion.wr_id) else {
                return Err(RingError::consistency(format!(
                    "receive completion for unknown work request {}",
                    completion.wr_id
                )));
            };
            AtomicRingStats::add(&self.stats.rx_completions, 1);
            match completion.status {
                CompletionStatus::Success => {
                    buffer.set_len(completion.byte_len as usize)?;
                    buffer.set_hw_timestamp(completion.hw_timestamp);
                    buffer.set_flow_tag(completion.flow_tag);
                    packets += 1;
                    bytes += u64::from(completion.byte_len);
                    ready.push(buffer);
                }
                CompletionStatus::Flushed => failed.push(buffer),
                CompletionStatus::Error(syndrome) => {
                    AtomicRingStats::add(&self.stats.rx_errors, 1);
                    trace!(
                        "Ring {} receive {} failed with syndrome {:#x}",
                        self.id(),
                        completion.wr_id,
                        syndrome
                    );
                    failed.push(buffer);
                }
            }
        }

        rx.moderation.observe(packets, bytes);
        self.stats.record_receive(packets, bytes);
        self.rx_sequence.advance();

        if repost && self.is_up() {
            for buffer in failed {
                self.post_rx_locked(rx, buffer)?;
            }
            self.replenish_rx_locked(rx)?;
        } else {
            self.rx_pool.release(failed)?;
        }
        Ok(ready)
    }

    fn dispatch_rx(&self, buffers: Vec<BufferDescriptor>, sink: &mut dyn RxSink) {
        match self.config.delivery {
            DeliveryMode::PerConsumer => {
                for buffer in buffers {
                    sink.deliver(buffer);
                }
            }
            DeliveryMode::Batched => {
                for buffer in buffers {
                    let consumer = buffer.flow_tag();
                    self.events.deliver(
                        consumer,
                        EventFlags::PACKET | EventFlags::IN,
                        Some(PacketRef::new(buffer)),
                    );
                }
            }
        }
    }

    fn collect_events(&self, out: &mut Vec<EventCompletion>, room: usize) {
        let mut taken = 0;
        if let Some(record) = self.events.take_fast() {
            out.push(record);
            taken += 1;
        }
        while taken < room {
            match self.events.pop() {
                Some(record) => {
                    out.push(record);
                    taken += 1;
                }
                None => break,
            }
        }
    }

    fn reclaim_locked(&self, rx: &mut RxDomain, buffers: Vec<BufferDescriptor>) -> Result<usize> {
        for buffer in &buffers {
            self.check_rx_owned(buffer)?;
        }

        let count = buffers.len();
        let up = self.is_up();
        let mut release = Vec::new();
        for buffer in buffers {
            let unique = buffer.ref_count() == 1;
            if unique && up && rx.posted.len() < self.config.rx_depth as usize {
                self.post_rx_locked(rx, buffer)?;
            } else {
                release.push(buffer);
            }
        }
        self.rx_pool.release(release)?;
        Ok(count)
    }

    pub(super) fn drain_rx_once(&self) -> Result<usize> {
        let harvested = {
            let mut rx = self.lock_rx_domain();
            let result = self.harvest_rx_locked(&mut rx, false);
            self.guard(result)?
        };
        let count = harvested.len();
        match self.config.delivery {
            DeliveryMode::Batched => self.dispatch_rx(harvested, &mut Vec::<BufferDescriptor>::new()),
            DeliveryMode::PerConsumer => {
                let result = self.rx_pool.release(harvested);
                self.guard(result)?;
            }
        }
        Ok(count)
    }

    fn check_rx_owned(&self, buffer: &BufferDescriptor) -> Result<()> {
        if buffer.kind() != BufferKind::Rx || buffer.owner_ring() != self.id() {
            return Err(RingError::invalid_parameter(
                "buffer",
                format!(
                    "{:?} buffer of ring {} is not a receive buffer of ring {}",
                    buffer.kind(),
                    buffer.owner_ring(),
                    self.id()
                ),
            ));
        }
        Ok(())
    }
}
