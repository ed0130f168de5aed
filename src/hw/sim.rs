//! Software NIC
//!
//! Implements the hardware capability interface in memory. Sent frames are
//! captured and optionally looped back into posted receive buffers; frames
//! can be injected with a steering tag. Transmit completions are generated
//! either immediately or on demand, which lets tests hold work in flight.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::trace;

use crate::sync::notify::CompletionChannel;

use super::{
    device::{L2Address, NetDevice},
    CompletionOpcode, CompletionQueue, CompletionStatus, HwCapabilities, HwContextId, HwError,
    HwQueues, LroCaps, Lkey, OffloadCaps, OffloadKind, OffloadWork, QueuePairDesc,
    QueuePairFactory, RateLimit, RawCompletion, RecvQueue, RecvRequest, SendQueue, SendRequest,
    TsoCaps, TxAttributes, WrId,
};

/// Layout of the progress record written for a TLS progress query
pub const SIM_PROGRESS_RECORD_LEN: usize = 8;

/// Software NIC settings
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub capabilities: HwCapabilities,
    /// Complete transmit work as soon as it is posted
    pub auto_complete: bool,
    /// Steering tag for frames looped back into the receive queue
    pub loopback_tag: Option<u32>,
    pub mtu: u32,
    pub l2_address: L2Address,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capabilities: HwCapabilities {
                max_inline_bytes: 204,
                max_send_sge: 8,
                tso: TsoCaps {
                    supported: true,
                    max_payload: 256 * 1024,
                    max_header: 192,
                },
                lro: LroCaps {
                    supported: true,
                    psh_flag: true,
                    timestamp: true,
                    max_msg_size_mode: 0,
                    min_mss: 536,
                    timer_periods: [8, 16, 32, 1024],
                    max_payload: 64 * 1024,
                },
                offloads: OffloadCaps::all(),
                dummy_send: true,
                rate_limit: true,
                tx_lkey: 0x1000,
            },
            auto_complete: true,
            loopback_tag: None,
            mtu: 1500,
            l2_address: L2Address::Ethernet([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        }
    }
}

#[derive(Debug)]
struct PendingWork {
    wr_id: WrId,
    opcode: CompletionOpcode,
    byte_len: u32,
}

#[derive(Debug, Default)]
struct CqState {
    entries: VecDeque<RawCompletion>,
    armed: bool,
    channel: Option<Arc<CompletionChannel>>,
    acked: u64,
}

impl CqState {
    fn push(&mut self, completion: RawCompletion) {
        self.entries.push_back(completion);
        if self.armed {
            self.armed = false;
            if let Some(channel) = &self.channel {
                let _ = channel.notify();
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    auto_complete: bool,
    loopback_tag: Option<u32>,
    tx_depth: usize,
    rx_depth: usize,
    tx_outstanding: VecDeque<PendingWork>,
    tx_cq: CqState,
    rx_posted: VecDeque<RecvRequest>,
    rx_cq: CqState,
    rx_dropped: u64,
    sent: Vec<Vec<u8>>,
    fail_next: Option<HwError>,
    contexts: HashMap<HwContextId, OffloadKind>,
    next_context: HwContextId,
    offload_log: Vec<OffloadWork>,
    moderation: (u32, u32),
    rate_limit: Option<RateLimit>,
    registrations: HashMap<(u64, usize), Lkey>,
    next_lkey: Lkey,
    clock: u64,
    tls_rx_resync_sn: HashMap<HwContextId, u32>,
}

impl SimState {
    fn take_failure(&mut self) -> Result<(), HwError> {
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1_000;
        self.clock
    }

    fn queue_tx_work(&mut self, work: PendingWork) -> Result<(), HwError> {
        if self.tx_outstanding.len() >= self.tx_depth {
            return Err(HwError::QueueFull);
        }
        self.tx_outstanding.push_back(work);
        if self.auto_complete {
            self.complete_tx(usize::MAX, CompletionStatus::Success);
        }
        Ok(())
    }

    fn complete_tx(&mut self, max: usize, status: CompletionStatus) -> usize {
        let mut done = 0;
        while done < max {
            let Some(work) = self.tx_outstanding.pop_front() else {
                break;
            };
            let timestamp = self.tick();
            self.tx_cq.push(RawCompletion {
                wr_id: work.wr_id,
                opcode: work.opcode,
                status,
                byte_len: work.byte_len,
                flow_tag: 0,
                hw_timestamp: timestamp,
            });
            done += 1;
        }
        done
    }

    fn deliver_rx(&mut self, flow_tag: u32, frame: &[u8]) -> bool {
        let Some(request) = self.rx_posted.pop_front() else {
            self.rx_dropped += 1;
            return false;
        };
        let len = frame.len().min(request.sge.length as usize);
        // SAFETY: posted receive buffers stay owned by the ring and valid
        // until their completion is harvested.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), request.sge.addr as *mut u8, len);
        }
        let timestamp = self.tick();
        self.rx_cq.push(RawCompletion {
            wr_id: request.wr_id,
            opcode: CompletionOpcode::Recv,
            status: CompletionStatus::Success,
            byte_len: len as u32,
            flow_tag,
            hw_timestamp: timestamp,
        });
        true
    }
}

/// In-memory NIC implementing [`QueuePairFactory`]
///
/// Clones share the same device state.
#[derive(Debug, Clone)]
pub struct SimNic {
    capabilities: HwCapabilities,
    state: Arc<Mutex<SimState>>,
    device: Arc<SimDevice>,
}

impl SimNic {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            auto_complete: config.auto_complete,
            loopback_tag: config.loopback_tag,
            next_context: 1,
            next_lkey: config.capabilities.tx_lkey + 1,
            ..Default::default()
        };
        Self {
            capabilities: config.capabilities,
            state: Arc::new(Mutex::new(state)),
            device: Arc::new(SimDevice::new(config.mtu, config.l2_address)),
        }
    }

    /// Device view of this NIC
    pub fn device(&self) -> Arc<SimDevice> {
        Arc::clone(&self.device)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    /// Loop sent frames back into the receive queue with `tag`
    pub fn set_loopback(&self, tag: Option<u32>) {
        self.state().loopback_tag = tag;
    }

    /// Deliver a frame into the next posted receive buffer
    ///
    /// Returns false when no receive buffer was posted.
    pub fn inject_rx(&self, flow_tag: u32, frame: &[u8]) -> bool {
        self.state().deliver_rx(flow_tag, frame)
    }

    /// Complete up to `max` outstanding transmit work requests
    pub fn complete_tx(&self, max: usize) -> usize {
        self.state().complete_tx(max, CompletionStatus::Success)
    }

    /// Complete outstanding transmit work with an error status
    pub fn fail_tx(&self, max: usize, syndrome: u32) -> usize {
        self.state().complete_tx(max, CompletionStatus::Error(syndrome))
    }

    /// Make the next post on any queue fail with `err`
    pub fn fail_next_post(&self, err: HwError) {
        self.state().fail_next = Some(err);
    }

    /// Transmit work posted but not yet completed
    pub fn pending_tx(&self) -> usize {
        self.state().tx_outstanding.len()
    }

    /// Receive buffers currently posted to the device
    pub fn posted_rx(&self) -> usize {
        self.state().rx_posted.len()
    }

    pub fn rx_dropped(&self) -> u64 {
        self.state().rx_dropped
    }

    /// Frames put on the wire since the last call
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().sent)
    }

    /// Current completion moderation as (period usec, count)
    pub fn moderation(&self) -> (u32, u32) {
        self.state().moderation
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.state().rate_limit
    }

    /// Offload contexts allocated on the device
    pub fn live_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    /// Offload work posted since the last call
    pub fn take_offload_log(&self) -> Vec<OffloadWork> {
        std::mem::take(&mut self.state().offload_log)
    }

    /// Completion events acknowledged on the (tx, rx) queues
    pub fn acked_events(&self) -> (u64, u64) {
        let state = self.state();
        (state.tx_cq.acked, state.rx_cq.acked)
    }
}

impl Default for SimNic {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl QueuePairFactory for SimNic {
    fn capabilities(&self) -> HwCapabilities {
        self.capabilities.clone()
    }

    fn create(&self, desc: &QueuePairDesc) -> Result<HwQueues, HwError> {
        if desc.tx_depth == 0 || desc.rx_depth == 0 {
            return Err(HwError::InvalidDescriptor("queue depth must be non-zero".into()));
        }
        {
            let mut state = self.state();
            state.tx_depth = desc.tx_depth as usize;
            state.rx_depth = desc.rx_depth as usize;
            state.tx_cq.channel = Some(Arc::clone(&desc.tx_channel));
            state.rx_cq.channel = Some(Arc::clone(&desc.rx_channel));
        }
        trace!(
            "Sim NIC created queue pair for ring {} (tx {}, rx {})",
            desc.ring_id,
            desc.tx_depth,
            desc.rx_depth
        );

        Ok(HwQueues {
            send: Box::new(SimSendQueue {
                state: Arc::clone(&self.state),
                max_inline: self.capabilities.max_inline_bytes as usize,
                max_sge: self.capabilities.max_send_sge as usize,
                offloads: self.capabilities.offloads,
                rate_limit: self.capabilities.rate_limit,
            }),
            recv: Box::new(SimRecvQueue {
                state: Arc::clone(&self.state),
            }),
            tx_cq: Box::new(SimCompletionQueue {
                state: Arc::clone(&self.state),
                role: CqRole::Tx,
            }),
            rx_cq: Box::new(SimCompletionQueue {
                state: Arc::clone(&self.state),
                role: CqRole::Rx,
            }),
        })
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct SimSendQueue {
    state: Arc<Mutex<SimState>>,
    max_inline: usize,
    max_sge: usize,
    offloads: OffloadCaps,
    rate_limit: bool,
}

impl SendQueue for SimSendQueue {
    fn post_send(&mut self, request: SendRequest) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.take_failure()?;

        if request.sges.len() > self.max_sge {
            return Err(HwError::InvalidDescriptor(format!(
                "{} scatter/gather entries exceed {}",
                request.sges.len(),
                self.max_sge
            )));
        }
        if let Some(ctx) = request.context {
            if !state.contexts.contains_key(&ctx) {
                return Err(HwError::InvalidDescriptor(format!("unknown context {}", ctx)));
            }
        }

        let mut frame = Vec::new();
        match &request.inline_data {
            Some(data) => {
                if data.len() > self.max_inline {
                    return Err(HwError::InvalidDescriptor(format!(
                        "{} inline bytes exceed {}",
                        data.len(),
                        self.max_inline
                    )));
                }
                frame.extend_from_slice(data);
            }
            None => {
                for sge in &request.sges {
                    // SAFETY: the ring keeps posted buffers alive until the
                    // send completes; the copy happens during the post.
                    let bytes = unsafe {
                        std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize)
                    };
                    frame.extend_from_slice(bytes);
                }
            }
        }

        state.queue_tx_work(PendingWork {
            wr_id: request.wr_id,
            opcode: CompletionOpcode::Send,
            byte_len: frame.len() as u32,
        })?;

        if request.attrs.contains(TxAttributes::DUMMY) {
            return Ok(());
        }
        if let Some(tag) = state.loopback_tag {
            state.deliver_rx(tag, &frame);
        }
        state.sent.push(frame);
        Ok(())
    }

    fn post_offload(&mut self, wr_id: WrId, work: OffloadWork) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.take_failure()?;

        if let Some(ctx) = work.context() {
            if !state.contexts.contains_key(&ctx) {
                return Err(HwError::InvalidDescriptor(format!("unknown context {}", ctx)));
            }
        }

        match &work {
            OffloadWork::TlsSetupRx { ctx, next_record_tcp_sn, .. } => {
                state.tls_rx_resync_sn.insert(*ctx, *next_record_tcp_sn);
            }
            OffloadWork::TlsResyncRx { ctx, hw_resync_tcp_sn, .. } => {
                state.tls_rx_resync_sn.insert(*ctx, *hw_resync_tcp_sn);
            }
            OffloadWork::TlsProgressQuery { ctx, addr, .. } => {
                let sn = state.tls_rx_resync_sn.get(ctx).copied().unwrap_or(0);
                let mut record = [0u8; SIM_PROGRESS_RECORD_LEN];
                record[..4].copy_from_slice(&sn.to_le_bytes());
                // Tracker state: tracking; auth state: no offload
                record[4] = 1;
                record[5] = 0;
                // SAFETY: the caller posts a buffer of at least the record size
                // and keeps it alive until this work completes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        record.as_ptr(),
                        *addr as *mut u8,
                        SIM_PROGRESS_RECORD_LEN,
                    );
                }
            }
            _ => {}
        }

        state.queue_tx_work(PendingWork {
            wr_id,
            opcode: CompletionOpcode::Offload,
            byte_len: 0,
        })?;
        state.offload_log.push(work);
        Ok(())
    }

    fn create_context(&mut self, kind: OffloadKind) -> Result<HwContextId, HwError> {
        let required = match kind {
            OffloadKind::TlsTx => OffloadCaps::TLS_TX,
            OffloadKind::TlsRx => OffloadCaps::TLS_RX,
            OffloadKind::Nvme => OffloadCaps::NVME_CRC_TX,
        };
        if !self.offloads.contains(required) {
            return Err(HwError::Unsupported("offload context"));
        }
        let mut state = lock(&self.state);
        state.take_failure()?;
        let id = state.next_context;
        state.next_context += 1;
        state.contexts.insert(id, kind);
        Ok(id)
    }

    fn destroy_context(&mut self, ctx: HwContextId) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.tls_rx_resync_sn.remove(&ctx);
        match state.contexts.remove(&ctx) {
            Some(_) => Ok(()),
            None => Err(HwError::InvalidDescriptor(format!("unknown context {}", ctx))),
        }
    }

    fn modify_rate_limit(&mut self, limit: RateLimit) -> Result<(), HwError> {
        if !self.rate_limit {
            return Err(HwError::Unsupported("rate limit"));
        }
        let mut state = lock(&self.state);
        state.take_failure()?;
        state.rate_limit = Some(limit);
        Ok(())
    }

    fn register_memory(&mut self, addr: u64, len: usize) -> Result<Lkey, HwError> {
        if addr == 0 || len == 0 {
            return Err(HwError::InvalidDescriptor("empty memory registration".into()));
        }
        let mut state = lock(&self.state);
        let next = state.next_lkey;
        let lkey = *state.registrations.entry((addr, len)).or_insert(next);
        if lkey == next {
            state.next_lkey += 1;
        }
        Ok(lkey)
    }
}

struct SimRecvQueue {
    state: Arc<Mutex<SimState>>,
}

impl RecvQueue for SimRecvQueue {
    fn post_receive(&mut self, request: RecvRequest) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.take_failure()?;
        if state.rx_posted.len() >= state.rx_depth {
            return Err(HwError::QueueFull);
        }
        state.rx_posted.push_back(request);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum CqRole {
    Tx,
    Rx,
}

struct SimCompletionQueue {
    state: Arc<Mutex<SimState>>,
    role: CqRole,
}

impl SimCompletionQueue {
    fn cq<'a>(&self, state: &'a mut SimState) -> &'a mut CqState {
        match self.role {
            CqRole::Tx => &mut state.tx_cq,
            CqRole::Rx => &mut state.rx_cq,
        }
    }
}

impl CompletionQueue for SimCompletionQueue {
    fn poll(&mut self, max: usize) -> Vec<RawCompletion> {
        let mut state = lock(&self.state);
        let cq = self.cq(&mut state);
        let count = cq.entries.len().min(max);
        cq.entries.drain(..count).collect()
    }

    fn arm_notification(&mut self) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        let cq = self.cq(&mut state);
        if cq.entries.is_empty() {
            cq.armed = true;
        } else if let Some(channel) = &cq.channel {
            // Completions already waiting: fire right away
            let _ = channel.notify();
        }
        Ok(())
    }

    fn ack_events(&mut self, count: u32) {
        let mut state = lock(&self.state);
        self.cq(&mut state).acked += u64::from(count);
    }

    fn modify_moderation(&mut self, period_usec: u32, count: u32) -> Result<(), HwError> {
        let mut state = lock(&self.state);
        state.moderation = (period_usec, count);
        Ok(())
    }
}

/// Device half of the software NIC
#[derive(Debug)]
pub struct SimDevice {
    up: AtomicBool,
    mtu: AtomicU32,
    l2_address: Mutex<L2Address>,
}

impl SimDevice {
    fn new(mtu: u32, l2_address: L2Address) -> Self {
        Self {
            up: AtomicBool::new(true),
            mtu: AtomicU32::new(mtu),
            l2_address: Mutex::new(l2_address),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Release);
    }

    pub fn set_l2_address(&self, address: L2Address) {
        *self.l2_address.lock().unwrap_or_else(|e| e.into_inner()) = address;
    }
}

impl NetDevice for SimDevice {
    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    fn l2_address(&self) -> L2Address {
        self.l2_address.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(nic: &SimNic) -> HwQueues {
        let desc = QueuePairDesc {
            ring_id: 1,
            tx_depth: 4,
            rx_depth: 4,
            tx_channel: Arc::new(CompletionChannel::new("tx").unwrap()),
            rx_channel: Arc::new(CompletionChannel::new("rx").unwrap()),
        };
        nic.create(&desc).unwrap()
    }

    #[test]
    fn test_inline_send_and_manual_completion() {
        let nic = SimNic::default();
        nic.set_auto_complete(false);
        let mut hw = queues(&nic);

        let request = SendRequest {
            wr_id: 7,
            sges: Vec::new(),
            inline_data: Some(b"ping".to_vec()),
            attrs: TxAttributes::INLINE,
            context: None,
            mss: 0,
        };
        hw.send.post_send(request).unwrap();
        assert_eq!(nic.pending_tx(), 1);
        assert!(hw.tx_cq.poll(8).is_empty());

        assert_eq!(nic.complete_tx(8), 1);
        let completions = hw.tx_cq.poll(8);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].wr_id, 7);
        assert_eq!(nic.take_sent(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_queue_full() {
        let nic = SimNic::default();
        nic.set_auto_complete(false);
        let mut hw = queues(&nic);
        for wr_id in 0..4 {
            hw.send.post_offload(wr_id, OffloadWork::NopFence).unwrap();
        }
        let err = hw.send.post_offload(4, OffloadWork::NopFence).unwrap_err();
        assert_eq!(err, HwError::QueueFull);
    }

    #[test]
    fn test_rx_injection_without_posted_buffer_drops() {
        let nic = SimNic::default();
        let _hw = queues(&nic);
        assert!(!nic.inject_rx(3, b"lost"));
        assert_eq!(nic.rx_dropped(), 1);
    }

    #[test]
    fn test_unsupported_context() {
        let mut config = SimConfig::default();
        config.capabilities.offloads = OffloadCaps::TLS_TX;
        let nic = SimNic::new(config);
        let mut hw = queues(&nic);
        assert!(hw.send.create_context(OffloadKind::TlsTx).is_ok());
        assert!(matches!(
            hw.send.create_context(OffloadKind::TlsRx),
            Err(HwError::Unsupported(_))
        ));
    }
}
