//! Hardware capability interface
//!
//! The ring never touches a concrete NIC type. A [`QueuePairFactory`] hands
//! out the four hardware halves of a queue pair ([`HwQueues`]) so that the
//! transmit and receive locking domains can each own the part they post to.
//! Descriptor layout, doorbells and DMA mapping stay behind these traits.

pub mod device;
pub mod sim;

use std::sync::Arc;

use bitflags::bitflags;

use crate::sync::notify::CompletionChannel;

pub use device::{L2Address, L2AddressCache, NetDevice};

/// Work request identifier, echoed back in the matching completion
pub type WrId = u64;

/// Local key of a registered memory region
pub type Lkey = u32;

/// Hardware-side handle of an offload context (TIS/TIR number)
pub type HwContextId = u32;

/// Errors reported by the hardware collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HwError {
    /// No room left in the work queue
    #[error("queue full")]
    QueueFull,
    /// Malformed work request
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    /// Capability absent on this device
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Unrecoverable device error
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Scatter/gather element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: Lkey,
}

bitflags! {
    /// Per-packet transmit attributes supplied by the protocol layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxAttributes: u32 {
        /// Copy payload into the work request instead of referencing it
        const INLINE = 1 << 0;
        /// TCP segmentation offload
        const TSO = 1 << 1;
        const L3_CSUM = 1 << 2;
        const L4_CSUM = 1 << 3;
        /// Post a NOP-like descriptor that never reaches the wire
        const DUMMY = 1 << 4;
        /// Wait for buffers or credits instead of failing
        const BLOCKING = 1 << 5;
    }
}

bitflags! {
    /// Offload capabilities advertised by the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OffloadCaps: u32 {
        const TLS_TX = 1 << 0;
        const TLS_RX = 1 << 1;
        const TLS_SYNC_DEK = 1 << 2;
        const NVME_CRC_TX = 1 << 3;
        const NVME_CRC_RX = 1 << 4;
        const NVME_ZEROCOPY = 1 << 5;
    }
}

/// TCP segmentation offload limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TsoCaps {
    pub supported: bool,
    /// Maximum TCP payload per TSO request
    pub max_payload: u32,
    /// Maximum header length per TSO request
    pub max_header: u16,
}

/// Large receive offload capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LroCaps {
    pub supported: bool,
    /// Segments with PSH can be coalesced
    pub psh_flag: bool,
    /// Segments with the TCP timestamp option can be coalesced
    pub timestamp: bool,
    /// 0: TCP header + payload, 1: L2 + L3 + TCP header + payload
    pub max_msg_size_mode: u8,
    /// Minimal TCP segment size eligible for coalescing
    pub min_mss: u16,
    /// Supported LRO timer periods in microseconds
    pub timer_periods: [u32; 4],
    /// Maximum coalesced payload, derived from the mode and rx buffer size
    pub max_payload: u32,
}

/// Capability set queried once at ring construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwCapabilities {
    pub max_inline_bytes: u32,
    pub max_send_sge: u32,
    pub tso: TsoCaps,
    pub lro: LroCaps,
    pub offloads: OffloadCaps,
    pub dummy_send: bool,
    pub rate_limit: bool,
    /// Key of the memory registered for ring-owned buffers
    pub tx_lkey: Lkey,
}

impl Default for HwCapabilities {
    fn default() -> Self {
        Self {
            max_inline_bytes: 204,
            max_send_sge: 4,
            tso: TsoCaps::default(),
            lro: LroCaps::default(),
            offloads: OffloadCaps::empty(),
            dummy_send: false,
            rate_limit: false,
            tx_lkey: 0,
        }
    }
}

/// Send work request
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub wr_id: WrId,
    pub sges: Vec<Sge>,
    /// Payload copied into the descriptor (INLINE attribute)
    pub inline_data: Option<Vec<u8>>,
    pub attrs: TxAttributes,
    /// Transmit offload context to process this packet with
    pub context: Option<HwContextId>,
    /// Segment size for TSO requests
    pub mss: u16,
}

/// Receive work request
#[derive(Debug, Clone, Copy)]
pub struct RecvRequest {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// What produced a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOpcode {
    Send,
    Recv,
    Offload,
}

/// Completion status reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Work request flushed while the queue was being torn down
    Flushed,
    /// Vendor error syndrome
    Error(u32),
}

/// One raw hardware completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    pub wr_id: WrId,
    pub opcode: CompletionOpcode,
    pub status: CompletionStatus,
    pub byte_len: u32,
    /// Steering tag; the ring uses it as the consumer identity
    pub flow_tag: u32,
    pub hw_timestamp: u64,
}

/// Kind of offload context to allocate on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffloadKind {
    /// Inline TLS transmit (TIS)
    TlsTx,
    /// Inline TLS receive (TIR)
    TlsRx,
    /// Storage protocol transmit (TIS)
    Nvme,
}

/// Cryptographic state for an inline TLS context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Wire version, e.g. 0x0303 for TLS 1.2
    pub tls_version: u16,
    /// IANA cipher suite identifier
    pub cipher: u16,
    pub key: Vec<u8>,
    pub iv: [u8; 8],
    pub salt: [u8; 4],
    /// Record sequence number to start from
    pub rec_seq: u64,
}

/// Offload configuration work posted on the send queue
#[derive(Debug, Clone)]
pub enum OffloadWork {
    TlsSetupTx { ctx: HwContextId, info: TlsInfo },
    TlsResyncTx { ctx: HwContextId, info: TlsInfo, skip_static: bool },
    TlsSetupRx { ctx: HwContextId, info: TlsInfo, next_record_tcp_sn: u32 },
    TlsResyncRx { ctx: HwContextId, info: TlsInfo, hw_resync_tcp_sn: u32 },
    TlsProgressQuery { ctx: HwContextId, addr: u64, lkey: Lkey },
    Dump { ctx: Option<HwContextId>, addr: u64, len: u32, lkey: Lkey, first: bool },
    NvmeStatic { ctx: HwContextId, config: u32 },
    NvmeProgress { ctx: HwContextId, tcp_seqno: u32 },
    NopFence,
}

impl OffloadWork {
    /// Context this work touches, if any
    pub fn context(&self) -> Option<HwContextId> {
        match self {
            Self::TlsSetupTx { ctx, .. }
            | Self::TlsResyncTx { ctx, .. }
            | Self::TlsSetupRx { ctx, .. }
            | Self::TlsResyncRx { ctx, .. }
            | Self::TlsProgressQuery { ctx, .. }
            | Self::NvmeStatic { ctx, .. }
            | Self::NvmeProgress { ctx, .. } => Some(*ctx),
            Self::Dump { ctx, .. } => *ctx,
            Self::NopFence => None,
        }
    }
}

/// Packet pacing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimit {
    pub rate_kbps: u32,
    pub max_burst_bytes: u32,
    pub typical_packet_size: u16,
}

/// Send half of a queue pair
pub trait SendQueue: Send {
    fn post_send(&mut self, request: SendRequest) -> Result<(), HwError>;

    /// Post offload configuration work; it completes on the transmit CQ
    fn post_offload(&mut self, wr_id: WrId, work: OffloadWork) -> Result<(), HwError>;

    fn create_context(&mut self, kind: OffloadKind) -> Result<HwContextId, HwError>;

    fn destroy_context(&mut self, ctx: HwContextId) -> Result<(), HwError>;

    fn modify_rate_limit(&mut self, limit: RateLimit) -> Result<(), HwError>;

    /// Register user memory for zero-copy transmission
    fn register_memory(&mut self, addr: u64, len: usize) -> Result<Lkey, HwError>;
}

/// Receive half of a queue pair
pub trait RecvQueue: Send {
    fn post_receive(&mut self, request: RecvRequest) -> Result<(), HwError>;
}

/// Completion queue
pub trait CompletionQueue: Send {
    /// Harvest up to `max` completions in hardware order
    fn poll(&mut self, max: usize) -> Vec<RawCompletion>;

    /// Request an event on the completion channel for the next completion
    fn arm_notification(&mut self) -> Result<(), HwError>;

    /// Acknowledge events consumed from the completion channel
    fn ack_events(&mut self, count: u32);

    fn modify_moderation(&mut self, period_usec: u32, count: u32) -> Result<(), HwError>;
}

/// Parameters for creating a queue pair
#[derive(Debug, Clone)]
pub struct QueuePairDesc {
    pub ring_id: u32,
    pub tx_depth: u32,
    pub rx_depth: u32,
    pub tx_channel: Arc<CompletionChannel>,
    pub rx_channel: Arc<CompletionChannel>,
}

/// Hardware objects owned by one ring
pub struct HwQueues {
    pub send: Box<dyn SendQueue>,
    pub recv: Box<dyn RecvQueue>,
    pub tx_cq: Box<dyn CompletionQueue>,
    pub rx_cq: Box<dyn CompletionQueue>,
}

impl std::fmt::Debug for HwQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwQueues").finish_non_exhaustive()
    }
}

/// Creates queue pairs for one hardware generation/transport
pub trait QueuePairFactory: Send + Sync {
    fn capabilities(&self) -> HwCapabilities;

    fn create(&self, desc: &QueuePairDesc) -> Result<HwQueues, HwError>;
}
