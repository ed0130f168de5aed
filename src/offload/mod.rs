//! Hardware offload contexts for inline TLS and storage protocol processing
//!
//! Contexts are created, mutated and released through the ring, under its
//! transmit lock, because every context operation posts work on the shared
//! send queue. This module holds the handle types and the per-ring registry.

pub mod manager;

use std::fmt;
use std::sync::Arc;

pub use manager::{OffloadManager, OffloadStats, ReleaseAction};

/// Ring-local identifier of an offload context; never reused
pub type ContextId = u64;

/// What a context is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// Inline TLS on the transmit queue (TIS)
    TlsTx,
    /// Inline TLS on the receive queue (TIR)
    TlsRx,
    /// Storage protocol digest/placement on the transmit queue (TIS)
    NvmeTx,
}

impl ContextRole {
    /// Transmit-side contexts may be referenced by sends
    pub fn is_tx(self) -> bool {
        matches!(self, Self::TlsTx | Self::NvmeTx)
    }
}

/// Handle to an offload context owned by a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffloadContext {
    id: ContextId,
    role: ContextRole,
}

impl OffloadContext {
    pub(crate) fn new(id: ContextId, role: ContextRole) -> Self {
        Self { id, role }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }
}

/// Record tracker state reported by a TLS progress query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Start,
    Tracking,
    Searching,
    Unknown(u8),
}

impl From<u8> for TrackerState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Start,
            1 => Self::Tracking,
            2 => Self::Searching,
            other => Self::Unknown(other),
        }
    }
}

/// Authentication state reported by a TLS progress query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoOffload,
    Offload,
    Authentication,
    Unknown(u8),
}

impl From<u8> for AuthState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::NoOffload,
            1 => Self::Offload,
            2 => Self::Authentication,
            other => Self::Unknown(other),
        }
    }
}

/// Receive-side TLS progress parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsProgressParams {
    /// TCP sequence number where the hardware expects the next record
    pub hw_resync_tcp_sn: u32,
    pub tracker_state: TrackerState,
    pub auth_state: AuthState,
}

impl TlsProgressParams {
    /// Size of the record the device writes
    pub const RECORD_LEN: usize = 8;

    /// Decode the device record; `None` when it is too short
    pub fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < Self::RECORD_LEN {
            return None;
        }
        let sn = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        Some(Self {
            hw_resync_tcp_sn: sn,
            tracker_state: TrackerState::from(record[4]),
            auth_state: AuthState::from(record[5]),
        })
    }
}

/// Completion of receive-side offload work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadEvent {
    /// Static and progress parameters were programmed
    SetupComplete,
    ResyncComplete,
    ProgressParams(TlsProgressParams),
    /// The device rejected the work with a vendor syndrome
    Failed(u32),
}

/// Callback for receive offload completions
///
/// Invoked after the transmit lock is released, so it may call back into
/// the ring.
pub type RxCallback = Arc<dyn Fn(OffloadContext, OffloadEvent) + Send + Sync>;

/// Wrapper so registries holding callbacks stay `Debug`
#[derive(Clone)]
pub(crate) struct CallbackSlot(pub(crate) RxCallback);

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RxCallback")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_params_parse() {
        let mut record = [0u8; 8];
        record[..4].copy_from_slice(&4242u32.to_le_bytes());
        record[4] = 1;
        record[5] = 2;
        let params = TlsProgressParams::parse(&record).unwrap();
        assert_eq!(params.hw_resync_tcp_sn, 4242);
        assert_eq!(params.tracker_state, TrackerState::Tracking);
        assert_eq!(params.auth_state, AuthState::Authentication);

        assert!(TlsProgressParams::parse(&record[..5]).is_none());
        assert_eq!(TrackerState::from(9), TrackerState::Unknown(9));
    }
}
