//! Per-ring offload context registry
//!
//! Lives inside the ring's transmit domain, so every method runs under the
//! transmit lock. Released contexts are dropped from the table; a handle to
//! one reports `StaleContext` instead of reaching the hardware.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{Result, RingError};
use crate::hw::{HwContextId, OffloadCaps};

use super::{CallbackSlot, ContextId, ContextRole, OffloadContext, RxCallback};

#[derive(Debug)]
struct ContextEntry {
    role: ContextRole,
    hw: HwContextId,
    in_flight: u32,
    /// Receive context whose hardware object goes back to the cache
    cached: bool,
    callback: Option<CallbackSlot>,
}

/// Offload counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub tls_tx_contexts: u32,
    pub tls_rx_contexts: u32,
    pub nvme_contexts: u32,
    pub created: u64,
    pub released: u64,
    pub resyncs: u64,
    pub cached_tirs: u32,
}

/// What the caller must do after a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Destroy the hardware object
    Destroy(HwContextId),
    /// The hardware object was parked in the receive cache
    Cached,
}

/// Registry of the offload contexts of one ring
#[derive(Debug)]
pub struct OffloadManager {
    caps: OffloadCaps,
    contexts: HashMap<ContextId, ContextEntry>,
    next_id: ContextId,
    tir_cache: Vec<HwContextId>,
    stats: OffloadStats,
}

impl OffloadManager {
    /// Create a registry for a device advertising `caps`
    pub fn new(caps: OffloadCaps) -> Self {
        Self {
            caps,
            contexts: HashMap::new(),
            next_id: 1,
            tir_cache: Vec::new(),
            stats: OffloadStats::default(),
        }
    }

    pub fn caps(&self) -> OffloadCaps {
        self.caps
    }

    pub fn supports(&self, role: ContextRole) -> bool {
        self.caps.contains(Self::required(role).0)
    }

    /// Fail with `OffloadUnsupported` when the device lacks `role`
    pub fn ensure_supported(&self, role: ContextRole) -> Result<()> {
        let (flag, feature) = Self::required(role);
        if self.caps.contains(flag) {
            Ok(())
        } else {
            Err(RingError::OffloadUnsupported { feature })
        }
    }

    fn required(role: ContextRole) -> (OffloadCaps, &'static str) {
        match role {
            ContextRole::TlsTx => (OffloadCaps::TLS_TX, "tls tx"),
            ContextRole::TlsRx => (OffloadCaps::TLS_RX, "tls rx"),
            ContextRole::NvmeTx => (OffloadCaps::NVME_CRC_TX, "nvme tx"),
        }
    }

    /// Hardware receive context parked by an earlier cached release
    pub fn take_cached_tir(&mut self) -> Option<HwContextId> {
        let hw = self.tir_cache.pop();
        self.stats.cached_tirs = self.tir_cache.len() as u32;
        hw
    }

    /// Track a freshly created hardware context
    pub fn register(&mut self, role: ContextRole, hw: HwContextId, cached: bool) -> OffloadContext {
        let id = self.next_id;
        self.next_id += 1;
        self.contexts.insert(
            id,
            ContextEntry {
                role,
                hw,
                in_flight: 0,
                cached,
                callback: None,
            },
        );
        self.stats.created += 1;
        *self.live_counter(role) += 1;
        debug!("Created {:?} offload context {} (hw {})", role, id, hw);
        OffloadContext::new(id, role)
    }

    /// Resolve an active context to its hardware object
    pub fn lookup(&self, ctx: OffloadContext) -> Result<HwContextId> {
        let entry = self.active_entry(ctx)?;
        Ok(entry.hw)
    }

    pub fn set_callback(&mut self, ctx: OffloadContext, callback: RxCallback) -> Result<()> {
        self.active_entry(ctx)?;
        if let Some(entry) = self.contexts.get_mut(&ctx.id()) {
            entry.callback = Some(CallbackSlot(callback));
        }
        Ok(())
    }

    /// Callback registered for `id`, if the context still exists
    pub fn callback(&self, id: ContextId) -> Option<RxCallback> {
        self.contexts
            .get(&id)
            .and_then(|entry| entry.callback.as_ref())
            .map(|slot| slot.0.clone())
    }

    pub fn role_of(&self, id: ContextId) -> Option<ContextRole> {
        self.contexts.get(&id).map(|entry| entry.role)
    }

    pub fn record_resync(&mut self) {
        self.stats.resyncs += 1;
    }

    /// A post referencing `id` was handed to the hardware
    pub fn begin_post(&mut self, id: ContextId) {
        if let Some(entry) = self.contexts.get_mut(&id) {
            entry.in_flight += 1;
        }
    }

    /// A post referencing `id` completed
    pub fn end_post(&mut self, id: ContextId) -> Result<()> {
        match self.contexts.get_mut(&id) {
            Some(entry) if entry.in_flight > 0 => {
                entry.in_flight -= 1;
                Ok(())
            }
            Some(_) => Err(RingError::consistency(format!(
                "offload context {} completed more posts than were issued",
                id
            ))),
            None => Err(RingError::consistency(format!(
                "completion for unknown offload context {}",
                id
            ))),
        }
    }

    pub fn in_flight(&self, ctx: OffloadContext) -> u32 {
        self.contexts.get(&ctx.id()).map_or(0, |entry| entry.in_flight)
    }

    /// Retire a context that has no posts in flight
    pub fn release(&mut self, ctx: OffloadContext) -> Result<ReleaseAction> {
        let entry = self.active_entry(ctx)?;
        if entry.in_flight > 0 {
            return Err(RingError::ContextBusy {
                id: ctx.id(),
                in_flight: entry.in_flight,
            });
        }

        let (role, hw, cached) = (entry.role, entry.hw, entry.cached);
        self.contexts.remove(&ctx.id());
        self.stats.released += 1;
        *self.live_counter(role) -= 1;
        debug!("Released {:?} offload context {}", role, ctx.id());

        if cached {
            self.tir_cache.push(hw);
            self.stats.cached_tirs = self.tir_cache.len() as u32;
            Ok(ReleaseAction::Cached)
        } else {
            Ok(ReleaseAction::Destroy(hw))
        }
    }

    /// Contexts currently tracked
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Hardware objects to destroy when the ring goes away
    pub fn drain_hw_objects(&mut self) -> Vec<HwContextId> {
        if !self.is_empty() {
            warn!("{} offload contexts still active at teardown", self.len());
        }
        let mut hw: Vec<HwContextId> = self.contexts.values().map(|entry| entry.hw).collect();
        hw.append(&mut self.tir_cache);
        self.contexts.clear();
        self.stats.cached_tirs = 0;
        hw
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    fn active_entry(&self, ctx: OffloadContext) -> Result<&ContextEntry> {
        match self.contexts.get(&ctx.id()) {
            Some(entry) if entry.role != ctx.role() => Err(RingError::invalid_parameter(
                "context",
                format!("context {} is not a {:?} context", ctx.id(), ctx.role()),
            )),
            Some(entry) => Ok(entry),
            None => Err(RingError::StaleContext { id: ctx.id() }),
        }
    }

    fn live_counter(&mut self, role: ContextRole) -> &mut u32 {
        match role {
            ContextRole::TlsTx => &mut self.stats.tls_tx_contexts,
            ContextRole::TlsRx => &mut self.stats.tls_rx_contexts,
            ContextRole::NvmeTx => &mut self.stats.nvme_contexts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_role() {
        let manager = OffloadManager::new(OffloadCaps::TLS_TX);
        assert!(manager.ensure_supported(ContextRole::TlsTx).is_ok());
        assert!(matches!(
            manager.ensure_supported(ContextRole::TlsRx),
            Err(RingError::OffloadUnsupported { feature: "tls rx" })
        ));
    }

    #[test]
    fn test_busy_then_stale() {
        let mut manager = OffloadManager::new(OffloadCaps::all());
        let ctx = manager.register(ContextRole::TlsTx, 7, false);
        manager.begin_post(ctx.id());

        let err = manager.release(ctx).unwrap_err();
        assert!(matches!(err, RingError::ContextBusy { in_flight: 1, .. }));

        manager.end_post(ctx.id()).unwrap();
        assert_eq!(manager.release(ctx).unwrap(), ReleaseAction::Destroy(7));
        assert!(matches!(
            manager.lookup(ctx),
            Err(RingError::StaleContext { .. })
        ));
        assert!(matches!(
            manager.release(ctx),
            Err(RingError::StaleContext { .. })
        ));
        assert_eq!(manager.stats().tls_tx_contexts, 0);
    }

    #[test]
    fn test_cached_tir_is_reused() {
        let mut manager = OffloadManager::new(OffloadCaps::all());
        let ctx = manager.register(ContextRole::TlsRx, 11, true);
        assert_eq!(manager.release(ctx).unwrap(), ReleaseAction::Cached);
        assert_eq!(manager.stats().cached_tirs, 1);
        assert_eq!(manager.take_cached_tir(), Some(11));
        assert_eq!(manager.take_cached_tir(), None);
    }

    #[test]
    fn test_release_drops_table_entry() {
        let mut manager = OffloadManager::new(OffloadCaps::all());
        for round in 0..1000u32 {
            let ctx = manager.register(ContextRole::TlsTx, round, false);
            manager.release(ctx).unwrap();
        }
        assert!(manager.is_empty());
        assert_eq!(manager.stats().released, 1000);

        let ctx = manager.register(ContextRole::TlsRx, 5, false);
        assert_eq!(manager.len(), 1);
        manager.release(ctx).unwrap();
        assert!(matches!(
            manager.lookup(ctx),
            Err(RingError::StaleContext { .. })
        ));
    }

    #[test]
    fn test_end_post_underflow_is_violation() {
        let mut manager = OffloadManager::new(OffloadCaps::all());
        let ctx = manager.register(ContextRole::NvmeTx, 3, false);
        assert!(manager.end_post(ctx.id()).unwrap_err().is_fatal());
    }
}
