//! Offload context operations
//!
//! Every operation here runs under the transmit lock because context setup,
//! resync and queries post work on the shared send queue. Once the mutation
//! is posted the transmit completion queue is polled once so the work
//! completes without waiting for the next scheduled poll.

use log::{debug, info};

use crate::error::{Result, RingError};
use crate::hw::{OffloadCaps, OffloadKind, OffloadWork, TlsInfo};
use crate::offload::{
    ContextRole, OffloadContext, OffloadStats, ReleaseAction, RxCallback, TlsProgressParams,
};

use super::tx::{OffloadOp, TxDomain};
use super::Ring;

impl Ring {
    /// Offload capabilities advertised by the device at construction
    pub fn offload_caps(&self) -> OffloadCaps {
        self.caps.offloads
    }

    pub fn is_tls_tx_supported(&self) -> bool {
        self.caps.offloads.contains(OffloadCaps::TLS_TX)
    }

    pub fn is_tls_rx_supported(&self) -> bool {
        self.caps.offloads.contains(OffloadCaps::TLS_RX)
    }

    /// Whether key updates can be synchronized with the device
    pub fn is_tls_sync_dek_supported(&self) -> bool {
        self.caps.offloads.contains(OffloadCaps::TLS_SYNC_DEK)
    }

    // ---- TLS transmit ----

    /// Allocate a transmit TLS context and program its crypto state
    pub fn tls_setup_tx(&self, info: &TlsInfo) -> Result<OffloadContext> {
        let ctx = self.offload_op(true, |tx| {
            tx.offload.ensure_supported(ContextRole::TlsTx)?;
            let hw = tx.send.create_context(OffloadKind::TlsTx)?;
            let ctx = tx.offload.register(ContextRole::TlsTx, hw, false);
            let work = OffloadWork::TlsSetupTx {
                ctx: hw,
                info: info.clone(),
            };
            if let Err(e) = self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::Other) {
                Self::roll_back(tx, ctx);
                return Err(e);
            }
            Ok(ctx)
        })?;
        info!("Ring {} set up TLS tx context {}", self.id(), ctx.id());
        Ok(ctx)
    }

    /// Move a transmit context to a new record sequence
    ///
    /// `skip_static` keeps the static parameters and only reposts progress.
    pub fn tls_resync_tx(&self, ctx: OffloadContext, info: &TlsInfo, skip_static: bool) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsTx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            let work = OffloadWork::TlsResyncTx {
                ctx: hw,
                info: info.clone(),
                skip_static,
            };
            self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::Other)?;
            tx.offload.record_resync();
            Ok(())
        })
    }

    /// Post record data the device needs to rebuild its crypto state
    pub fn tls_tx_post_dump(&self, ctx: Option<OffloadContext>, data: &[u8], first: bool) -> Result<()> {
        if let Some(ctx) = ctx {
            Self::expect_role(ctx, ContextRole::TlsTx)?;
        }
        if data.is_empty() || data.len() > self.tx_pool.config().buffer_size {
            return Err(RingError::invalid_parameter(
                "data",
                format!("dump of {} bytes does not fit one buffer", data.len()),
            ));
        }
        self.offload_op(true, |tx| {
            let hw = ctx.map(|ctx| tx.offload.lookup(ctx)).transpose()?;
            let mut buffer = self
                .tx_pool
                .acquire(1, false)?
                .pop()
                .ok_or_else(|| RingError::exhausted(1, 0))?;
            buffer.fill(data)?;
            let work = OffloadWork::Dump {
                ctx: hw,
                addr: buffer.addr(),
                len: buffer.len() as u32,
                lkey: self.caps.tx_lkey,
                first,
            };
            self.post_work_locked(tx, work, ctx.map(|c| c.id()), Some(buffer), OffloadOp::Other)?;
            Ok(())
        })
    }

    /// Release a transmit TLS context; fails while sends still reference it
    pub fn tls_release_tis(&self, ctx: OffloadContext) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsTx)?;
        self.release_offload(ctx)
    }

    // ---- TLS receive ----

    /// Allocate a receive TLS context, reusing a parked one when `cached`
    pub fn tls_create_tir(&self, cached: bool) -> Result<OffloadContext> {
        let ctx = self.offload_op(true, |tx| {
            tx.offload.ensure_supported(ContextRole::TlsRx)?;
            let reused = if cached { tx.offload.take_cached_tir() } else { None };
            let hw = match reused {
                Some(hw) => hw,
                None => tx.send.create_context(OffloadKind::TlsRx)?,
            };
            Ok(tx.offload.register(ContextRole::TlsRx, hw, cached))
        })?;
        debug!("Ring {} created TLS rx context {}", self.id(), ctx.id());
        Ok(ctx)
    }

    /// Program a receive context; `callback` reports hardware completion
    pub fn tls_setup_rx(
        &self,
        ctx: OffloadContext,
        info: &TlsInfo,
        next_record_tcp_sn: u32,
        callback: RxCallback,
    ) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsRx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            tx.offload.set_callback(ctx, callback)?;
            let work = OffloadWork::TlsSetupRx {
                ctx: hw,
                info: info.clone(),
                next_record_tcp_sn,
            };
            self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::RxSetup)?;
            Ok(())
        })
    }

    /// Tell the device where the next record starts after it lost track
    pub fn tls_resync_rx(&self, ctx: OffloadContext, info: &TlsInfo, hw_resync_tcp_sn: u32) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsRx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            let work = OffloadWork::TlsResyncRx {
                ctx: hw,
                info: info.clone(),
                hw_resync_tcp_sn,
            };
            self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::RxResync)?;
            tx.offload.record_resync();
            Ok(())
        })
    }

    /// Query receive progress; the result arrives through the context callback
    pub fn tls_get_progress_params_rx(&self, ctx: OffloadContext) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsRx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            let mut buffer = self
                .tx_pool
                .acquire(1, false)?
                .pop()
                .ok_or_else(|| RingError::exhausted(1, 0))?;
            buffer.fill(&[0u8; TlsProgressParams::RECORD_LEN])?;
            let work = OffloadWork::TlsProgressQuery {
                ctx: hw,
                addr: buffer.addr(),
                lkey: self.caps.tx_lkey,
            };
            self.post_work_locked(tx, work, Some(ctx.id()), Some(buffer), OffloadOp::ProgressQuery)?;
            Ok(())
        })
    }

    pub fn tls_release_tir(&self, ctx: OffloadContext) -> Result<()> {
        Self::expect_role(ctx, ContextRole::TlsRx)?;
        self.release_offload(ctx)
    }

    // ---- storage protocol ----

    /// Storage protocol offloads this device supports
    pub fn supported_nvme_features(&self) -> OffloadCaps {
        self.caps.offloads
            & (OffloadCaps::NVME_CRC_TX | OffloadCaps::NVME_CRC_RX | OffloadCaps::NVME_ZEROCOPY)
    }

    /// Allocate a storage protocol transmit context for `features`
    pub fn nvme_create_tis(&self, features: OffloadCaps) -> Result<OffloadContext> {
        if !self.supported_nvme_features().contains(features) {
            return Err(RingError::OffloadUnsupported {
                feature: "nvme feature set",
            });
        }
        let ctx = self.offload_op(true, |tx| {
            tx.offload.ensure_supported(ContextRole::NvmeTx)?;
            let hw = tx.send.create_context(OffloadKind::Nvme)?;
            Ok(tx.offload.register(ContextRole::NvmeTx, hw, false))
        })?;
        debug!(
            "Ring {} created nvme context {} ({:?})",
            self.id(),
            ctx.id(),
            features
        );
        Ok(ctx)
    }

    pub fn nvme_set_static_context(&self, ctx: OffloadContext, config: u32) -> Result<()> {
        Self::expect_role(ctx, ContextRole::NvmeTx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            let work = OffloadWork::NvmeStatic { ctx: hw, config };
            self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::Other)?;
            Ok(())
        })
    }

    pub fn nvme_set_progress_context(&self, ctx: OffloadContext, tcp_seqno: u32) -> Result<()> {
        Self::expect_role(ctx, ContextRole::NvmeTx)?;
        self.offload_op(true, |tx| {
            let hw = tx.offload.lookup(ctx)?;
            let work = OffloadWork::NvmeProgress { ctx: hw, tcp_seqno };
            self.post_work_locked(tx, work, Some(ctx.id()), None, OffloadOp::Other)?;
            Ok(())
        })
    }

    // ---- common ----

    /// Release any offload context
    ///
    /// Completions already sitting in the transmit queue are harvested first;
    /// if posts are still in flight afterwards the call fails with
    /// `ContextBusy`. A released context fails every later use with
    /// `StaleContext`.
    pub fn release_offload(&self, ctx: OffloadContext) -> Result<()> {
        self.offload_op(false, |tx| {
            self.process_tx_locked(tx)?;
            match tx.offload.release(ctx)? {
                ReleaseAction::Destroy(hw) => tx.send.destroy_context(hw)?,
                ReleaseAction::Cached => {}
            }
            Ok(())
        })?;
        debug!("Ring {} released {:?} context {}", self.id(), ctx.role(), ctx.id());
        Ok(())
    }

    /// Posts referencing `ctx` that have not completed yet
    pub fn offload_in_flight(&self, ctx: OffloadContext) -> u32 {
        self.lock_tx().offload.in_flight(ctx)
    }

    pub fn offload_stats(&self) -> OffloadStats {
        self.lock_tx().offload.stats()
    }

    /// Run `op` under the transmit lock, then poll the transmit queue once
    fn offload_op<T>(
        &self,
        require_up: bool,
        op: impl FnOnce(&mut TxDomain) -> Result<T>,
    ) -> Result<T> {
        if require_up {
            self.check_postable()?;
        } else {
            self.check_usable()?;
        }
        let mut tx = self.lock_tx();
        let result = op(&mut *tx).and_then(|value| self.process_tx_locked(&mut *tx).map(|_| value));
        self.finish_tx(tx);
        self.guard(result)
    }

    fn expect_role(ctx: OffloadContext, role: ContextRole) -> Result<()> {
        if ctx.role() != role {
            return Err(RingError::invalid_parameter(
                "context",
                format!("context {} is {:?}, expected {:?}", ctx.id(), ctx.role(), role),
            ));
        }
        Ok(())
    }

    /// Undo a context whose setup work could not be posted
    fn roll_back(tx: &mut TxDomain, ctx: OffloadContext) {
        if let Ok(ReleaseAction::Destroy(hw)) = tx.offload.release(ctx) {
            if let Err(e) = tx.send.destroy_context(hw) {
                log::warn!("Failed to destroy context {} after setup failure: {}", hw, e);
            }
        }
    }
}
