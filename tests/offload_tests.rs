//! Offload context tests
//! TLS transmit/receive and storage protocol contexts driven through a ring

use std::sync::{Arc, Mutex};

use nicring::{
    hw::OffloadWork,
    offload::{AuthState, TrackerState},
    ContextRole, OffloadCaps, OffloadContext, OffloadEvent, Packet, Ring, RingConfigBuilder,
    RingError, RxCallback, SimConfig, SimNic, TlsInfo, TxAttributes,
};

fn offload_ring(nic: &SimNic) -> Ring {
    let config = RingConfigBuilder::new("offload-test", 40)
        .tx_depth(32)
        .rx_depth(4)
        .rx_pool(nicring::BufferPoolConfig::new("rx").with_capacity(8))
        .build()
        .unwrap();
    Ring::new(config, nic, nic.device()).unwrap()
}

fn tls_info(rec_seq: u64) -> TlsInfo {
    TlsInfo {
        tls_version: 0x0303,
        cipher: 0x009c,
        key: vec![0x11; 16],
        iv: [0x22; 8],
        salt: [0x33; 4],
        rec_seq,
    }
}

fn recording_callback() -> (RxCallback, Arc<Mutex<Vec<(OffloadContext, OffloadEvent)>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: RxCallback = Arc::new(move |ctx: OffloadContext, event: OffloadEvent| {
        sink.lock().unwrap().push((ctx, event));
    });
    (callback, events)
}

#[cfg(test)]
mod offload_tests {
    use super::*;

    /// Test: a context in use cannot be released; a released one is stale
    #[test]
    fn tls_tx_busy_then_stale() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        assert!(ring.is_tls_tx_supported());

        let ctx = ring.tls_setup_tx(&tls_info(1)).unwrap();
        assert_eq!(ctx.role(), ContextRole::TlsTx);
        assert_eq!(nic.live_contexts(), 1);
        assert_eq!(ring.offload_in_flight(ctx), 0);
        assert!(matches!(
            nic.take_offload_log().as_slice(),
            [OffloadWork::TlsSetupTx { .. }]
        ));

        nic.set_auto_complete(false);
        ring.send(Packet::Bytes(&[9u8; 200]), TxAttributes::empty(), Some(ctx))
            .unwrap();
        assert_eq!(ring.offload_in_flight(ctx), 1);
        assert!(matches!(
            ring.tls_release_tis(ctx),
            Err(RingError::ContextBusy { in_flight: 1, .. })
        ));

        // Release harvests the completion itself before checking
        nic.complete_tx(usize::MAX);
        ring.tls_release_tis(ctx).unwrap();
        assert_eq!(nic.live_contexts(), 0);

        let borrowed = ring.tx_pool().borrowed();
        assert!(matches!(
            ring.send(Packet::Bytes(&[9u8; 200]), TxAttributes::empty(), Some(ctx)),
            Err(RingError::StaleContext { .. })
        ));
        assert_eq!(ring.tx_pool().borrowed(), borrowed);
        assert_eq!(ring.credits(), 32);
        assert!(matches!(
            ring.tls_resync_tx(ctx, &tls_info(2), false),
            Err(RingError::StaleContext { .. })
        ));
        assert!(!ring.is_faulted());
    }

    /// Test: resync and record dump post on the send queue
    #[test]
    fn tls_tx_resync_and_dump() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        let ctx = ring.tls_setup_tx(&tls_info(1)).unwrap();
        nic.take_offload_log();

        ring.tls_resync_tx(ctx, &tls_info(7), true).unwrap();
        ring.tls_tx_post_dump(Some(ctx), b"record bytes", true).unwrap();
        ring.tls_tx_post_dump(None, b"more", false).unwrap();

        let log = nic.take_offload_log();
        assert!(matches!(
            log.as_slice(),
            [
                OffloadWork::TlsResyncTx { skip_static: true, .. },
                OffloadWork::Dump { ctx: Some(_), first: true, len: 12, .. },
                OffloadWork::Dump { ctx: None, first: false, len: 4, .. },
            ]
        ));
        assert_eq!(ring.offload_stats().resyncs, 1);
        assert_eq!(ring.tx_pool().borrowed(), 0);

        assert!(matches!(
            ring.tls_tx_post_dump(Some(ctx), &[], true),
            Err(RingError::InvalidParameter { .. })
        ));
        ring.tls_release_tis(ctx).unwrap();
    }

    /// Test: receive setup, resync and progress queries report through the callback
    #[test]
    fn tls_rx_callbacks() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        let (callback, events) = recording_callback();

        let ctx = ring.tls_create_tir(false).unwrap();
        assert_eq!(ctx.role(), ContextRole::TlsRx);
        ring.tls_setup_rx(ctx, &tls_info(0), 1000, callback).unwrap();
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[(ctx, OffloadEvent::SetupComplete)]
        );

        ring.tls_get_progress_params_rx(ctx).unwrap();
        ring.tls_resync_rx(ctx, &tls_info(3), 2000).unwrap();
        ring.tls_get_progress_params_rx(ctx).unwrap();

        let recorded: Vec<OffloadEvent> = events.lock().unwrap().iter().map(|(_, e)| *e).collect();
        assert_eq!(recorded.len(), 4);
        match recorded[1] {
            OffloadEvent::ProgressParams(params) => {
                assert_eq!(params.hw_resync_tcp_sn, 1000);
                assert_eq!(params.tracker_state, TrackerState::Tracking);
                assert_eq!(params.auth_state, AuthState::NoOffload);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(recorded[2], OffloadEvent::ResyncComplete);
        assert!(matches!(
            recorded[3],
            OffloadEvent::ProgressParams(params) if params.hw_resync_tcp_sn == 2000
        ));
        assert_eq!(ring.tx_pool().borrowed(), 0);

        ring.tls_release_tir(ctx).unwrap();
        assert_eq!(nic.live_contexts(), 0);
    }

    /// Test: a cached receive context keeps its hardware object for reuse
    #[test]
    fn cached_tir_is_reused() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);

        let first = ring.tls_create_tir(true).unwrap();
        ring.tls_release_tir(first).unwrap();
        assert_eq!(nic.live_contexts(), 1);
        assert_eq!(ring.offload_stats().cached_tirs, 1);

        let second = ring.tls_create_tir(true).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(nic.live_contexts(), 1);
        assert_eq!(ring.offload_stats().cached_tirs, 0);
    }

    /// Test: contexts are bound to their role
    #[test]
    fn role_mismatch_is_rejected() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        let tir = ring.tls_create_tir(false).unwrap();

        assert!(matches!(
            ring.tls_release_tis(tir),
            Err(RingError::InvalidParameter { .. })
        ));
        assert!(matches!(
            ring.send(Packet::Bytes(b"x"), TxAttributes::empty(), Some(tir)),
            Err(RingError::InvalidParameter { .. })
        ));
        ring.release_offload(tir).unwrap();
    }

    /// Test: storage protocol contexts
    #[test]
    fn nvme_context_lifecycle() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        assert!(ring.supported_nvme_features().contains(OffloadCaps::NVME_CRC_TX));

        let ctx = ring.nvme_create_tis(OffloadCaps::NVME_CRC_TX).unwrap();
        ring.nvme_set_static_context(ctx, 0x5).unwrap();
        ring.nvme_set_progress_context(ctx, 42).unwrap();
        assert!(matches!(
            nic.take_offload_log().as_slice(),
            [
                OffloadWork::NvmeStatic { config: 0x5, .. },
                OffloadWork::NvmeProgress { tcp_seqno: 42, .. },
            ]
        ));
        assert_eq!(ring.offload_stats().nvme_contexts, 1);
        ring.release_offload(ctx).unwrap();
        assert_eq!(ring.offload_stats().nvme_contexts, 0);
    }

    /// Test: a device without offloads refuses every context
    #[test]
    fn unsupported_device_refuses_contexts() {
        let mut config = SimConfig::default();
        config.capabilities.offloads = OffloadCaps::empty();
        let nic = SimNic::new(config);
        let ring = offload_ring(&nic);

        assert!(!ring.is_tls_tx_supported());
        assert!(!ring.is_tls_rx_supported());
        assert!(matches!(
            ring.tls_setup_tx(&tls_info(1)),
            Err(RingError::OffloadUnsupported { .. })
        ));
        assert!(matches!(
            ring.tls_create_tir(false),
            Err(RingError::OffloadUnsupported { .. })
        ));
        assert!(matches!(
            ring.nvme_create_tis(OffloadCaps::NVME_CRC_TX),
            Err(RingError::OffloadUnsupported { .. })
        ));
        assert_eq!(nic.live_contexts(), 0);
    }

    /// Test: contexts left open are destroyed with the ring
    #[test]
    fn teardown_destroys_open_contexts() {
        let nic = SimNic::default();
        let ring = offload_ring(&nic);
        ring.tls_setup_tx(&tls_info(1)).unwrap();
        ring.tls_create_tir(false).unwrap();
        assert_eq!(nic.live_contexts(), 2);
        drop(ring);
        assert_eq!(nic.live_contexts(), 0);
    }
}
