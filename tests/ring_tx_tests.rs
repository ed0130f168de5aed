//! Transmit path tests
//! Posting, completion harvesting, credits and link state against the software NIC

use std::collections::HashSet;

use nicring::{
    BufferPoolConfig, Packet, QueueKind, Ring, RingConfigBuilder, RingError, SimNic,
    TxAttributes,
};

fn ring_with(nic: &SimNic, tx_depth: u32, poll_budget: usize) -> Ring {
    let config = RingConfigBuilder::new("tx-test", 10)
        .tx_depth(tx_depth)
        .rx_depth(8)
        .tx_pool(
            BufferPoolConfig::new("tx")
                .with_buffer_size(256)
                .with_capacity(2048)
                .with_grow_step(128),
        )
        .rx_pool(BufferPoolConfig::new("rx").with_capacity(16))
        .poll_budget(poll_budget)
        .build()
        .unwrap();
    Ring::new(config, nic, nic.device()).unwrap()
}

#[cfg(test)]
mod ring_tx_tests {
    use super::*;

    /// Test: a down ring rejects sends before touching any buffer
    #[test]
    fn send_on_down_ring_leaves_pool_untouched() {
        let nic = SimNic::default();
        let device = nic.device();
        let ring = ring_with(&nic, 64, 64);

        device.set_up(false);
        assert!(!ring.refresh_link_state());

        let before = ring.tx_pool().stats();
        let result = ring.send(Packet::Bytes(&[1u8; 100]), TxAttributes::empty(), None);
        assert!(matches!(result, Err(RingError::RingDown)));

        let after = ring.tx_pool().stats();
        assert_eq!(before.acquisitions, after.acquisitions);
        assert_eq!(before.borrowed, after.borrowed);
        assert_eq!(nic.pending_tx(), 0);
        assert!(nic.take_sent().is_empty());

        // Harvesting stays available while down
        assert!(ring.drain_and_process().is_ok());
    }

    /// Test: staged completions are harvested in order and every buffer returns once
    #[test]
    fn completions_harvested_in_batches_restore_pool() {
        let nic = SimNic::default();
        nic.set_auto_complete(false);
        let ring = ring_with(&nic, 1024, 1024);
        let mut cursor = ring.sequence(QueueKind::Tx);

        for i in 0..1000u32 {
            let payload = i.to_le_bytes().repeat(16);
            ring.send(Packet::Bytes(&payload), TxAttributes::empty(), None)
                .unwrap();
        }
        assert_eq!(ring.tx_in_flight(), 1000);
        assert_eq!(ring.tx_pool().borrowed(), 1000);
        assert_eq!(ring.credits(), 24);

        for (batch, remaining) in [(400, 600), (400, 200), (200, 0)] {
            assert_eq!(nic.complete_tx(batch), batch);
            let before = cursor;
            assert_eq!(ring.poll_and_process_tx(&mut cursor).unwrap(), batch);
            assert_ne!(cursor, before);
            assert_eq!(ring.tx_pool().borrowed(), remaining);
            assert_eq!(ring.tx_in_flight(), remaining);
        }

        // Nothing left to harvest
        assert_eq!(ring.poll_and_process_tx(&mut cursor).unwrap(), 0);
        assert_eq!(ring.credits(), 1024);

        let pool = ring.tx_pool();
        assert_eq!(pool.free_count(), pool.materialized());
        assert_eq!(pool.stats().releases, 1000);

        let stats = ring.stats();
        assert_eq!(stats.tx_packets, 1000);
        assert_eq!(stats.tx_completions, 1000);

        let sent = nic.take_sent();
        assert_eq!(sent.len(), 1000);
        let unique: HashSet<Vec<u8>> = sent.into_iter().collect();
        assert_eq!(unique.len(), 1000);
    }

    /// Test: running out of credits is transient backpressure, not a failure
    #[test]
    fn credit_exhaustion_is_backpressure() {
        let nic = SimNic::default();
        nic.set_auto_complete(false);
        let ring = ring_with(&nic, 4, 64);

        for _ in 0..4 {
            ring.send(Packet::Bytes(b"frame"), TxAttributes::empty(), None)
                .unwrap();
        }
        let borrowed = ring.tx_pool().borrowed();

        let err = ring
            .send(Packet::Bytes(b"frame"), TxAttributes::empty(), None)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!err.is_fatal());
        assert_eq!(ring.tx_pool().borrowed(), borrowed);
        assert_eq!(ring.stats().tx_backpressure, 1);

        // Completing one frees a credit for the next send
        nic.complete_tx(1);
        ring.send(Packet::Bytes(b"frame"), TxAttributes::empty(), None)
            .unwrap();
        assert!(!ring.is_faulted());
    }

    /// Test: credits reserved by the caller are withheld from sends
    #[test]
    fn reserved_credits_round_trip() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 8, 64);

        assert!(ring.credits_get(6));
        assert_eq!(ring.credits(), 2);
        assert!(!ring.credits_get(3));
        ring.credits_return(6).unwrap();
        assert_eq!(ring.credits(), 8);
    }

    /// Test: small payloads can travel inline without buffers
    #[test]
    fn inline_send_uses_no_buffers() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 16, 64);

        ring.send(Packet::Bytes(b"inline"), TxAttributes::INLINE, None)
            .unwrap();
        assert_eq!(ring.tx_pool().stats().acquisitions, 0);
        assert_eq!(nic.take_sent(), vec![b"inline".to_vec()]);
    }

    /// Test: caller-filled buffers are sent and returned on completion
    #[test]
    fn caller_filled_buffers_return_on_completion() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 16, 64);
        let mut cursor = ring.sequence(QueueKind::Tx);

        let mut buffers = ring.acquire_tx_buffers(2, false).unwrap();
        buffers[0].fill(b"head-").unwrap();
        buffers[1].fill(b"tail").unwrap();
        ring.send(Packet::Buffers(buffers), TxAttributes::empty(), None)
            .unwrap();

        assert_eq!(nic.take_sent(), vec![b"head-tail".to_vec()]);
        assert_eq!(ring.poll_and_process_tx(&mut cursor).unwrap(), 1);
        assert_eq!(ring.tx_pool().borrowed(), 0);
    }

    /// Test: zero-copy completions are reported per user context
    #[test]
    fn zero_copy_completions_are_reported() {
        let nic = SimNic::default();
        nic.set_auto_complete(false);
        let ring = ring_with(&nic, 16, 64);
        let mut cursor = ring.sequence(QueueKind::Tx);

        for zc in [11u64, 12] {
            let mut buffers = ring.acquire_zc_buffers(1, false).unwrap();
            buffers[0].fill(b"zero-copy").unwrap();
            buffers[0].set_zc_context(Some(zc));
            ring.send(Packet::Buffers(buffers), TxAttributes::empty(), None)
                .unwrap();
        }

        // The second user context goes away before its send completes
        assert_eq!(ring.reset_inflight_zc_context(12), 1);

        nic.complete_tx(usize::MAX);
        assert_eq!(ring.poll_and_process_tx(&mut cursor).unwrap(), 2);
        assert_eq!(ring.take_zc_completions(), vec![11]);
        assert!(ring.take_zc_completions().is_empty());
        assert_eq!(ring.zc_pool().borrowed(), 0);
    }

    /// Test: features the device lacks are refused up front
    #[test]
    fn unsupported_features_are_refused() {
        let mut config = nicring::SimConfig::default();
        config.capabilities.tso.supported = false;
        config.capabilities.dummy_send = false;
        config.capabilities.rate_limit = false;
        let nic = SimNic::new(config);
        let ring = ring_with(&nic, 16, 64);

        assert!(matches!(
            ring.send(Packet::Bytes(&[0u8; 64]), TxAttributes::TSO, None),
            Err(RingError::Unsupported { feature: "tso" })
        ));
        assert!(matches!(
            ring.send(Packet::Bytes(&[]), TxAttributes::DUMMY, None),
            Err(RingError::Unsupported { .. })
        ));
        assert!(matches!(
            ring.modify_rate_limit(Default::default()),
            Err(RingError::Unsupported { .. })
        ));
        assert_eq!(ring.max_payload_size(), 1500);
    }

    /// Test: link transitions and large receive capabilities
    #[test]
    fn restart_and_lro_capabilities() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 16, 64);

        let lro = ring.lro_caps();
        assert!(lro.supported);
        assert_eq!(lro.timer_periods, [8, 16, 32, 1024]);

        ring.stop_active();
        assert!(!ring.is_up());
        let restarted: Result<(), RingError> = ring.start_active();
        assert!(restarted.is_ok());
        assert!(ring.is_up());
        ring.send(Packet::Bytes(b"after restart"), TxAttributes::empty(), None)
            .unwrap();
    }

    /// Test: a hardware post rejection hands the buffers back
    #[test]
    fn rejected_post_releases_buffers() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 16, 64);

        nic.fail_next_post(nicring::HwError::InvalidDescriptor("bad".into()));
        let err = ring
            .send(Packet::Bytes(&[3u8; 300]), TxAttributes::empty(), None)
            .unwrap_err();
        assert!(matches!(err, RingError::HardwareRejected { transient: false, .. }));
        assert_eq!(ring.tx_pool().borrowed(), 0);
        assert_eq!(ring.credits(), 16);
        assert!(!ring.is_faulted());
    }

    /// Test: a fence and rate limit go straight to the send queue
    #[test]
    fn fence_and_rate_limit() {
        let nic = SimNic::default();
        let ring = ring_with(&nic, 16, 64);
        let mut cursor = ring.sequence(QueueKind::Tx);

        ring.post_nop_fence().unwrap();
        assert_eq!(ring.poll_and_process_tx(&mut cursor).unwrap(), 1);

        let limit = nicring::RateLimit {
            rate_kbps: 10_000,
            max_burst_bytes: 64 * 1024,
            typical_packet_size: 1500,
        };
        ring.modify_rate_limit(limit).unwrap();
        assert_eq!(nic.rate_limit(), Some(limit));

        let lkey = ring.tx_user_lkey(0x10_0000, 4096).unwrap();
        assert_eq!(ring.tx_user_lkey(0x10_0000, 4096).unwrap(), lkey);
        assert_ne!(lkey, ring.tx_lkey());
    }
}
