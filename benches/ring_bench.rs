use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nicring::{
    hw::sim::SimConfig, BufferKind, BufferPool, BufferPoolConfig, CqModeration, EventFlags,
    EventQueue, ModerationConfig, Packet, QueueKind, Ring, RingConfigBuilder, SimNic,
    TxAttributes,
};

fn benchmark_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool");

    for batch in [1usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(
            BenchmarkId::new("acquire_release", batch),
            batch,
            |b, &batch| {
                let config = BufferPoolConfig::new("bench")
                    .with_buffer_size(2048)
                    .with_capacity(1024)
                    .with_prefill(true);
                let pool = BufferPool::new(config, BufferKind::Tx, 0).unwrap();

                b.iter(|| {
                    let buffers = pool.acquire(batch, false).unwrap();
                    black_box(pool.release(buffers).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn benchmark_send_and_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingTx");

    for size in [64usize, 512, 1500].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("send_poll", size), size, |b, &size| {
            let nic = SimNic::default();
            let config = RingConfigBuilder::new("bench-tx", 1)
                .tx_depth(256)
                .rx_depth(16)
                .build()
                .unwrap();
            let ring = Ring::new(config, &nic, nic.device()).unwrap();
            let payload = vec![0x5au8; size];
            let mut cursor = ring.sequence(QueueKind::Tx);

            b.iter(|| {
                ring.send(Packet::Bytes(&payload), TxAttributes::empty(), None)
                    .unwrap();
                black_box(ring.poll_and_process_tx(&mut cursor).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_loopback_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingRx");
    group.throughput(Throughput::Elements(1));

    group.bench_function("loopback_reclaim", |b| {
        let nic = SimNic::new(SimConfig {
            loopback_tag: Some(7),
            ..Default::default()
        });
        let config = RingConfigBuilder::new("bench-rx", 2)
            .tx_depth(256)
            .rx_depth(256)
            .build()
            .unwrap();
        let ring = Ring::new(config, &nic, nic.device()).unwrap();
        let payload = vec![0u8; 256];
        let mut tx_cursor = ring.sequence(QueueKind::Tx);
        let mut rx_cursor = ring.sequence(QueueKind::Rx);
        let mut sink = Vec::new();

        b.iter(|| {
            ring.send(Packet::Bytes(&payload), TxAttributes::empty(), None)
                .unwrap();
            ring.poll_and_process_tx(&mut tx_cursor).unwrap();
            ring.poll_and_process_rx(&mut rx_cursor, &mut sink).unwrap();
            black_box(ring.reclaim_recv_buffers(std::mem::take(&mut sink)).unwrap());
        });
    });

    group.finish();
}

fn benchmark_event_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("EventQueue");

    for consumers in [1u32, 16, 256].iter() {
        group.bench_with_input(
            BenchmarkId::new("deliver_pop", consumers),
            consumers,
            |b, &consumers| {
                let queue = EventQueue::new();

                b.iter(|| {
                    for consumer in 0..consumers {
                        queue.deliver(consumer, EventFlags::IN, None);
                    }
                    while let Some(record) = queue.pop() {
                        black_box(record);
                    }
                });
            },
        );
    }

    group.finish();
}

fn benchmark_moderation(c: &mut Criterion) {
    let mut group = c.benchmark_group("CqModeration");

    group.bench_function("recompute", |b| {
        let mut moderation = CqModeration::new(ModerationConfig::default()).unwrap();
        let mut bytes = 0u64;

        b.iter(|| {
            bytes = (bytes + 64 * 1024 * 1024) % (2 * 1024 * 1024 * 1024);
            moderation.observe(bytes / 1500, bytes);
            black_box(moderation.recompute());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_buffer_pool,
    benchmark_send_and_complete,
    benchmark_loopback_receive,
    benchmark_event_queue,
    benchmark_moderation
);
criterion_main!(benches);
