use clap::{App, Arg, ArgMatches, SubCommand};
use nicring::{
    error::RingError,
    hw::{sim::SimConfig, QueuePairFactory},
    BufferPoolConfig, CqModeration, DeliveryMode, EventCompletion, ModerationConfig, Packet,
    QueueKind, Result, Ring, RingConfigBuilder, SimNic, TxAttributes,
};
use std::{str::FromStr, time::Instant};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("nicring-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("nicring ring engine CLI Tool")
        .subcommand(
            SubCommand::with_name("simulate")
                .about("Run a loopback ring on the software NIC")
                .arg(
                    Arg::with_name("packets")
                        .short("n")
                        .long("packets")
                        .value_name("COUNT")
                        .help("Number of packets to send")
                        .default_value("10000")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .value_name("BYTES")
                        .help("Payload size")
                        .default_value("512")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("batched")
                        .short("b")
                        .long("batched")
                        .help("Deliver received packets as event completions"),
                ),
        )
        .subcommand(
            SubCommand::with_name("moderation")
                .about("Feed a synthetic traffic curve through the moderation engine")
                .arg(
                    Arg::with_name("steps")
                        .short("s")
                        .long("steps")
                        .value_name("STEPS")
                        .help("Number of intervals")
                        .default_value("12")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("peak")
                        .short("p")
                        .long("peak")
                        .value_name("BYTES")
                        .help("Peak bytes per interval")
                        .default_value("268435456")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Show version and software NIC capabilities"),
        )
        .get_matches();

    match matches.subcommand() {
        ("simulate", Some(sim_matches)) => run_simulation(sim_matches),
        ("moderation", Some(mod_matches)) => run_moderation(mod_matches),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .value_of(name)
        .ok_or_else(|| RingError::invalid_parameter(name, "Missing value"))?
        .parse()
        .map_err(|_| RingError::invalid_parameter(name, "Invalid number"))
}

fn run_simulation(matches: &ArgMatches) -> Result<()> {
    let packets: usize = parse_arg(matches, "packets")?;
    let size: usize = parse_arg(matches, "size")?;
    let delivery = if matches.is_present("batched") {
        DeliveryMode::Batched
    } else {
        DeliveryMode::PerConsumer
    };

    let nic = SimNic::new(SimConfig {
        loopback_tag: Some(1),
        ..Default::default()
    });
    let config = RingConfigBuilder::new("cli", 0)
        .tx_depth(1024)
        .rx_depth(512)
        .tx_pool(BufferPoolConfig::new("tx").with_capacity(2048))
        .rx_pool(BufferPoolConfig::new("rx").with_capacity(1024))
        .delivery(delivery)
        .build()?;
    let ring = Ring::new(config, &nic, nic.device())?;

    println!("Simulating {} packets of {} bytes ({:?})", packets, size, delivery);

    let payload = vec![0xa5u8; size];
    let mut tx_cursor = ring.sequence(QueueKind::Tx);
    let mut rx_cursor = ring.sequence(QueueKind::Rx);
    let mut received = 0usize;
    let mut events: Vec<EventCompletion> = Vec::new();
    let mut sink = Vec::new();

    let start = Instant::now();
    for _ in 0..packets {
        if let Err(e) = ring.send(Packet::Bytes(&payload), TxAttributes::BLOCKING, None) {
            if !e.is_transient() {
                return Err(e);
            }
        }
        ring.poll_and_process_tx(&mut tx_cursor)?;

        match delivery {
            DeliveryMode::PerConsumer => {
                received += ring.poll_and_process_rx(&mut rx_cursor, &mut sink)?;
                ring.reclaim_recv_buffers(std::mem::take(&mut sink))?;
            }
            DeliveryMode::Batched => {
                ring.poll_events(&mut events, 64)?;
                for event in events.drain(..) {
                    if let Some(packet) = event.packet {
                        received += packet.num_bufs();
                        ring.reclaim_recv_buffers(packet.buffers)?;
                    }
                }
            }
        }
        if ring.stats().tx_packets % 1024 == 0 {
            ring.adapt_cq_moderation()?;
        }
    }
    ring.drain_and_process()?;
    let elapsed = start.elapsed();

    let stats = ring.stats();
    println!("\nResults:");
    println!("  Packets received: {}", received);
    println!("  Total time: {:.2}ms", elapsed.as_secs_f64() * 1000.0);
    println!("  Packets/sec: {:.0}", packets as f64 / elapsed.as_secs_f64());
    println!("  {}", stats.summary());
    println!("  Moderation: {:?}", ring.moderation_info());
    println!("  Tx pool: {}", ring.tx_pool().stats().summary());
    println!("  Rx pool: {}", ring.rx_pool().stats().summary());
    Ok(())
}

fn run_moderation(matches: &ArgMatches) -> Result<()> {
    let steps: u64 = parse_arg(matches, "steps")?;
    let peak: u64 = parse_arg(matches, "peak")?;

    let config = ModerationConfig::default();
    let interval_ms = config.interval.as_millis();
    let mut moderation = CqModeration::new(config)?;
    let half = (steps / 2).max(1);

    println!("Interval: {}ms", interval_ms);
    println!("{:>6} {:>14} {:>10} {:>8}", "step", "bytes", "period", "count");

    // Ramp up to the peak, back down, then two idle intervals
    for step in 0..steps {
        let bytes = if step < half {
            peak * (step + 1) / half
        } else if step + 2 < steps {
            peak * (steps - step) / half
        } else {
            0
        };
        moderation.observe(bytes / 1024, bytes);
        match moderation.recompute() {
            Some((period, count)) => {
                println!("{:>6} {:>14} {:>10} {:>8}  *", step, bytes, period, count)
            }
            None => {
                let info = moderation.info();
                println!("{:>6} {:>14} {:>10} {:>8}", step, bytes, info.period, info.count)
            }
        }
    }
    Ok(())
}

fn show_info() -> Result<()> {
    println!("nicring Ring Engine");
    println!("Version: {}", nicring::VERSION);

    let caps = SimNic::default().capabilities();
    println!("\nSoftware NIC capabilities:");
    println!("  Max inline data: {} bytes", caps.max_inline_bytes);
    println!("  Max send SGEs: {}", caps.max_send_sge);
    println!(
        "  TSO: {} (payload {}, header {})",
        caps.tso.supported, caps.tso.max_payload, caps.tso.max_header
    );
    println!("  LRO: {} (max payload {})", caps.lro.supported, caps.lro.max_payload);
    println!("  Offloads: {:?}", caps.offloads);
    println!("  Dummy send: {}", caps.dummy_send);
    println!("  Rate limit: {}", caps.rate_limit);

    println!("\nDefaults:");
    println!("  Rx buffer size: {}", nicring::config::DEFAULT_RX_BUFFER_SIZE);
    println!("  Poll budget: {}", nicring::config::DEFAULT_POLL_BUDGET);

    Ok(())
}
