//! flowtrace - In-band flow tracing pipeline
//!
//! Runs a sampler and a chain of relays over synthetic traffic, drains
//! the reports they emit, evaluates path queries and exports metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run for 30 seconds through three relays and export to JSON
//! ./flowtrace --duration 30 --output trace.json
//!
//! # Check observed paths against a policy and keep every edge row
//! ./flowtrace --policy paths.policy --rows-output rows.jsonl
//!
//! # Load the pipeline from a file and export to Prometheus format
//! ./flowtrace --config pipeline.json --format prometheus --output trace.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use flowtrace_collector::{
    collector::ReportCollector,
    events::ReportDrainer,
    exporter::ExporterType,
    policy::{PathAnalyzer, Policy},
    store::EdgeStore,
    topology::{Topology, TopologyLoader},
    traffic::TrafficGenerator,
    types::TraceMetrics,
};
use flowtrace_common::constants::{BURST_SIZE, DEFAULT_COMMIT_THRESHOLD, IPPROTO_TCP};
use flowtrace_dataplane::codec::max_payload_len;
use log::{info, warn};
use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tokio::{
    signal,
    sync::Mutex,
    time::{sleep, Instant},
};

/// In-band flow tracing through a sampler and relay chain
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Duration to run the pipeline (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 10)]
    duration: u64,

    /// Output file for metrics
    #[clap(short, long, default_value = "flowtrace-metrics.json")]
    output: PathBuf,

    /// Output format (json, prometheus, influx)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Pipeline configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path policy with expected connections and path queries
    #[clap(short, long)]
    policy: Option<PathBuf>,

    /// Write committed edge rows to this file (JSON lines)
    #[clap(long)]
    rows_output: Option<PathBuf>,

    /// Relays to create when the configuration names none
    #[clap(long, default_value_t = 3)]
    relays: u32,

    /// Distinct flows in the synthetic traffic
    #[clap(long, default_value_t = 1024)]
    flows: usize,

    /// Payload bytes per generated packet
    #[clap(long, default_value_t = 64)]
    payload_len: usize,

    /// Packets per batch
    #[clap(long, default_value_t = BURST_SIZE)]
    batch_size: usize,

    /// Seed for traffic and sampling
    #[clap(long)]
    seed: Option<u64>,

    /// Packets marked per flow before sampling thins out
    #[clap(long)]
    sample_target: Option<u64>,

    /// Rows buffered before each commit
    #[clap(long, default_value_t = DEFAULT_COMMIT_THRESHOLD)]
    commit_threshold: usize,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    info!("Starting flowtrace...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output);
    info!("   Format: {}", args.format);

    if args.batch_size == 0 {
        anyhow::bail!("Batch size must be >= 1");
    }
    if args.payload_len > max_payload_len(IPPROTO_TCP) {
        anyhow::bail!(
            "Payload length must be <= {} bytes",
            max_payload_len(IPPROTO_TCP)
        );
    }

    let export_format = ExporterType::from_str(&args.format)?;

    // Build the pipeline
    let mut loader = TopologyLoader::load(args.config.clone())?.with_default_relays(args.relays);
    if let Some(seed) = args.seed {
        loader.config_mut().sampler.rng_seed = seed;
    }
    if let Some(target) = args.sample_target {
        loader.config_mut().sampler.sample_target = target;
    }
    info!(
        "   Sample target: {} per flow",
        loader.config().sampler.sample_target
    );
    let topology = loader.build()?;
    let transport = topology.transport();

    // Collector side
    let store = match &args.rows_output {
        Some(path) => EdgeStore::with_output(args.commit_threshold, path)?,
        None => EdgeStore::new(args.commit_threshold),
    };
    let analyzer = match &args.policy {
        Some(path) => PathAnalyzer::new(Policy::load(path)?),
        None => PathAnalyzer::default(),
    };
    let collector = Arc::new(Mutex::new(ReportCollector::new(
        Arc::clone(&transport),
        store,
        analyzer,
    )));

    let drainer = ReportDrainer::new(Arc::clone(&collector), Duration::from_millis(1));
    let drain_task = drainer.spawn_drain_task();
    let progress_task = drainer.spawn_progress_reporter(args.progress_interval);

    // Packet path runs on its own thread
    let running = Arc::new(AtomicBool::new(true));
    let traffic =
        TrafficGenerator::new(args.flows, args.seed.unwrap_or(1)).with_payload_len(args.payload_len);
    let worker = spawn_worker(topology, traffic, args.batch_size, Arc::clone(&running))?;

    info!("Tracing flows...");

    let start_time = Instant::now();
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    running.store(false, Ordering::Relaxed);
    let mut topology = tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| anyhow::anyhow!("Packet worker panicked"))?;

    drainer.stop();
    drain_task.await?;
    progress_task.await?;

    let elapsed = start_time.elapsed().as_secs();

    info!("Generating metrics report...");

    let mut metrics = {
        let mut collector = collector.lock().await;
        collector.finish()?;
        collector.generate_metrics(elapsed)
    };
    metrics.sampler = topology.sampler_stats();
    metrics.relays = topology.relay_stats();
    topology.shutdown();

    export_format.exporter(args.output.clone()).export(&metrics)?;
    info!("Metrics written to {:?}", args.output);

    print_summary(&metrics);

    Ok(())
}

/// Start the packet worker
///
/// The worker pushes generated batches through the pipeline until
/// `running` is cleared, then hands the topology back.
fn spawn_worker(
    mut topology: Topology,
    mut traffic: TrafficGenerator,
    batch_size: usize,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<Topology>> {
    thread::Builder::new()
        .name("flowtrace-worker".to_string())
        .spawn(move || {
            let mut batches = 0u64;
            while running.load(Ordering::Relaxed) {
                let mut batch = traffic.next_batch(batch_size);
                topology.process_batch(&mut batch);
                batches += 1;
            }
            info!(
                "Packet worker stopped after {} batches ({} packets)",
                batches,
                traffic.generated()
            );
            topology
        })
        .context("Failed to spawn packet worker")
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        flowtrace - In-band Flow Tracing           ║
║          Sampler / Relay / Collector              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(metrics: &TraceMetrics) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Total reports:      {}", metrics.total_reports);
    info!("  Committed rows:     {}", metrics.committed_rows);
    info!("  Unique flows:       {}", metrics.unique_flows);
    info!("  Duration:           {} seconds", metrics.duration_seconds);

    if let Some(sampler) = &metrics.sampler {
        info!("");
        info!("  Sampler:");
        info!("    packets:   {:>10}", sampler.packets);
        info!("    tracked:   {:>10}", sampler.tracked);
        info!("    marked:    {:>10}", sampler.marked);
        info!("    untracked: {:>10}", sampler.untracked);
        info!("    skipped:   {:>10}", sampler.skipped);
    }

    if !metrics.relays.is_empty() {
        info!("");
        info!("  Relays:");
        for relay in &metrics.relays {
            info!(
                "    hop {:>3}: marked {:>10}  reported {:>10}  dropped {:>8}",
                relay.hop_id, relay.marked, relay.reported, relay.dropped
            );
        }
    }

    info!("");
    info!("  Edges (transit μs):");
    for edge in &metrics.edges {
        info!(
            "    {:>3} -> {:<3} reports {:>10}  p50 {:>10.2}  p99 {:>10.2}",
            edge.from_hop, edge.to_hop, edge.reports, edge.transit_us.p50, edge.transit_us.p99
        );
    }

    if !metrics.query_matches.is_empty() {
        info!("");
        info!("  Path query matches: {}", metrics.query_matches.len());
    }

    if !metrics.unexpected_edges.is_empty() {
        warn!("");
        for edge in &metrics.unexpected_edges {
            warn!("  Unexpected edge: {}", edge);
        }
    }

    info!("");
    info!("============================================");
}
