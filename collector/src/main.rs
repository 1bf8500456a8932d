//! Main entry point for the grid collector

use clap::Parser;
use common::logging::setup_logger;
use common::{Config, Result, TelemetryError, WireProfile};
use grid_collector::{default_worker_threads, AggregatorConfig, IngestionServer, ServerConfig};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::time::Duration;

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════════╗
║                                                       ║
║    Smart Grid Collector v0.1.0                        ║
║    Secure meter telemetry ingestion                   ║
║                                                       ║
╚═══════════════════════════════════════════════════════╝
"#;

#[derive(Parser)]
#[command(about = "Smart grid telemetry collector")]
struct Args {
    /// Port to listen on (default: GRID_PORT or 8890)
    #[arg(short, long)]
    port: Option<u16>,

    /// Expected number of devices
    #[arg(short, long, default_value = "100")]
    devices: usize,

    /// Sum every N readings (default: device count)
    #[arg(short, long)]
    sum_interval: Option<usize>,

    /// Stop after N readings and write metrics (0 disables)
    #[arg(long, default_value = "0")]
    benchmark_readings: u64,

    /// Stop after N power summations and write metrics (0 disables)
    #[arg(long, default_value = "0")]
    benchmark_sums: u64,

    /// Write the JSON metrics artifact to FILE
    #[arg(long, value_name = "FILE")]
    metrics: Option<PathBuf>,

    /// Worker threads (default: min(2 x CPUs, 120))
    #[arg(short, long)]
    threads: Option<usize>,

    /// Suppress periodic progress logs
    #[arg(short, long)]
    quiet: bool,

    /// Payload profile: compact, compact-random-iv or json
    #[arg(long)]
    profile: Option<WireProfile>,

    /// Seconds a connection may stay silent before it is closed
    #[arg(long)]
    read_timeout: Option<f64>,
}

fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(LevelFilter::Info);
    println!("{}", BANNER);

    let env = Config::load()?;
    let threads = args.threads.filter(|&t| t > 0).unwrap_or_else(default_worker_threads);

    let mut aggregator = AggregatorConfig::new(args.devices);
    if let Some(interval) = args.sum_interval.filter(|&n| n > 0) {
        aggregator.sum_interval = interval;
    }
    aggregator.benchmark_target = non_zero(args.benchmark_readings);
    aggregator.benchmark_sum_target = non_zero(args.benchmark_sums);
    aggregator.quiet = args.quiet;

    let config = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: args.port.unwrap_or(env.port),
        profile: args.profile.unwrap_or(env.profile),
        read_timeout: args
            .read_timeout
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(env.read_timeout),
        metrics_path: args.metrics,
        aggregator,
    };

    info!(
        "Configuration: Port={}, Devices={}, Sum Interval={}, Threads={}",
        config.port, config.aggregator.expected_devices, config.aggregator.sum_interval, threads
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = IngestionServer::bind(config).await?;
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        match server.serve_with_shutdown(shutdown).await? {
            Some(metrics) => info!(
                "Run finished: {} readings, {} sums, {:.2} readings/sec",
                metrics.total_readings, metrics.total_sums, metrics.throughput_rps
            ),
            None => info!("Server shut down"),
        }
        Ok::<(), TelemetryError>(())
    })
}
