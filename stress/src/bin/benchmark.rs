//! Throughput sweep: for each device count, run an in-process collector with
//! a reading target, drive it with the bulk simulator, and report what the
//! collector wrote to its metrics artifact.

use clap::Parser;
use common::logging::setup_logger;
use common::{parse_seconds, Result, TelemetryError, WireProfile};
use device::{BulkSimulator, SimulatorConfig, TransportConfig};
use grid_collector::{read_metrics, AggregatorConfig, IngestionServer, ServerConfig};
use log::{info, warn, LevelFilter};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(about = "Smart grid benchmark harness")]
struct Args {
    #[arg(long, default_value = "100")]
    min_devices: usize,

    #[arg(long, default_value = "1000")]
    max_devices: usize,

    #[arg(long, default_value = "100")]
    step: usize,

    /// Trials per device count
    #[arg(long, default_value = "1")]
    trials: usize,

    /// Client reporting interval in seconds
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    interval: Duration,

    /// Collector port; 0 picks a free port per trial
    #[arg(long, default_value = "0")]
    port: u16,

    /// Collector stops after this many readings
    #[arg(long, default_value = "100000")]
    target_readings: u64,

    #[arg(long, default_value = "100")]
    batch_size: usize,

    #[arg(long, default_value = "25")]
    chunk_size: usize,

    #[arg(long, default_value = "50")]
    concurrency: usize,

    #[arg(long, default_value = "compact")]
    profile: WireProfile,

    /// Directory for per-trial metrics artifacts
    #[arg(long, default_value = "metrics")]
    metrics_dir: PathBuf,

    /// Give up on a trial after this many seconds
    #[arg(long, default_value = "600")]
    trial_timeout: u64,

    /// Write all results as JSON to FILE
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Suppress periodic collector logs
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Clone, Serialize)]
struct TrialResult {
    devices: usize,
    trial: usize,
    seconds: f64,
    throughput_rps: f64,
    total_readings: u64,
    target: u64,
}

async fn run_trial(args: &Args, devices: usize, trial: usize) -> Result<TrialResult> {
    let metrics_path = args
        .metrics_dir
        .join(format!("metrics_{}_{}.json", devices, trial));
    if metrics_path.exists() {
        std::fs::remove_file(&metrics_path)?;
    }

    let mut aggregator = AggregatorConfig::new(devices);
    aggregator.sum_interval = (devices / 10).max(10);
    aggregator.benchmark_target = Some(args.target_readings);
    aggregator.quiet = args.quiet;

    let server = IngestionServer::bind(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: args.port,
        profile: args.profile,
        metrics_path: Some(metrics_path.clone()),
        aggregator,
        ..ServerConfig::default()
    })
    .await?;
    let port = server.local_addr()?.port();
    let collector = tokio::spawn(server.serve());

    let simulator = BulkSimulator::new(SimulatorConfig {
        num_devices: devices,
        interval: args.interval,
        batch_size: args.batch_size,
        profile: args.profile,
        duration: None,
        safety: true,
        transport: TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            chunk_size: args.chunk_size,
            concurrency_limit: args.concurrency,
            ..TransportConfig::default()
        },
    })
    .await?;

    let (stop_clients, clients_stopped) = oneshot::channel::<()>();
    let clients = tokio::spawn(async move {
        simulator
            .run_until(async move {
                let _ = clients_stopped.await;
            })
            .await
    });

    let finished = tokio::time::timeout(Duration::from_secs(args.trial_timeout), collector).await;
    let _ = stop_clients.send(());
    match clients.await? {
        Ok(summary) => info!(
            "Clients sent {} readings in {} cycles",
            summary.messages_sent, summary.cycles
        ),
        Err(e) => warn!("Simulator ended with error: {}", e),
    }

    match finished {
        Ok(joined) => {
            joined??;
        }
        Err(_) => {
            return Err(TelemetryError::InternalError(format!(
                "collector did not reach {} readings within {}s",
                args.target_readings, args.trial_timeout
            )))
        }
    }

    // The artifact on disk is the only source of results.
    let metrics = read_artifact(&metrics_path).await?;
    Ok(TrialResult {
        devices,
        trial,
        seconds: metrics.seconds,
        throughput_rps: metrics.throughput_rps,
        total_readings: metrics.total_readings,
        target: metrics.benchmark_target,
    })
}

async fn read_artifact(path: &Path) -> Result<common::RunMetrics> {
    read_metrics(path).await.map_err(|e| {
        TelemetryError::InternalError(format!(
            "Metrics file {} not readable ({}). Did the collector exit early?",
            path.display(),
            e
        ))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger(LevelFilter::Info);
    let args = Args::parse();

    if args.step == 0 || args.min_devices == 0 || args.min_devices > args.max_devices {
        return Err(TelemetryError::ConfigError(
            "need 0 < min-devices <= max-devices and step > 0".to_string(),
        ));
    }
    std::fs::create_dir_all(&args.metrics_dir)?;

    let mut results = Vec::new();
    for devices in (args.min_devices..=args.max_devices).step_by(args.step) {
        for trial in 1..=args.trials {
            println!(
                "Running: devices={}, trial={}/{} ...",
                devices, trial, args.trials
            );
            let result = run_trial(&args, devices, trial).await?;
            println!(
                "  -> {:.2} rps, {:.3}s for {} readings",
                result.throughput_rps, result.seconds, result.total_readings
            );
            results.push(result);
        }
    }

    println!("\nSummary:");
    for r in &results {
        println!(
            "devices={:6}  throughput={:10.2} rps  time={:8.3}s  readings={}",
            r.devices, r.throughput_rps, r.seconds, r.total_readings
        );
    }

    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_vec_pretty(&results)?)?;
        info!("Results written to {}", path.display());
    }

    Ok(())
}
