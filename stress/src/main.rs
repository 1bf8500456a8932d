use clap::Parser;
use common::logging::setup_logger;
use common::{parse_seconds, Config, Result, WireProfile};
use device::{BulkSimulator, SimulatorConfig, SimulatorStats, SimulatorSummary, TransportConfig};
use log::{error, info, LevelFilter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(about = "Bulk smart grid device simulator")]
struct Args {
    /// Number of devices to simulate
    #[arg(long)]
    devices: usize,

    /// Collector host (default: GRID_HOST or localhost)
    #[arg(long)]
    host: Option<String>,

    /// Collector port (default: GRID_PORT or 8890)
    #[arg(long)]
    port: Option<u16>,

    /// Reporting interval in seconds
    #[arg(long, default_value = "3", value_parser = parse_seconds)]
    interval: Duration,

    /// Readings sealed and sent per batch
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Frames written per connection
    #[arg(long, default_value = "25")]
    chunk_size: usize,

    /// Maximum simultaneous connections
    #[arg(long, default_value = "50")]
    concurrency: usize,

    /// Payload profile: compact, compact-random-iv or json
    #[arg(long)]
    profile: Option<WireProfile>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Disable batch and chunk pacing
    #[arg(long)]
    no_safety: bool,
}

fn print_report(devices: usize, summary: &SimulatorSummary) {
    let total = summary.messages_sent + summary.messages_failed;
    let success_rate = if total > 0 {
        summary.messages_sent as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let secs = summary.elapsed.as_secs_f64();

    println!("\nSimulation Report");
    println!("=================");
    println!("Duration:              {:.2}s", secs);
    println!("Devices:               {}", devices);
    println!("Cycles:                {}", summary.cycles);
    println!("Messages Sent:         {}", summary.messages_sent);
    println!("Messages Failed:       {}", summary.messages_failed);
    println!("Success Rate:          {:.2}%", success_rate);
    if secs > 0.0 {
        println!("Messages/second:       {:.2}", summary.messages_sent as f64 / secs);
    }
    println!("\nTransport:");
    println!("  Connection Attempts: {}", summary.transport.connection_attempts);
    println!("  Chunks Sent:         {}", summary.transport.chunks_sent);
    println!("  Chunks Failed:       {}", summary.transport.chunks_failed);
    println!("  Peak Connections:    {}", summary.transport.peak_connections);
}

fn spawn_status_reporter(stats: Arc<SimulatorStats>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = interval(STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sent = stats.messages_sent.load(Ordering::Relaxed);
            let secs = started.elapsed().as_secs_f64();
            println!(
                "[{:>6.0}s] cycles: {}  sent: {}  failed: {}  ({:.1} msg/s)",
                secs,
                stats.cycles.load(Ordering::Relaxed),
                sent,
                stats.messages_failed.load(Ordering::Relaxed),
                sent as f64 / secs
            );
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger(LevelFilter::Info);
    let args = Args::parse();

    let mut env = Config::load()?;
    if let Some(host) = args.host {
        env.host = host;
    }
    if let Some(port) = args.port {
        env.port = port;
    }

    let config = SimulatorConfig {
        num_devices: args.devices,
        interval: args.interval,
        batch_size: args.batch_size,
        profile: args.profile.unwrap_or(env.profile),
        duration: args.duration.map(Duration::from_secs),
        safety: !args.no_safety,
        transport: TransportConfig {
            chunk_size: args.chunk_size,
            concurrency_limit: args.concurrency,
            ..TransportConfig::from_config(&env)
        },
    };

    info!(
        "Target {} with {} devices (batch {}, chunk {}, concurrency {}, profile {})",
        env.address(),
        config.num_devices,
        config.batch_size,
        config.transport.chunk_size,
        config.transport.concurrency_limit,
        config.profile
    );

    let simulator = BulkSimulator::new(config).await?;
    let reporter = spawn_status_reporter(simulator.stats());

    let result = simulator
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Simulator stopped by user"),
                Err(e) => {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await;
    reporter.abort();

    match result {
        Ok(summary) => {
            print_report(args.devices, &summary);
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e)
        }
    }
}
