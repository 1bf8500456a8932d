use clap::Parser;
use common::logging::setup_logger;
use common::{parse_seconds, Config, Result, WireProfile};
use device::{EdgeConfig, EdgeDevice, TransportConfig};
use log::{error, info, LevelFilter};
use std::time::Duration;

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════════╗
║                                                       ║
║    Smart Meter Edge Device v0.1.0                     ║
║    Encrypted telemetry over TCP                       ║
║                                                       ║
╚═══════════════════════════════════════════════════════╝
"#;

#[derive(Parser)]
#[command(about = "Single smart meter sending encrypted readings")]
struct Args {
    /// Device identifier, e.g. meter_000042
    #[arg(long)]
    device: String,

    /// Collector host (default: GRID_HOST or localhost)
    #[arg(long)]
    host: Option<String>,

    /// Collector port (default: GRID_PORT or 8890)
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between readings
    #[arg(long, default_value = "1.0", value_parser = parse_seconds)]
    interval: Duration,

    /// Payload profile: compact, compact-random-iv or json
    #[arg(long)]
    profile: Option<WireProfile>,

    /// Stop after this many readings
    #[arg(long)]
    count: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger(LevelFilter::Info);
    println!("{}", BANNER);

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(profile) = args.profile {
        config.profile = profile;
    }

    info!("Device ID: {}", args.device);
    info!("Collector: {}", config.address());
    info!("Profile: {}", config.profile);

    let mut edge = EdgeConfig::new(args.device, TransportConfig::from_config(&config));
    edge.interval = args.interval;
    edge.profile = config.profile;
    edge.count = args.count;

    let device = EdgeDevice::new(edge);
    tokio::select! {
        result = device.run() => match result {
            Ok(summary) => {
                info!("Device shutdown gracefully ({} sent, {} failed)", summary.sent, summary.failed);
                Ok(())
            }
            Err(e) => {
                error!("Device encountered an error: {}", e);
                Err(e)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Device {} stopped by user", device.device_id());
            Ok(())
        }
    }
}
