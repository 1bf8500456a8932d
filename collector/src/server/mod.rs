//! TCP ingestion server
//!
//! Accepts framed, encrypted meter readings, decodes them with the
//! configured payload profile and feeds the aggregator. When a benchmark
//! target is reached the server stops accepting, writes the metrics
//! artifact and returns.

use common::encryption::KeyStore;
use common::protocol::{Frame, PayloadCodec, WireProfile};
use common::{Result, RunMetrics, DEFAULT_PORT};
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::aggregator::{Aggregator, AggregatorConfig, AggregatorSnapshot};
use crate::anomaly;
use crate::metrics::write_metrics;
use crate::registry::{DeviceRegistry, SequenceCheck};

mod connection;

pub use connection::handle_connection;

/// Configuration for the ingestion server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0`
    pub host: String,
    /// TCP port; 0 picks a free one
    pub port: u16,
    /// Payload encoding expected from every device
    pub profile: WireProfile,
    /// Idle limit for a single frame read
    pub read_timeout: Duration,
    /// Where the run metrics artifact goes when a target is reached
    pub metrics_path: Option<PathBuf>,
    pub aggregator: AggregatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            profile: WireProfile::default(),
            read_timeout: Duration::from_secs(30),
            metrics_path: None,
            aggregator: AggregatorConfig::new(1),
        }
    }
}

/// State shared by every connection task
pub struct ServerState {
    codec: PayloadCodec,
    registry: DeviceRegistry,
    aggregator: Aggregator,
    read_timeout: Duration,
    completed: watch::Sender<Option<RunMetrics>>,
}

impl ServerState {
    pub fn new(config: &ServerConfig) -> (Self, watch::Receiver<Option<RunMetrics>>) {
        let keys = Arc::new(KeyStore::new());
        let (completed, rx) = watch::channel(None);
        let state = Self {
            codec: PayloadCodec::new(keys.clone(), config.profile),
            registry: DeviceRegistry::new(keys),
            aggregator: Aggregator::new(config.aggregator.clone()),
            read_timeout: config.read_timeout,
            completed,
        };
        (state, rx)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Handles one frame. Failures here never end the connection.
    pub async fn process_frame(&self, frame: Frame) {
        if let Err(e) = self.registry.resolve(&frame.device_id).await {
            error!("Key lookup failed for {}: {}", frame.device_id, e);
            return;
        }

        let (reading, sequence) = match self
            .codec
            .open_with_sequence(&frame.device_id, &frame.payload)
        {
            Ok(opened) => opened,
            Err(e) => {
                let failures = self.aggregator.record_decode_error();
                if failures % 100 == 1 {
                    warn!(
                        "Failed to decode payload from {} ({} bytes): {} [{} decode errors]",
                        frame.device_id,
                        frame.payload.len(),
                        e,
                        failures
                    );
                } else {
                    debug!("Failed to decode payload from {}: {}", frame.device_id, e);
                }
                return;
            }
        };

        if let SequenceCheck::Mismatch { first, got } = self.registry.observe(&frame.device_id, sequence) {
            warn!(
                "Device {} changed sequence number from {} to {}",
                frame.device_id, first, got
            );
        }

        let detected = anomaly::detect(&reading);
        if let Some(kind) = detected {
            warn!(
                "Anomaly detected - Device: {}, Power: {:.1}W, Voltage: {:.1}V ({})",
                reading.device_id, reading.power, reading.voltage, kind
            );
        }

        if let Some(completion) = self.aggregator.record(&reading, detected.is_some()) {
            let metrics = self.aggregator.run_metrics(&completion, self.registry.len());
            info!(
                "Benchmark complete: {} readings in {:.3}s ({:.1} readings/sec)",
                metrics.total_readings, metrics.seconds, metrics.throughput_rps
            );
            self.completed.send_replace(Some(metrics));
        }
    }
}

/// Listening ingestion server
pub struct IngestionServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    completed: watch::Receiver<Option<RunMetrics>>,
    metrics_path: Option<PathBuf>,
}

impl IngestionServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let (state, completed) = ServerState::new(&config);

        let addr = listener.local_addr()?;
        let mut banner = format!(
            "Smart Grid Server listening on {} (expecting {} devices, profile={}",
            addr, config.aggregator.expected_devices, config.profile
        );
        if let Some(target) = config.aggregator.benchmark_target {
            banner.push_str(&format!(", benchmark target: {} readings", target));
        } else if let Some(target) = config.aggregator.benchmark_sum_target {
            banner.push_str(&format!(", benchmark target: {} summations", target));
        }
        banner.push(')');
        info!("{}", banner);

        Ok(Self {
            listener,
            state: Arc::new(state),
            completed,
            metrics_path: config.metrics_path,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        self.state.aggregator.snapshot()
    }

    /// Serves until a benchmark target is reached.
    pub async fn serve(self) -> Result<Option<RunMetrics>> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serves until a benchmark target is reached or `shutdown` resolves.
    ///
    /// Returns the run metrics when a target ended the run. The listener is
    /// closed and in-flight connections are aborted before this returns.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<Option<RunMetrics>>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            state,
            mut completed,
            metrics_path,
        } = self;

        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        info!("Server running - waiting for connections...");

        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let state = state.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(socket, peer, state).await {
                                debug!("Connection {} closed with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                changed = completed.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                    let metrics = completed.borrow_and_update().clone();
                    if metrics.is_some() {
                        break metrics;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break None;
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        drop(listener);
        connections.abort_all();
        info!("Server stopped accepting connections");

        if let (Some(metrics), Some(path)) = (&outcome, &metrics_path) {
            info!("Writing metrics to: {}", path.display());
            write_metrics(path, metrics).await?;
        }

        Ok(outcome)
    }
}
