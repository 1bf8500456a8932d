//! Many meters multiplexed over one transport client.

use common::encryption::KeyStore;
use common::generator::now_timestamp;
use common::protocol::{Frame, PayloadCodec, WireProfile};
use common::{device_id_for, ReadingGenerator, Result, TelemetryError};
use log::{debug, info};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::transport::{
    Connector, TcpConnector, TransportClient, TransportConfig, TransportStatsSnapshot,
};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BATCH_PAUSE: Duration = Duration::from_millis(50);
const CYCLE_LOG_EVERY: u64 = 5;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub num_devices: usize,
    pub interval: Duration,
    pub batch_size: usize,
    pub profile: WireProfile,
    /// Stop after this much wall time; run until shutdown when `None`.
    pub duration: Option<Duration>,
    /// Pace batches and chunks so a small server is not flooded.
    pub safety: bool,
    pub transport: TransportConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            num_devices: 100,
            interval: Duration::from_secs(3),
            batch_size: 100,
            profile: WireProfile::default(),
            duration: None,
            safety: true,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatorStats {
    pub cycles: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub requested: usize,
    pub sent: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            0.0
        } else {
            self.sent as f64 / self.requested as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatorSummary {
    pub cycles: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub elapsed: Duration,
    pub transport: TransportStatsSnapshot,
}

pub struct BulkSimulator<C: Connector = TcpConnector> {
    config: SimulatorConfig,
    codec: PayloadCodec,
    generator: ReadingGenerator,
    client: TransportClient<C>,
    stats: Arc<SimulatorStats>,
}

impl BulkSimulator<TcpConnector> {
    pub async fn new(config: SimulatorConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.transport.address());
        Self::with_connector(config, connector).await
    }
}

impl<C: Connector> BulkSimulator<C> {
    /// Derives every device key up front, then builds the simulator.
    pub async fn with_connector(mut config: SimulatorConfig, connector: C) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(TelemetryError::ConfigError(
                "batch size must be at least 1".to_string(),
            ));
        }
        config.transport.chunk_size = config.transport.chunk_size.clamp(1, config.batch_size);
        config.transport.pace_chunks = config.safety;

        info!("Pre-generating keys for {} devices...", config.num_devices);
        let keys = Arc::new(KeyStore::new());
        let ids: Vec<String> = (0..config.num_devices).map(device_id_for).collect();
        let preload = keys.clone();
        let derived = tokio::task::spawn_blocking(move || preload.preload(ids)).await?;
        info!("Initialized {} device profiles ({} keys derived)", config.num_devices, derived);

        Ok(Self {
            codec: PayloadCodec::new(keys, config.profile),
            generator: ReadingGenerator::new(),
            client: TransportClient::with_connector(config.transport.clone(), connector),
            stats: Arc::new(SimulatorStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Live counters, shareable with a status reporter.
    pub fn stats(&self) -> Arc<SimulatorStats> {
        self.stats.clone()
    }

    pub fn transport_stats(&self) -> TransportStatsSnapshot {
        self.client.stats()
    }

    /// One reading per device, delivered batch by batch.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let readings = self
            .generator
            .generate_bulk(self.config.num_devices, now_timestamp());

        let mut sent = 0;
        let mut offset = 0;
        for batch in readings.chunks(self.config.batch_size) {
            let mut frames = Vec::with_capacity(batch.len());
            for (i, reading) in batch.iter().enumerate() {
                let sequence = ((offset + i) & 0xFFFF) as u16;
                let payload = self.codec.seal(&reading.device_id, reading, sequence)?;
                frames.push(Frame::new(reading.device_id.clone(), payload));
            }

            let outcome = self.client.send_batch(frames).await;
            sent += outcome.sent;
            offset += batch.len();

            if self.config.safety && offset < readings.len() {
                sleep(BATCH_PAUSE).await;
            }
        }

        let requested = readings.len();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats.messages_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.stats
            .messages_failed
            .fetch_add((requested - sent) as u64, Ordering::Relaxed);

        Ok(CycleReport {
            requested,
            sent,
            elapsed: started.elapsed(),
        })
    }

    pub async fn run(&self) -> Result<SimulatorSummary> {
        self.run_until(std::future::pending()).await
    }

    /// Runs cycles until `shutdown` resolves or the configured duration
    /// elapses. Fails only if the initial connection probe fails.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<SimulatorSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Starting bulk simulation with {} devices...",
            self.config.num_devices
        );

        self.client.check_connection(PROBE_TIMEOUT).await.map_err(|e| {
            TelemetryError::NetworkError(format!("Cannot connect to server: {}", e))
        })?;
        info!("Server connection test successful");

        let started = Instant::now();
        loop {
            let remaining = match self.config.duration {
                Some(limit) => match limit.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => break,
                },
                None => None,
            };

            let report = tokio::select! {
                _ = &mut shutdown => break,
                report = self.run_cycle() => report?,
            };

            let cycle = self.stats.cycles.load(Ordering::Relaxed);
            if cycle % CYCLE_LOG_EVERY == 0 {
                info!(
                    "Cycle {}: {}/{} sent ({:.1}%)",
                    cycle,
                    report.sent,
                    report.requested,
                    report.success_rate()
                );
            } else {
                debug!("Cycle {} took {:?}", cycle, report.elapsed);
            }

            let mut pause = self.config.interval.saturating_sub(report.elapsed);
            if let Some(left) = remaining {
                pause = pause.min(left.saturating_sub(report.elapsed));
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(pause) => {}
            }
        }

        info!("Shutting down simulator...");
        Ok(self.summary(started.elapsed()))
    }

    fn summary(&self, elapsed: Duration) -> SimulatorSummary {
        SimulatorSummary {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.stats.messages_failed.load(Ordering::Relaxed),
            elapsed,
            transport: self.client.stats(),
        }
    }
}
