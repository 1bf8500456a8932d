use common::generator::now_timestamp;
use common::protocol::{Frame, PayloadCodec, PayloadError, WireProfile};
use common::{device_sequence, encryption::KeyStore, ReadingGenerator, Result};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::transport::{Connector, TcpConnector, TransportClient, TransportConfig};

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub device_id: String,
    pub interval: Duration,
    pub profile: WireProfile,
    /// Stop after this many readings; run forever when `None`.
    pub count: Option<u64>,
    /// Pause after an unexpected local failure.
    pub error_backoff: Duration,
    pub transport: TransportConfig,
}

impl EdgeConfig {
    pub fn new(device_id: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            device_id: device_id.into(),
            interval: Duration::from_secs(1),
            profile: WireProfile::default(),
            count: None,
            error_backoff: Duration::from_secs(5),
            transport,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeSummary {
    pub sent: u64,
    pub failed: u64,
}

/// A single meter sending one reading per connection.
pub struct EdgeDevice<C: Connector = TcpConnector> {
    device_id: String,
    sequence: u16,
    interval: Duration,
    count: Option<u64>,
    error_backoff: Duration,
    codec: PayloadCodec,
    generator: ReadingGenerator,
    client: TransportClient<C>,
}

impl EdgeDevice<TcpConnector> {
    pub fn new(config: EdgeConfig) -> Self {
        let connector = TcpConnector::new(config.transport.address());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> EdgeDevice<C> {
    pub fn with_connector(config: EdgeConfig, connector: C) -> Self {
        // One frame per connection and no retries.
        let transport = TransportConfig {
            concurrency_limit: 1,
            chunk_size: 1,
            max_attempts: 1,
            pace_chunks: false,
            ..config.transport
        };

        Self {
            sequence: device_sequence(&config.device_id),
            device_id: config.device_id,
            interval: config.interval,
            count: config.count,
            error_backoff: config.error_backoff,
            codec: PayloadCodec::new(Arc::new(KeyStore::new()), config.profile),
            generator: ReadingGenerator::new(),
            client: TransportClient::with_connector(transport, connector),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn run(&self) -> Result<EdgeSummary> {
        info!("Device {} starting...", self.device_id);

        // First derivation is slow; keep it off the async workers.
        let keys = self.codec.keys().clone();
        let device_id = self.device_id.clone();
        tokio::task::spawn_blocking(move || keys.get_or_derive(&device_id)).await?;

        let mut summary = EdgeSummary::default();
        while self.count.map_or(true, |limit| summary.sent + summary.failed < limit) {
            let reading = self.generator.generate(&self.device_id, now_timestamp());

            let frame = match self.seal(&reading) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{}: {}", self.device_id, e);
                    summary.failed += 1;
                    sleep(self.error_backoff).await;
                    continue;
                }
            };

            let outcome = self.client.send_batch(vec![frame]).await;
            if outcome.sent == 1 {
                summary.sent += 1;
                if summary.sent % 20 == 0 {
                    info!(
                        "{}: Sent {} messages (Power: {:.1}W)",
                        self.device_id, summary.sent, reading.power
                    );
                }
            } else {
                summary.failed += 1;
                if summary.failed % 100 == 1 {
                    warn!(
                        "{}: Connection error ({} failed so far)",
                        self.device_id, summary.failed
                    );
                }
            }

            sleep(self.interval).await;
        }

        info!(
            "Device {} finished: {} sent, {} failed",
            self.device_id, summary.sent, summary.failed
        );
        Ok(summary)
    }

    fn seal(&self, reading: &common::MeterReading) -> std::result::Result<Frame, PayloadError> {
        let payload = self.codec.seal(&self.device_id, reading, self.sequence)?;
        Ok(Frame::new(self.device_id.clone(), payload))
    }
}
