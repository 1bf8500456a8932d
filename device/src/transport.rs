//! Chunked, bounded, retrying delivery of frames over short-lived TCP
//! connections.

use common::protocol::Frame;
use common::{Config, Result, TelemetryError};
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};

const CHUNKS_PER_PAUSE: usize = 4;
const CHUNK_PAUSE: Duration = Duration::from_millis(10);

/// Opens the byte stream a chunk is written to.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        TcpStream::connect(self.addr.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on simultaneously open connections.
    pub concurrency_limit: usize,
    /// Frames written per connection.
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub flush_timeout: Duration,
    /// Ceiling on a whole `send_batch` call.
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// Sleep briefly after every few chunks to spread connection bursts.
    pub pace_chunks: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: common::DEFAULT_PORT,
            concurrency_limit: 50,
            chunk_size: 25,
            connect_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            pace_chunks: true,
        }
    }
}

impl TransportConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
            flush_timeout: config.flush_timeout,
            ..Self::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Default)]
pub struct TransportStats {
    pub connection_attempts: AtomicU64,
    pub frames_sent: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub chunks_failed: AtomicU64,
    pub open_connections: AtomicUsize,
    pub peak_connections: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStatsSnapshot {
    pub connection_attempts: u64,
    pub frames_sent: u64,
    pub chunks_sent: u64,
    pub chunks_failed: u64,
    pub open_connections: usize,
    pub peak_connections: usize,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            peak_connections: self.peak_connections.load(Ordering::Relaxed),
        }
    }

    fn track_open(&self) -> OpenConnection<'_> {
        let open = self.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_connections.fetch_max(open, Ordering::SeqCst);
        OpenConnection(self)
    }
}

struct OpenConnection<'a>(&'a TransportStats);

impl Drop for OpenConnection<'_> {
    fn drop(&mut self) {
        self.0.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of one [`TransportClient::send_batch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub requested: usize,
    /// Frames belonging to chunks that completed a full attempt.
    pub sent: usize,
    pub chunks_ok: usize,
    pub chunks_failed: usize,
    /// The batch ceiling expired and outstanding chunks were cancelled.
    pub timed_out: bool,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        self.requested - self.sent
    }
}

struct Shared<C> {
    connector: C,
    config: TransportConfig,
    stats: TransportStats,
}

pub struct TransportClient<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
    limiter: Arc<Semaphore>,
}

impl TransportClient<TcpConnector> {
    pub fn new(config: TransportConfig) -> Self {
        let connector = TcpConnector::new(config.address());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> TransportClient<C> {
    pub fn with_connector(config: TransportConfig, connector: C) -> Self {
        let limiter = Arc::new(Semaphore::new(config.concurrency_limit.max(1)));
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                stats: TransportStats::default(),
            }),
            limiter,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Opens and immediately closes one connection.
    pub async fn check_connection(&self, probe_timeout: Duration) -> Result<()> {
        let mut stream = timeout(probe_timeout, self.shared.connector.connect())
            .await
            .map_err(|_| {
                TelemetryError::NetworkError(format!(
                    "Connection probe timed out after {:?}",
                    probe_timeout
                ))
            })??;
        stream.shutdown().await?;
        Ok(())
    }

    /// Delivers `frames` in chunks, one connection per chunk.
    ///
    /// Never blocks past `batch_timeout`. Frames count as sent only when
    /// their whole chunk was written, flushed and closed.
    pub async fn send_batch(&self, frames: Vec<Frame>) -> BatchOutcome {
        let requested = frames.len();
        let mut outcome = BatchOutcome {
            requested,
            ..BatchOutcome::default()
        };
        if requested == 0 {
            return outcome;
        }

        let config = &self.shared.config;
        let deadline = Instant::now() + config.batch_timeout;
        let mut tasks = JoinSet::new();

        let chunks: Vec<&[Frame]> = frames.chunks(config.chunk_size.max(1)).collect();
        let mut unspawned = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            if Instant::now() >= deadline {
                unspawned = chunks.len() - index;
                break;
            }
            let encoded = encode_chunk(chunk);
            if encoded.is_empty() {
                outcome.chunks_failed += 1;
                self.shared.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            tasks.spawn(send_chunk(
                self.shared.clone(),
                self.limiter.clone(),
                encoded,
            ));

            if config.pace_chunks
                && (index + 1) % CHUNKS_PER_PAUSE == 0
                && timeout_at(deadline, sleep(CHUNK_PAUSE)).await.is_err()
            {
                unspawned = chunks.len() - index - 1;
                break;
            }
        }

        // Chunks never started once the deadline passed.
        if unspawned > 0 {
            outcome.timed_out = true;
            outcome.chunks_failed += unspawned;
            self.shared
                .stats
                .chunks_failed
                .fetch_add(unspawned as u64, Ordering::Relaxed);
        }

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(ChunkResult::Sent(frames)))) => {
                    outcome.sent += frames;
                    outcome.chunks_ok += 1;
                }
                Ok(Some(Ok(ChunkResult::Failed))) => outcome.chunks_failed += 1,
                Ok(Some(Err(e))) => {
                    warn!("Chunk task ended abnormally: {}", e);
                    outcome.chunks_failed += 1;
                    self.shared.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Batch send timeout - cancelling {} outstanding chunks",
                        tasks.len()
                    );
                    outcome.timed_out = true;
                    tasks.abort_all();
                    // Chunks that finished right at the deadline still count.
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(ChunkResult::Sent(frames)) => {
                                outcome.sent += frames;
                                outcome.chunks_ok += 1;
                            }
                            Ok(ChunkResult::Failed) => outcome.chunks_failed += 1,
                            Err(_) => {
                                outcome.chunks_failed += 1;
                                self.shared.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    break;
                }
            }
        }

        debug!(
            "Batch done: {}/{} frames, {} chunks ok, {} failed",
            outcome.sent, outcome.requested, outcome.chunks_ok, outcome.chunks_failed
        );
        outcome
    }
}

/// Frames that cannot be encoded are dropped so they do not take the rest
/// of their chunk down with them at the reader.
fn encode_chunk(chunk: &[Frame]) -> Vec<Vec<u8>> {
    chunk
        .iter()
        .filter_map(|frame| match frame.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Dropping frame for {:?}: {}", frame.device_id, e);
                None
            }
        })
        .collect()
}

enum ChunkResult {
    Sent(usize),
    Failed,
}

async fn send_chunk<C: Connector>(
    shared: Arc<Shared<C>>,
    limiter: Arc<Semaphore>,
    frames: Vec<Vec<u8>>,
) -> ChunkResult {
    // Held across retries so the bound covers backoff too.
    let _permit = match limiter.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ChunkResult::Failed,
    };

    let config = &shared.config;
    let stats = &shared.stats;
    let attempts = config.max_attempts.max(1);

    for attempt in 0..attempts {
        match write_chunk(&shared, &frames).await {
            Ok(()) => {
                stats.frames_sent.fetch_add(frames.len() as u64, Ordering::Relaxed);
                stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
                return ChunkResult::Sent(frames.len());
            }
            Err(e) if attempt + 1 < attempts => {
                debug!("Chunk attempt {}/{} failed: {}", attempt + 1, attempts, e);
                if e.kind() == io::ErrorKind::ConnectionRefused {
                    debug!("Connection refused - server may be overloaded");
                }
                sleep(config.retry_base_delay * 2u32.pow(attempt)).await;
            }
            Err(e) => {
                let failed = stats.chunks_failed.fetch_add(1, Ordering::Relaxed) + 1;
                if failed % 50 == 1 {
                    warn!(
                        "Chunk of {} frames failed after {} attempts: {}",
                        frames.len(),
                        attempts,
                        e
                    );
                }
            }
        }
    }

    ChunkResult::Failed
}

async fn write_chunk<C: Connector>(shared: &Shared<C>, frames: &[Vec<u8>]) -> io::Result<()> {
    shared
        .stats
        .connection_attempts
        .fetch_add(1, Ordering::Relaxed);

    let stream = timeout(shared.config.connect_timeout, shared.connector.connect())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let _open = shared.stats.track_open();

    let mut writer = BufWriter::new(stream);
    timeout(shared.config.flush_timeout, async {
        for frame in frames {
            writer.write_all(frame).await?;
        }
        writer.flush().await?;
        writer.shutdown().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "flush timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_client_profile() {
        let config = TransportConfig::default();
        assert_eq!(config.concurrency_limit, 50);
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.batch_timeout, Duration::from_secs(30));
        assert_eq!(config.address(), "localhost:8890");
    }

    #[test]
    fn test_open_connection_tracking() {
        let stats = TransportStats::default();
        {
            let _a = stats.track_open();
            let _b = stats.track_open();
            assert_eq!(stats.snapshot().open_connections, 2);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.open_connections, 0);
        assert_eq!(snapshot.peak_connections, 2);
    }

    /// Every connection expects exactly `expected` and nothing else.
    struct ScriptedConnector {
        expected: Vec<u8>,
    }

    impl Connector for ScriptedConnector {
        type Stream = tokio_test::io::Mock;

        fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send {
            let mock = tokio_test::io::Builder::new().write(&self.expected).build();
            async move { Ok(mock) }
        }
    }

    #[tokio::test]
    async fn test_chunk_written_as_concatenated_frames() {
        let frames = vec![
            Frame::new("meter_000001", b"abc".to_vec()),
            Frame::new("meter_000002", b"de".to_vec()),
        ];
        let expected: Vec<u8> = frames.iter().flat_map(|f| f.encode().unwrap()).collect();
        assert!(expected.starts_with(b"meter_000001:3\nabc"));

        let config = TransportConfig {
            chunk_size: 2,
            pace_chunks: false,
            ..TransportConfig::default()
        };
        let client = TransportClient::with_connector(config, ScriptedConnector { expected });
        let outcome = client.send_batch(frames).await;

        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.chunks_ok, 1);
        assert_eq!(client.stats().connection_attempts, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let client = TransportClient::new(TransportConfig::default());
        let outcome = client.send_batch(Vec::new()).await;
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(client.stats().connection_attempts, 0);
    }
}
