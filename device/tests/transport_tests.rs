use common::encryption::KeyStore;
use common::protocol::{Frame, FrameReader, PayloadCodec, WireProfile};
use device::{
    BulkSimulator, Connector, EdgeConfig, EdgeDevice, SimulatorConfig, TransportClient,
    TransportConfig,
};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn frames(count: usize) -> Vec<Frame> {
    (0..count)
        .map(|i| Frame::new(format!("meter_{:06}", i), vec![i as u8; 16]))
        .collect()
}

fn fast_config(port: u16) -> TransportConfig {
    TransportConfig {
        host: "127.0.0.1".to_string(),
        port,
        retry_base_delay: Duration::from_millis(10),
        pace_chunks: false,
        ..TransportConfig::default()
    }
}

/// Accepts connections and forwards every decoded frame.
async fn spawn_sink() -> (u16, mpsc::UnboundedReceiver<Frame>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut reader = FrameReader::new(socket);
                while let Ok(Some(frame)) = reader.next_frame().await {
                    let _ = tx.send(frame);
                }
            });
        }
    });

    (port, rx)
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<Frame>, count: usize) -> Vec<Frame> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frames")
            .expect("sink closed");
        out.push(frame);
    }
    out
}

/// Refuses the first `failures` connection attempts, then dials TCP.
struct FlakyConnector {
    addr: String,
    failures: usize,
    attempts: AtomicUsize,
}

impl Connector for FlakyConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = attempt < self.failures;
        let addr = self.addr.clone();
        async move {
            if fail {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                TcpStream::connect(addr).await
            }
        }
    }
}

struct PendingConnector;

impl Connector for PendingConnector {
    type Stream = tokio::io::Sink;

    fn connect(&self) -> impl Future<Output = io::Result<tokio::io::Sink>> + Send {
        std::future::pending()
    }
}

/// In-memory streams whose reader drains slowly, so connections stay open.
struct SlowPipeConnector {
    received: Arc<AtomicUsize>,
}

impl Connector for SlowPipeConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let received = self.received.clone();
        async move {
            let (client, server) = tokio::io::duplex(64);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut reader = FrameReader::new(server);
                while let Ok(Some(_)) = reader.next_frame().await {
                    received.fetch_add(1, Ordering::SeqCst);
                }
            });
            Ok(client)
        }
    }
}

#[tokio::test]
async fn test_batch_delivers_all_frames_in_chunks() {
    let (port, mut rx) = spawn_sink().await;
    let client = TransportClient::new(TransportConfig {
        chunk_size: 4,
        ..fast_config(port)
    });

    let outcome = client.send_batch(frames(10)).await;
    assert_eq!(outcome.requested, 10);
    assert_eq!(outcome.sent, 10);
    assert_eq!(outcome.chunks_ok, 3);
    assert_eq!(outcome.chunks_failed, 0);
    assert!(!outcome.timed_out);

    let mut ids: Vec<String> = collect(&mut rx, 10)
        .await
        .into_iter()
        .map(|f| f.device_id)
        .collect();
    ids.sort();
    assert_eq!(ids, frames(10).into_iter().map(|f| f.device_id).collect::<Vec<_>>());
    assert_eq!(client.stats().connection_attempts, 3);
}

#[tokio::test]
async fn test_unencodable_frame_spares_its_chunk() {
    let (port, mut rx) = spawn_sink().await;
    let client = TransportClient::new(TransportConfig {
        chunk_size: 3,
        ..fast_config(port)
    });

    let batch = vec![
        Frame::new("meter_000001", vec![1; 16]),
        Frame::new("meter\n000002", vec![2; 16]),
        Frame::new("meter_000003", vec![3; 16]),
    ];
    let outcome = client.send_batch(batch).await;
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.failed(), 1);
    assert_eq!(outcome.chunks_ok, 1);

    let mut ids: Vec<String> = collect(&mut rx, 2)
        .await
        .into_iter()
        .map(|f| f.device_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["meter_000001", "meter_000003"]);
}

#[tokio::test]
async fn test_chunk_retried_until_third_attempt() {
    let (port, mut rx) = spawn_sink().await;
    let connector = FlakyConnector {
        addr: format!("127.0.0.1:{}", port),
        failures: 2,
        attempts: AtomicUsize::new(0),
    };
    let client = TransportClient::with_connector(fast_config(port), connector);

    let outcome = client.send_batch(frames(5)).await;
    assert_eq!(outcome.sent, 5);
    assert_eq!(outcome.chunks_ok, 1);

    let stats = client.stats();
    assert_eq!(stats.connection_attempts, 3);
    assert_eq!(stats.frames_sent, 5);
    assert_eq!(stats.chunks_failed, 0);
    assert_eq!(collect(&mut rx, 5).await.len(), 5);
}

#[tokio::test]
async fn test_chunk_fails_after_attempt_cap() {
    let connector = FlakyConnector {
        addr: "127.0.0.1:9".to_string(),
        failures: usize::MAX,
        attempts: AtomicUsize::new(0),
    };
    let client = TransportClient::with_connector(fast_config(9), connector);

    let outcome = client.send_batch(frames(3)).await;
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.failed(), 3);
    assert_eq!(outcome.chunks_failed, 1);
    assert_eq!(client.stats().connection_attempts, 3);
}

#[tokio::test]
async fn test_batch_ceiling_cancels_stuck_chunks() {
    let config = TransportConfig {
        chunk_size: 2,
        connect_timeout: Duration::from_secs(60),
        batch_timeout: Duration::from_millis(200),
        ..fast_config(0)
    };
    let client = TransportClient::with_connector(config, PendingConnector);

    let started = std::time::Instant::now();
    let outcome = client.send_batch(frames(6)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(outcome.timed_out);
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.chunks_failed, 3);
}

#[tokio::test]
async fn test_chunk_pacing_respects_batch_ceiling() {
    let config = TransportConfig {
        chunk_size: 1,
        connect_timeout: Duration::from_secs(60),
        batch_timeout: Duration::from_millis(50),
        pace_chunks: true,
        ..fast_config(0)
    };
    let client = TransportClient::with_connector(config, PendingConnector);

    let started = std::time::Instant::now();
    let outcome = client.send_batch(frames(800)).await;
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert!(outcome.timed_out);
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.failed(), 800);
    assert_eq!(outcome.chunks_failed, 800);
    assert_eq!(client.stats().chunks_failed, 800);
}

#[tokio::test]
async fn test_open_connections_never_exceed_limit() {
    let received = Arc::new(AtomicUsize::new(0));
    let config = TransportConfig {
        concurrency_limit: 3,
        chunk_size: 5,
        ..fast_config(0)
    };
    let client = TransportClient::with_connector(
        config,
        SlowPipeConnector {
            received: received.clone(),
        },
    );

    let outcome = client.send_batch(frames(60)).await;
    assert_eq!(outcome.sent, 60);

    let stats = client.stats();
    assert_eq!(stats.peak_connections, 3);
    assert_eq!(stats.open_connections, 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.load(Ordering::SeqCst) < 60 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_probe_reports_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = TransportClient::new(fast_config(port));
    assert!(client.check_connection(Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn test_edge_device_sends_decodable_readings() {
    let (port, mut rx) = spawn_sink().await;
    let mut config = EdgeConfig::new("meter_000042", fast_config(port));
    config.interval = Duration::from_millis(5);
    config.count = Some(3);

    let summary = EdgeDevice::new(config).run().await.unwrap();
    assert_eq!(summary.sent, 3);
    assert_eq!(summary.failed, 0);

    let codec = PayloadCodec::new(Arc::new(KeyStore::new()), WireProfile::Compact);
    for frame in collect(&mut rx, 3).await {
        assert_eq!(frame.device_id, "meter_000042");
        assert_eq!(frame.payload.len(), 16);
        let (reading, sequence) = codec
            .open_with_sequence(&frame.device_id, &frame.payload)
            .unwrap();
        assert_eq!(sequence, Some(42));
        assert!((118.0..=122.1).contains(&reading.voltage));
    }
}

#[tokio::test]
async fn test_simulator_cycle_reaches_every_device() {
    let (port, mut rx) = spawn_sink().await;
    let config = SimulatorConfig {
        num_devices: 5,
        batch_size: 2,
        transport: TransportConfig {
            chunk_size: 1,
            ..fast_config(port)
        },
        ..SimulatorConfig::default()
    };

    let simulator = BulkSimulator::new(config).await.unwrap();
    let report = simulator.run_cycle().await.unwrap();
    assert_eq!(report.requested, 5);
    assert_eq!(report.sent, 5);

    let codec = PayloadCodec::new(Arc::new(KeyStore::new()), WireProfile::Compact);
    let mut sequences: Vec<u16> = collect(&mut rx, 5)
        .await
        .iter()
        .map(|f| codec.open_with_sequence(&f.device_id, &f.payload).unwrap().1.unwrap())
        .collect();
    sequences.sort();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_simulator_stops_after_duration() {
    let (port, _rx) = spawn_sink().await;
    let config = SimulatorConfig {
        num_devices: 2,
        interval: Duration::from_millis(20),
        duration: Some(Duration::from_millis(150)),
        transport: fast_config(port),
        ..SimulatorConfig::default()
    };

    let simulator = BulkSimulator::new(config).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), simulator.run())
        .await
        .unwrap()
        .unwrap();
    assert!(summary.cycles >= 1);
    assert_eq!(summary.messages_sent, summary.cycles * 2);
}
