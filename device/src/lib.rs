pub mod edge;
pub mod simulator;
pub mod transport;

pub use edge::{EdgeConfig, EdgeDevice, EdgeSummary};
pub use simulator::{BulkSimulator, CycleReport, SimulatorConfig, SimulatorStats, SimulatorSummary};
pub use transport::{
    BatchOutcome, Connector, TcpConnector, TransportClient, TransportConfig, TransportStats,
    TransportStatsSnapshot,
};
