pub mod aggregator;
pub mod anomaly;
pub mod metrics;
pub mod registry;
pub mod server;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorSnapshot, Completion};
pub use metrics::{read_metrics, write_metrics};
pub use registry::{DeviceRegistry, SequenceCheck};
pub use server::{IngestionServer, ServerConfig, ServerState};

/// Default worker thread count: twice the CPUs, capped at 120.
pub fn default_worker_threads() -> usize {
    (num_cpus::get() * 2).clamp(1, 120)
}
