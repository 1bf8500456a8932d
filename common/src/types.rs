use serde::{Deserialize, Serialize};

/// A single smart-meter sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub device_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub frequency: f64,
}

/// Summary artifact written by the collector when a benchmark run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub seconds: f64,
    pub throughput_rps: f64,
    pub total_readings: u64,
    pub benchmark_target: u64,
    pub total_sums: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_sum_target: Option<u64>,
    pub devices_seen: usize,
    pub anomalies: u64,
    pub decode_errors: u64,
    pub finished_at: String,
}

/// Canonical identifier of the `index`-th simulated meter.
pub fn device_id_for(index: usize) -> String {
    format!("meter_{:06}", index)
}

/// Short sequence number carried inside a compact record.
///
/// Taken from the digits after the last `_` of the identifier, truncated to
/// 16 bits. Identifiers without a numeric suffix map to 0.
pub fn device_sequence(device_id: &str) -> u16 {
    device_id
        .rsplit_once('_')
        .and_then(|(_, suffix)| suffix.parse::<u64>().ok())
        .map(|n| (n & 0xFFFF) as u16)
        .unwrap_or(0)
}
