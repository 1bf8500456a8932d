//! Run-wide counters, the rolling power sum and benchmark termination.
//!
//! Everything lives behind one mutex so that the increment reaching a
//! target and the decision to finish are a single step.

use chrono::Utc;
use common::{MeterReading, RunMetrics};
use log::info;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub expected_devices: usize,
    /// Readings per power sum.
    pub sum_interval: usize,
    /// Finish after this many readings.
    pub benchmark_target: Option<u64>,
    /// Finish after this many sums; ignored when a reading target is set.
    pub benchmark_sum_target: Option<u64>,
    pub quiet: bool,
}

impl AggregatorConfig {
    pub fn new(expected_devices: usize) -> Self {
        Self {
            expected_devices,
            sum_interval: expected_devices.max(1),
            benchmark_target: None,
            benchmark_sum_target: None,
            quiet: false,
        }
    }

    pub fn log_interval(&self) -> u64 {
        (self.expected_devices as u64 / 100).max(100)
    }
}

/// Counters at the moment a target was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub seconds: f64,
    pub total_readings: u64,
    pub total_sums: u64,
    pub anomalies: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSnapshot {
    pub total_readings: u64,
    pub total_sums: u64,
    pub anomalies: u64,
    pub decode_errors: u64,
    /// Time since the first reading.
    pub elapsed: Option<Duration>,
    pub finished: bool,
}

#[derive(Default)]
struct State {
    total_readings: u64,
    total_sums: u64,
    anomalies: u64,
    decode_errors: u64,
    window_sum: f64,
    window_len: usize,
    first_reading: Option<Instant>,
    finished: bool,
}

pub struct Aggregator {
    config: AggregatorConfig,
    sum_interval: usize,
    log_interval: u64,
    state: Mutex<State>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        info!(
            "PowerSumProcessor initialized - will sum every {} readings",
            config.sum_interval.max(1)
        );
        if let Some(target) = config.benchmark_target {
            info!("Benchmark target set: {} readings", target);
        } else if let Some(target) = config.benchmark_sum_target {
            info!("Benchmark target set: {} power summations", target);
        }

        Self {
            sum_interval: config.sum_interval.max(1),
            log_interval: config.log_interval(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Accounts for one decoded reading.
    ///
    /// Returns `Some` exactly once: for the reading that reaches the
    /// configured target.
    pub fn record(&self, reading: &MeterReading, anomalous: bool) -> Option<Completion> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let started = *state.first_reading.get_or_insert_with(|| {
            info!("First reading received - benchmark timer started");
            now
        });

        state.total_readings += 1;
        if anomalous {
            state.anomalies += 1;
        }

        state.window_sum += reading.power;
        state.window_len += 1;
        if state.window_len >= self.sum_interval {
            state.total_sums += 1;
            info!(
                "Sum {} of {} power readings: {:.2} WATTS",
                state.total_sums, self.sum_interval, state.window_sum
            );
            state.window_sum = 0.0;
            state.window_len = 0;
        }

        let total = state.total_readings;
        if !self.config.quiet && total % self.log_interval == 0 {
            let secs = now.duration_since(started).as_secs_f64();
            let rate = if secs > 0.0 { total as f64 / secs } else { 0.0 };
            info!(
                "Processed {} readings ({:.1} readings/sec, {} sums completed)",
                total, rate, state.total_sums
            );
        }

        let reached = match (self.config.benchmark_target, self.config.benchmark_sum_target) {
            (Some(target), _) => total >= target,
            (None, Some(target)) => state.total_sums >= target,
            (None, None) => false,
        };
        if !reached || state.finished {
            return None;
        }

        state.finished = true;
        Some(Completion {
            seconds: now.duration_since(started).as_secs_f64(),
            total_readings: total,
            total_sums: state.total_sums,
            anomalies: state.anomalies,
            decode_errors: state.decode_errors,
        })
    }

    /// Counts a payload that failed to decrypt or parse; returns the total.
    pub fn record_decode_error(&self) -> u64 {
        let mut state = self.state.lock();
        state.decode_errors += 1;
        state.decode_errors
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        let state = self.state.lock();
        AggregatorSnapshot {
            total_readings: state.total_readings,
            total_sums: state.total_sums,
            anomalies: state.anomalies,
            decode_errors: state.decode_errors,
            elapsed: state.first_reading.map(|t| t.elapsed()),
            finished: state.finished,
        }
    }

    pub fn run_metrics(&self, completion: &Completion, devices_seen: usize) -> RunMetrics {
        let throughput_rps = if completion.seconds > 0.0 {
            completion.total_readings as f64 / completion.seconds
        } else {
            0.0
        };

        RunMetrics {
            seconds: completion.seconds,
            throughput_rps,
            total_readings: completion.total_readings,
            benchmark_target: self.config.benchmark_target.unwrap_or(0),
            total_sums: completion.total_sums,
            benchmark_sum_target: self.config.benchmark_sum_target,
            devices_seen,
            anomalies: completion.anomalies,
            decode_errors: completion.decode_errors,
            finished_at: Utc::now().to_rfc3339(),
        }
    }
}
