//! Synthetic smart-meter readings following a daily load curve.

use chrono::{Local, TimeZone, Timelike, Utc};
use rand::Rng;
use std::f64::consts::PI;

use crate::types::{device_id_for, MeterReading};

pub const BASE_POWER_W: f64 = 2000.0;
pub const NOMINAL_VOLTAGE: f64 = 120.0;
pub const NOMINAL_FREQUENCY: f64 = 60.0;

/// Load multiplier for a local hour of day: 0.7 at midnight, 1.0 at 06:00
/// and 18:00, 1.3 at noon.
pub fn daily_factor(hour: u32) -> f64 {
    0.7 + 0.3 * (1.0 + ((f64::from(hour) - 6.0) * PI / 12.0).sin())
}

/// Fixed per-device scaling in bulk mode, between 0.8 and 1.196.
pub fn device_factor(index: usize) -> f64 {
    0.8 + 0.4 * (index % 100) as f64 / 100.0
}

/// Local hour of day for a Unix timestamp in seconds.
pub fn local_hour(timestamp: f64) -> u32 {
    Local
        .timestamp_opt(timestamp.floor() as i64, 0)
        .earliest()
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

/// Current time as fractional Unix seconds.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone)]
pub struct ReadingGenerator {
    base_power: f64,
}

impl Default for ReadingGenerator {
    fn default() -> Self {
        Self {
            base_power: BASE_POWER_W,
        }
    }
}

impl ReadingGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_power(base_power: f64) -> Self {
        Self { base_power }
    }

    /// Single-meter reading; device factor is 1.0.
    pub fn generate(&self, device_id: &str, timestamp: f64) -> MeterReading {
        let daily = daily_factor(local_hour(timestamp));
        self.generate_with_rng(&mut rand::thread_rng(), device_id, timestamp, daily, 1.0)
    }

    pub fn generate_with_rng<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        device_id: &str,
        timestamp: f64,
        daily_factor: f64,
        device_factor: f64,
    ) -> MeterReading {
        let noise = rng.gen_range(0.9..=1.1);
        let power = self.base_power * device_factor * daily_factor * noise;
        let voltage = NOMINAL_VOLTAGE + rng.gen_range(-2.0..=2.0);
        let frequency = NOMINAL_FREQUENCY + rng.gen_range(-0.1..=0.1);

        MeterReading {
            device_id: device_id.to_string(),
            timestamp,
            voltage,
            current: power / voltage,
            power,
            frequency,
        }
    }

    /// One reading for each of `meter_000000 .. meter_{count-1}`, all
    /// sharing `timestamp` and its daily factor.
    pub fn generate_bulk(&self, count: usize, timestamp: f64) -> Vec<MeterReading> {
        let daily = daily_factor(local_hour(timestamp));
        let mut rng = rand::thread_rng();

        (0..count)
            .map(|index| {
                self.generate_with_rng(
                    &mut rng,
                    &device_id_for(index),
                    timestamp,
                    daily,
                    device_factor(index),
                )
            })
            .collect()
    }
}
