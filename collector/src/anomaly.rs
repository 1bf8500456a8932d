use common::MeterReading;
use std::fmt;

pub const MIN_VOLTAGE: f64 = 100.0;
pub const MAX_VOLTAGE: f64 = 140.0;

/// Readings outside normal operating range. Logged and counted, never
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anomaly {
    NegativePower(f64),
    Undervoltage(f64),
    Overvoltage(f64),
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::NegativePower(p) => write!(f, "negative power {:.1}W", p),
            Anomaly::Undervoltage(v) => write!(f, "undervoltage {:.1}V", v),
            Anomaly::Overvoltage(v) => write!(f, "overvoltage {:.1}V", v),
        }
    }
}

pub fn detect(reading: &MeterReading) -> Option<Anomaly> {
    if reading.power < 0.0 {
        Some(Anomaly::NegativePower(reading.power))
    } else if reading.voltage < MIN_VOLTAGE {
        Some(Anomaly::Undervoltage(reading.voltage))
    } else if reading.voltage > MAX_VOLTAGE {
        Some(Anomaly::Overvoltage(reading.voltage))
    } else {
        None
    }
}
