//! Fixed-width binary record carried inside the compact wire profile.
//!
//! Layout (big-endian, 13 bytes):
//!
//! | field       | type | scale        |
//! |-------------|------|--------------|
//! | timestamp   | u32  | seconds      |
//! | sequence    | u16  | device index |
//! | voltage     | u16  | V x 10       |
//! | current     | u16  | A x 10       |
//! | power       | u16  | W            |
//! | frequency   | u8   | Hz x 10      |
//!
//! Encoding truncates toward zero and then keeps the low bits of each field,
//! so out-of-range values wrap instead of saturating. Nominal 60 Hz grid
//! frequency (600) therefore travels as 88.

use crate::types::MeterReading;

pub const RECORD_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactRecord {
    pub timestamp: u32,
    pub sequence: u16,
    pub voltage_dv: u16,
    pub current_da: u16,
    pub power_w: u16,
    pub frequency_dhz: u8,
}

// `as` from i64 keeps the low bits, which is the modulo-2^width wrap the
// format relies on.
fn wrap_u32(value: f64) -> u32 {
    value.trunc() as i64 as u32
}

fn wrap_u16(value: f64) -> u16 {
    value.trunc() as i64 as u16
}

fn wrap_u8(value: f64) -> u8 {
    value.trunc() as i64 as u8
}

impl CompactRecord {
    pub fn from_reading(reading: &MeterReading, sequence: u16) -> Self {
        Self {
            timestamp: wrap_u32(reading.timestamp),
            sequence,
            voltage_dv: wrap_u16(reading.voltage * 10.0),
            current_da: wrap_u16(reading.current * 10.0),
            power_w: wrap_u16(reading.power),
            frequency_dhz: wrap_u8(reading.frequency * 10.0),
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        out[4..6].copy_from_slice(&self.sequence.to_be_bytes());
        out[6..8].copy_from_slice(&self.voltage_dv.to_be_bytes());
        out[8..10].copy_from_slice(&self.current_da.to_be_bytes());
        out[10..12].copy_from_slice(&self.power_w.to_be_bytes());
        out[12] = self.frequency_dhz;
        out
    }

    /// Parses a record; `None` unless `data` is exactly [`RECORD_LEN`] bytes.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != RECORD_LEN {
            return None;
        }

        let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Some(Self {
            timestamp: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            sequence: u16_at(4),
            voltage_dv: u16_at(6),
            current_da: u16_at(8),
            power_w: u16_at(10),
            frequency_dhz: data[12],
        })
    }

    pub fn to_reading(&self, device_id: &str) -> MeterReading {
        MeterReading {
            device_id: device_id.to_string(),
            timestamp: f64::from(self.timestamp),
            voltage: f64::from(self.voltage_dv) / 10.0,
            current: f64::from(self.current_da) / 10.0,
            power: f64::from(self.power_w),
            frequency: f64::from(self.frequency_dhz) / 10.0,
        }
    }
}
