use chrono::{DateTime, Utc};
use common::encryption::{DeviceKey, KeyStore};
use common::Result;
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub first_seen: DateTime<Utc>,
    /// Sequence number carried by the first compact record.
    pub first_sequence: Option<u16>,
    pub readings: u64,
    mismatch_reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Consistent,
    /// Reported once per device.
    Mismatch { first: u16, got: u16 },
}

/// Devices known to the collector, plus their keys.
///
/// Unknown identifiers are admitted on first contact. The first derivation
/// of a key runs on the blocking pool.
pub struct DeviceRegistry {
    keys: Arc<KeyStore>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self {
            keys,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Key for `device_id`, deriving it off the async workers if needed.
    pub async fn resolve(&self, device_id: &str) -> Result<Arc<DeviceKey>> {
        if let Some(key) = self.keys.get(device_id) {
            return Ok(key);
        }

        let keys = self.keys.clone();
        let id = device_id.to_string();
        let key = tokio::task::spawn_blocking(move || keys.get_or_derive(&id)).await?;
        info!("Registered device {}", device_id);
        Ok(key)
    }

    /// Records one accepted reading and checks its sequence number against
    /// the first one seen for the device.
    pub fn observe(&self, device_id: &str, sequence: Option<u16>) -> SequenceCheck {
        let mut devices = self.devices.write();
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                first_seen: Utc::now(),
                first_sequence: sequence,
                readings: 0,
                mismatch_reported: false,
            });
        record.readings += 1;

        match (record.first_sequence, sequence) {
            (Some(first), Some(got)) if first != got && !record.mismatch_reported => {
                record.mismatch_reported = true;
                SequenceCheck::Mismatch { first, got }
            }
            (None, Some(_)) => {
                record.first_sequence = sequence;
                SequenceCheck::Consistent
            }
            _ => SequenceCheck::Consistent,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }

    /// Devices that delivered at least one valid reading.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
