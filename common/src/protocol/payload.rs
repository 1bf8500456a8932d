use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::compact::{CompactRecord, RECORD_LEN};
use crate::encryption::{CipherCodec, EncryptionError, IvMode, KeyStore};
use crate::types::MeterReading;

/// Payload encoding negotiated out of band; both ends must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProfile {
    /// Compact record under the deterministic per-device IV. 16-byte payload.
    #[default]
    Compact,
    /// Compact record under a random IV carried in front. 32-byte payload.
    CompactRandomIv,
    /// JSON reading under a random IV carried in front.
    Json,
}

impl WireProfile {
    pub fn iv_mode(self) -> IvMode {
        match self {
            WireProfile::Compact => IvMode::Deterministic,
            WireProfile::CompactRandomIv | WireProfile::Json => IvMode::Random,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WireProfile::Compact => "compact",
            WireProfile::CompactRandomIv => "compact-random-iv",
            WireProfile::Json => "json",
        }
    }
}

impl fmt::Display for WireProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(WireProfile::Compact),
            "compact-random-iv" => Ok(WireProfile::CompactRandomIv),
            "json" => Ok(WireProfile::Json),
            other => Err(format!(
                "unknown profile '{}', expected compact, compact-random-iv or json",
                other
            )),
        }
    }
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error(transparent)]
    Cipher(#[from] EncryptionError),

    #[error("Record error: {0}")]
    Record(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device mismatch: frame says {header}, payload says {payload}")]
    DeviceMismatch { header: String, payload: String },
}

/// Turns readings into encrypted payloads and back for one profile.
#[derive(Clone)]
pub struct PayloadCodec {
    cipher: CipherCodec,
    profile: WireProfile,
}

impl PayloadCodec {
    pub fn new(keys: Arc<KeyStore>, profile: WireProfile) -> Self {
        Self {
            cipher: CipherCodec::new(keys, profile.iv_mode()),
            profile,
        }
    }

    pub fn profile(&self) -> WireProfile {
        self.profile
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        self.cipher.keys()
    }

    /// Encrypts `reading` for transmission under `device_id`.
    ///
    /// `sequence` only travels in the compact profiles.
    pub fn seal(
        &self,
        device_id: &str,
        reading: &MeterReading,
        sequence: u16,
    ) -> Result<Vec<u8>, PayloadError> {
        let plaintext = match self.profile {
            WireProfile::Compact | WireProfile::CompactRandomIv => {
                CompactRecord::from_reading(reading, sequence).to_bytes().to_vec()
            }
            WireProfile::Json => serde_json::to_vec(reading)?,
        };

        Ok(self.cipher.encode(device_id, &plaintext)?)
    }

    pub fn open(&self, device_id: &str, payload: &[u8]) -> Result<MeterReading, PayloadError> {
        self.open_with_sequence(device_id, payload)
            .map(|(reading, _)| reading)
    }

    /// Like [`open`](Self::open), also returning the record's sequence
    /// number when the profile carries one.
    pub fn open_with_sequence(
        &self,
        device_id: &str,
        payload: &[u8],
    ) -> Result<(MeterReading, Option<u16>), PayloadError> {
        let plaintext = self.cipher.decode(device_id, payload)?;

        match self.profile {
            WireProfile::Compact | WireProfile::CompactRandomIv => {
                let record = CompactRecord::from_bytes(&plaintext).ok_or_else(|| {
                    PayloadError::Record(format!(
                        "expected {} bytes, got {}",
                        RECORD_LEN,
                        plaintext.len()
                    ))
                })?;
                Ok((record.to_reading(device_id), Some(record.sequence)))
            }
            WireProfile::Json => {
                let reading: MeterReading = serde_json::from_slice(&plaintext)?;
                if reading.device_id != device_id {
                    return Err(PayloadError::DeviceMismatch {
                        header: device_id.to_string(),
                        payload: reading.device_id,
                    });
                }
                Ok((reading, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str) -> MeterReading {
        MeterReading {
            device_id: device_id.to_string(),
            timestamp: 1_700_000_000.0,
            voltage: 120.5,
            current: 15.5,
            power: 1867.0,
            frequency: 59.9,
        }
    }

    #[test]
    fn test_profile_names() {
        for profile in [WireProfile::Compact, WireProfile::CompactRandomIv, WireProfile::Json] {
            assert_eq!(profile.to_string().parse::<WireProfile>().unwrap(), profile);
        }
        assert_eq!("JSON".parse::<WireProfile>().unwrap(), WireProfile::Json);
        assert!("xml".parse::<WireProfile>().is_err());
        assert_eq!(
            serde_json::to_string(&WireProfile::CompactRandomIv).unwrap(),
            "\"compact-random-iv\""
        );
    }

    #[test]
    fn test_payload_sizes() {
        let keys = Arc::new(KeyStore::new());
        let reading = sample("meter_000005");

        let compact = PayloadCodec::new(keys.clone(), WireProfile::Compact);
        assert_eq!(compact.seal("meter_000005", &reading, 5).unwrap().len(), 16);

        let random = PayloadCodec::new(keys, WireProfile::CompactRandomIv);
        assert_eq!(random.seal("meter_000005", &reading, 5).unwrap().len(), 32);
    }

    #[test]
    fn test_compact_open_is_lossy_but_faithful_in_range() {
        let codec = PayloadCodec::new(Arc::new(KeyStore::new()), WireProfile::Compact);
        let reading = sample("meter_000005");
        let sealed = codec.seal("meter_000005", &reading, 5).unwrap();

        let (opened, sequence) = codec.open_with_sequence("meter_000005", &sealed).unwrap();
        assert_eq!(sequence, Some(5));
        assert_eq!(opened.voltage, 120.5);
        assert_eq!(opened.current, 15.5);
        assert_eq!(opened.power, 1867.0);
        // 599 does not fit in eight bits
        assert_eq!(opened.frequency, f64::from(599u32 as u8) / 10.0);
    }

    #[test]
    fn test_json_profile_roundtrip() {
        let codec = PayloadCodec::new(Arc::new(KeyStore::new()), WireProfile::Json);
        let reading = sample("meter_000009");
        let sealed = codec.seal("meter_000009", &reading, 0).unwrap();
        assert_eq!(codec.open("meter_000009", &sealed).unwrap(), reading);
    }

    #[test]
    fn test_json_profile_rejects_foreign_device() {
        let codec = PayloadCodec::new(Arc::new(KeyStore::new()), WireProfile::Json);
        // Sealed for meter_000009 but claiming a different id inside.
        let sealed = codec.seal("meter_000009", &sample("meter_000010"), 0).unwrap();
        assert!(matches!(
            codec.open("meter_000009", &sealed),
            Err(PayloadError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_plaintext_length_is_record_error() {
        let keys = Arc::new(KeyStore::new());
        let raw = CipherCodec::new(keys.clone(), IvMode::Deterministic);
        let ciphertext = raw.encode("meter_000001", b"twelve bytes").unwrap();

        let codec = PayloadCodec::new(keys, WireProfile::Compact);
        assert!(matches!(
            codec.open("meter_000001", &ciphertext),
            Err(PayloadError::Record(_))
        ));
    }
}
