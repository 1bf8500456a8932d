//! Per-device key derivation and caching.
//!
//! Keys are a pure function of the device identifier so that a meter can
//! recompute its own key without any handshake. Anyone who knows the
//! identifier can do the same; this is only acceptable inside the closed
//! simulation.

use log::debug;
use parking_lot::RwLock;
use rayon::prelude::*;
use ring::pbkdf2;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const KEY_PREFIX: &str = "smart_meter_";

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

pub type DeviceKey = [u8; KEY_LEN];

/// Salt is the identifier's first 16 bytes, right-padded with ASCII `'0'`.
pub fn device_salt(device_id: &str) -> [u8; SALT_LEN] {
    let mut salt = [b'0'; SALT_LEN];
    let bytes = device_id.as_bytes();
    let len = bytes.len().min(SALT_LEN);
    salt[..len].copy_from_slice(&bytes[..len]);
    salt
}

/// PBKDF2-HMAC-SHA256, 100 000 iterations, over `"smart_meter_" + id`.
pub fn derive_device_key(device_id: &str) -> DeviceKey {
    let salt = device_salt(device_id);
    let password = format!("{}{}", KEY_PREFIX, device_id);
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        &salt,
        password.as_bytes(),
        &mut key,
    );
    key
}

/// Process-wide cache of derived device keys.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<String, Arc<DeviceKey>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached key without deriving.
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceKey>> {
        self.keys.read().get(device_id).cloned()
    }

    /// Returns the key for `device_id`, deriving it on first use.
    ///
    /// Derivation runs outside the lock. If two callers race on the same
    /// identifier the first insert wins; both computed the same bytes.
    pub fn get_or_derive(&self, device_id: &str) -> Arc<DeviceKey> {
        if let Some(key) = self.get(device_id) {
            return key;
        }

        let key = Arc::new(derive_device_key(device_id));
        let mut keys = self.keys.write();
        keys.entry(device_id.to_string())
            .or_insert_with(|| {
                debug!("Derived key for device {}", device_id);
                key
            })
            .clone()
    }

    /// Derives every missing key in parallel. Blocking; call from a
    /// blocking context when running inside the async runtime.
    pub fn preload<I, S>(&self, device_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let missing: Vec<String> = device_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .filter(|id| self.get(id).is_none())
            .collect();

        let derived: Vec<(String, DeviceKey)> = missing
            .into_par_iter()
            .map(|id| {
                let key = derive_device_key(&id);
                (id, key)
            })
            .collect();

        let count = derived.len();
        let mut keys = self.keys.write();
        for (id, key) in derived {
            keys.entry(id).or_insert_with(|| Arc::new(key));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_salt_padding() {
        assert_eq!(&device_salt("meter_000042"), b"meter_0000420000");
        assert_eq!(&device_salt("a"), b"a000000000000000");
        assert_eq!(&device_salt("meter_000000_long_identifier"), b"meter_000000_lon");
    }

    #[test]
    fn test_known_key_vector() {
        let key = derive_device_key("meter_000042");
        assert_eq!(
            hex(&key),
            "e21bcf3b64ac9e584098b3713e70ae38e653d63291517916769cdd67ebe83d6e"
        );
    }

    #[test]
    fn test_derivation_is_pure() {
        assert_eq!(derive_device_key("meter_000007"), derive_device_key("meter_000007"));
        assert_ne!(derive_device_key("meter_000007"), derive_device_key("meter_000008"));
    }

    #[test]
    fn test_store_caches_keys() {
        let store = KeyStore::new();
        assert!(store.get("meter_000001").is_none());

        let first = store.get_or_derive("meter_000001");
        let second = store.get_or_derive("meter_000001");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_first_access() {
        let store = Arc::new(KeyStore::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || *store.get_or_derive("meter_000009"))
            })
            .collect();

        let keys: Vec<DeviceKey> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_preload_skips_cached() {
        let store = KeyStore::new();
        store.get_or_derive("meter_000000");
        let derived = store.preload(["meter_000000", "meter_000001", "meter_000002"]);
        assert_eq!(derived, 2);
        assert_eq!(store.len(), 3);
    }
}
