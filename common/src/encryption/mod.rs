pub mod cipher;
pub mod error;
pub mod keys;

pub use cipher::{CipherCodec, IvMode};
pub use error::EncryptionError;
pub use keys::{derive_device_key, DeviceKey, KeyStore};
