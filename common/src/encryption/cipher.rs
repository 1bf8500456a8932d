//! AES-256-CBC with PKCS#7 padding over per-device keys.

use aes::Aes256;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::error::EncryptionError;
use super::keys::KeyStore;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const BLOCK_SIZE: usize = 16;
pub const IV_LEN: usize = 16;

/// How the initialization vector is chosen for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IvMode {
    /// IV = SHA-256(key || device_id)[..16]. Every message a device sends
    /// uses the same IV, so equal plaintexts give equal ciphertexts.
    Deterministic,
    /// Fresh random IV per message, prepended to the ciphertext.
    Random,
}

/// Static per-device IV used by [`IvMode::Deterministic`].
pub fn deterministic_iv(key: &[u8], device_id: &str) -> [u8; IV_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(device_id.as_bytes());
    let digest = hasher.finalize();

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

pub fn encrypt(
    key: &[u8],
    device_id: &str,
    plaintext: &[u8],
    mode: IvMode,
) -> Result<Vec<u8>, EncryptionError> {
    match mode {
        IvMode::Deterministic => {
            let iv = deterministic_iv(key, device_id);
            encrypt_with_iv(key, &iv, plaintext)
        }
        IvMode::Random => {
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            let ciphertext = encrypt_with_iv(key, &iv, plaintext)?;

            let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len());
            sealed.extend_from_slice(&iv);
            sealed.extend_from_slice(&ciphertext);
            Ok(sealed)
        }
    }
}

pub fn decrypt(
    key: &[u8],
    device_id: &str,
    data: &[u8],
    mode: IvMode,
) -> Result<Vec<u8>, EncryptionError> {
    match mode {
        IvMode::Deterministic => {
            let iv = deterministic_iv(key, device_id);
            decrypt_with_iv(key, &iv, data)
        }
        IvMode::Random => {
            if data.len() < IV_LEN + BLOCK_SIZE {
                return Err(EncryptionError::DecodeError(format!(
                    "Expected IV and at least one block, got {} bytes",
                    data.len()
                )));
            }
            let (iv, ciphertext) = data.split_at(IV_LEN);
            decrypt_with_iv(key, iv, ciphertext)
        }
    }
}

fn encrypt_with_iv(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn decrypt_with_iv(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(EncryptionError::DecodeError(format!(
            "Ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| EncryptionError::DecodeError("Invalid padding".to_string()))
}

/// Encrypts and decrypts on behalf of devices whose keys live in a shared
/// [`KeyStore`].
#[derive(Clone)]
pub struct CipherCodec {
    keys: Arc<KeyStore>,
    mode: IvMode,
}

impl CipherCodec {
    pub fn new(keys: Arc<KeyStore>, mode: IvMode) -> Self {
        Self { keys, mode }
    }

    pub fn mode(&self) -> IvMode {
        self.mode
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn encode(&self, device_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let key = self.keys.get_or_derive(device_id);
        encrypt(key.as_ref(), device_id, plaintext, self.mode)
    }

    pub fn decode(&self, device_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let key = self.keys.get_or_derive(device_id);
        decrypt(key.as_ref(), device_id, ciphertext, self.mode)
    }
}
