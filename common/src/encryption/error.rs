use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}
