use std::net::AddrParseError;
use thiserror::Error;
use crate::encryption::error::EncryptionError;
use crate::protocol::{FrameError, PayloadError};

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Encryption error: {0}")]
    EncryptionError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::SerializationError(err.to_string())
    }
}

impl From<AddrParseError> for TelemetryError {
    fn from(err: AddrParseError) -> Self {
        TelemetryError::NetworkError(err.to_string())
    }
}

impl From<EncryptionError> for TelemetryError {
    fn from(err: EncryptionError) -> Self {
        TelemetryError::EncryptionError(err.to_string())
    }
}

impl From<FrameError> for TelemetryError {
    fn from(err: FrameError) -> Self {
        TelemetryError::ProtocolError(err.to_string())
    }
}

impl From<PayloadError> for TelemetryError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Cipher(e) => e.into(),
            other => TelemetryError::ProtocolError(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for TelemetryError {
    fn from(err: tokio::task::JoinError) -> Self {
        TelemetryError::InternalError(err.to_string())
    }
}
