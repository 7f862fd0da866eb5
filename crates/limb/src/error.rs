//! Fabric errors

use std::path::PathBuf;
use std::time::Duration;

use limb_api::{ErrorStatus, ProtocolError};

use crate::types::DeviceKey;

/// Errors returned by fabric operations
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Adaptor {0} not found")]
    AdaptorNotFound(String),

    #[error("Adaptor {0} is stopped")]
    AdaptorStopped(String),

    #[error("Failed to dial adaptor {adaptor} at {}: {source}", path.display())]
    Dial {
        adaptor: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Timed out dialing adaptor {adaptor} after {timeout:?}")]
    DialTimeout { adaptor: String, timeout: Duration },

    #[error("Connection {adaptor}/{device} is closed")]
    ConnectionClosed { adaptor: String, device: DeviceKey },

    #[error("Failed to encode request for device {device}: {source}")]
    Encode {
        device: DeviceKey,
        source: ProtocolError,
    },

    #[error("Failed to send to adaptor {adaptor} for device {device}: {source}")]
    Send {
        adaptor: String,
        device: DeviceKey,
        source: ProtocolError,
    },

    #[error("Adaptor {adaptor} did not stop within {timeout:?}")]
    ReplacementTimeout { adaptor: String, timeout: Duration },

    #[error("Socket directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Socket watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl FabricError {
    /// Wire status reported to a registering plugin
    pub fn to_status(&self) -> ErrorStatus {
        match self {
            FabricError::InvalidArgument(msg) => ErrorStatus::invalid_argument(msg.clone()),
            other => ErrorStatus::internal(other.to_string()),
        }
    }
}

impl From<figment::Error> for FabricError {
    fn from(e: figment::Error) -> Self {
        FabricError::Config(Box::new(e))
    }
}

/// Result type for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;
