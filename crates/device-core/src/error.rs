//! Error types for the device layer

use thiserror::Error;

/// Errors that can occur in the device registry and store
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device is not known to the registry
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Group is not known to the registry
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
