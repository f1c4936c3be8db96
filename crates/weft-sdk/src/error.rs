//! Error types for the Weft SDK.

use std::fmt;
use weft_delta::DeltaError;
use weft_runtime::{RuntimeError, StorageError};

/// Error type for SDK operations.
#[derive(Debug)]
pub enum SdkError {
    /// Channel not found, or not of the requested type.
    ChannelNotFound(String),
    /// The client is not connected to the ordering service.
    NotConnected,
    /// Connection failed.
    ConnectionFailed(String),
    /// The ordering service refused a request.
    Ordering(String),
    /// Error from the container runtime.
    Runtime(String),
    /// Error from a channel's delta connection.
    Delta(String),
    /// Storage error.
    Storage(String),
    /// Serialization error.
    SerializationError(String),
    /// Internal error.
    Internal(String),
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdkError::ChannelNotFound(id) => write!(f, "Channel not found: {}", id),
            SdkError::NotConnected => write!(f, "Not connected"),
            SdkError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            SdkError::Ordering(e) => write!(f, "Ordering error: {}", e),
            SdkError::Runtime(e) => write!(f, "Runtime error: {}", e),
            SdkError::Delta(e) => write!(f, "Delta error: {}", e),
            SdkError::Storage(e) => write!(f, "Storage error: {}", e),
            SdkError::SerializationError(e) => write!(f, "Serialization error: {}", e),
            SdkError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for SdkError {}

impl From<RuntimeError> for SdkError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ChannelNotFound(id) => SdkError::ChannelNotFound(id),
            RuntimeError::Storage(e) => SdkError::Storage(e.to_string()),
            RuntimeError::Serialization(e) => SdkError::SerializationError(e),
            other => SdkError::Runtime(other.to_string()),
        }
    }
}

impl From<DeltaError> for SdkError {
    fn from(err: DeltaError) -> Self {
        SdkError::Delta(err.to_string())
    }
}

impl From<StorageError> for SdkError {
    fn from(err: StorageError) -> Self {
        SdkError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::SerializationError(err.to_string())
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
