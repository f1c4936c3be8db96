//! Error types for the container runtime.

use crate::storage::StorageError;
use thiserror::Error;
use weft_core::attributes::AttributesError;
use weft_core::message::SubmitError;
use weft_delta::DeltaError;

/// Errors that can occur in runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container is closed")]
    ClosedContainer,

    #[error("unresolved channel type: {0}")]
    UnresolvedType(String),

    #[error("malformed package path: {0}")]
    MalformedPackagePath(String),

    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    #[error("channel {id} already exists with type {existing}, requested {requested}")]
    ChannelTypeMismatch {
        id: String,
        existing: String,
        requested: String,
    },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel {id} failed to load: {reason}")]
    ChannelLoadFailed { id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("attributes error: {0}")]
    Attributes(#[from] AttributesError),

    #[error("delta connection error: {0}")]
    Delta(DeltaError),

    #[error("submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RuntimeError {
    /// Whether the container instance can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::ProtocolInvariantViolation(_))
    }
}

impl From<DeltaError> for RuntimeError {
    fn from(err: DeltaError) -> Self {
        if err.is_protocol_violation() {
            RuntimeError::ProtocolInvariantViolation(err.to_string())
        } else {
            RuntimeError::Delta(err)
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
