//! Error types for hookbus.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! exact failure: a caller mistake at `emit`, a frame that failed to encode, a
//! message refused by the publish buffer, or a configuration that never let the
//! bridge start.

use thiserror::Error;

use crate::event::{EventKind, PayloadTag};

/// Invalid broker or bridge configuration supplied at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration field '{field}' must not be empty")]
    EmptyField {
        field: String,
    },

    #[error("Configuration field '{field}' is invalid: {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Failed to read configuration: {message}")]
    Load {
        message: String,
    },
}

/// Failure to turn one event into a wire message.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Frame ({side}) has zero size ({width}x{height}, {len} bytes)")]
    EmptyFrame {
        side: &'static str,
        width: u32,
        height: u32,
        len: usize,
    },

    #[error("Frame ({side}) buffer holds {actual} bytes, expected {expected}")]
    BufferMismatch {
        side: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Frame ({side}) dimensions {width}x{height} are too large to address")]
    DimensionOverflow {
        side: &'static str,
        width: u32,
        height: u32,
    },

    #[error("Image encoding failed: {message}")]
    Encode {
        message: String,
    },

    #[error("JSON encoding failed: {message}")]
    Json {
        message: String,
    },
}

/// Reason a message was refused by a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishRejected {
    #[error("Send buffer full ({buffered_messages} messages, {buffered_bytes} bytes)")]
    Backpressure {
        buffered_messages: usize,
        buffered_bytes: usize,
    },

    #[error("Message of {size} bytes exceeds maximum of {max} bytes")]
    Oversize {
        size: usize,
        max: usize,
    },

    #[error("Publisher is closed")]
    Closed,
}

/// Top-level error type for hookbus.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Invalid event type: {kind:?} cannot carry a {payload:?} payload")]
    InvalidEventType {
        kind: EventKind,
        payload: PayloadTag,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Publish rejected: {0}")]
    PublishRejected(#[from] PublishRejected),

    #[error("Operation '{operation}' is not supported by this backend")]
    UnsupportedOperation {
        operation: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Event queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Event bus is stopped")]
    BusStopped,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HookError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if the backend does not support the requested operation.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull { .. } => true,
            Self::PublishRejected(r) => matches!(r, PublishRejected::Backpressure { .. }),
            _ => false,
        }
    }
}

/// Result type alias for hookbus operations.
pub type HookResult<T> = Result<T, HookError>;
