//! Error types for port operations.

use std::time::Duration;

/// Errors from the persistent store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store reported busy/locked. Retried inside the state source; only
    /// surfaces once the busy retry budget is spent.
    #[error("Store busy in {operation}: {message}")]
    Busy {
        operation: &'static str,
        message: String,
    },

    /// Write-back target is locked by a conflicting writer, gone, or consumed.
    /// Never retried: the target is considered stale.
    #[error("Write conflict on {target} for tag '{tag}': {reason}")]
    WriteConflict {
        target: String,
        tag: String,
        reason: String,
    },

    /// Database operation failed - includes operation name for tracing.
    #[error("Database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// Row read from the store does not fit the configured schema.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Create a Database error with operation context.
    pub fn database(operation: &'static str, message: impl ToString) -> Self {
        Self::Database {
            operation,
            message: message.to_string(),
        }
    }

    pub fn busy(operation: &'static str, message: impl ToString) -> Self {
        Self::Busy {
            operation,
            message: message.to_string(),
        }
    }

    pub fn write_conflict(
        target: impl ToString,
        tag: impl ToString,
        reason: impl ToString,
    ) -> Self {
        Self::WriteConflict {
            target: target.to_string(),
            tag: tag.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}

/// Errors from the inference backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Model error: {0}")]
    ModelError(String),
}

impl InferenceError {
    pub fn unavailable(message: impl ToString) -> Self {
        Self::BackendUnavailable(message.to_string())
    }

    pub fn model(message: impl ToString) -> Self {
        Self::ModelError(message.to_string())
    }
}
