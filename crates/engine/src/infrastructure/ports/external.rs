//! External service port traits (state source, inference backend).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nwnbridge_domain::{RowChange, SequenceMarker, WriteTarget};

use super::error::{InferenceError, StoreError};

// =============================================================================
// State Source
// =============================================================================

/// Narrow read/scan/write view of the game database.
///
/// The store has no push notification, so callers poll `scan` on an
/// interval. Implementations retry transient busy errors internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateSourcePort: Send + Sync {
    /// Changes with marker > `since`, ascending, at most `limit`.
    async fn scan(&self, since: SequenceMarker, limit: usize)
        -> Result<Vec<RowChange>, StoreError>;

    /// Atomically write `value` into `target` for the row identified by `tag`.
    async fn commit(&self, target: &WriteTarget, tag: &str, value: &str)
        -> Result<(), StoreError>;

    /// Current value of `target` for the row identified by `tag`; `None` when
    /// the row is missing or the field is NULL.
    async fn read_field(&self, target: &WriteTarget, tag: &str)
        -> Result<Option<String>, StoreError>;

    /// Persisted resume marker (`SequenceMarker::ORIGIN` when none stored).
    async fn current_marker(&self) -> Result<SequenceMarker, StoreError>;

    /// Durably record the resume marker.
    async fn persist_marker(&self, marker: SequenceMarker) -> Result<(), StoreError>;
}

// =============================================================================
// Inference
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub model: String,
    /// Deadline for the whole call; expiry cancels the request.
    pub timeout: Duration,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            timeout,
        }
    }
}

/// Model backend. Reentrant: concurrent calls are independent, limiting
/// concurrency is the scheduler's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferencePort: Send + Sync {
    async fn generate(&self, request: InferenceRequest) -> Result<String, InferenceError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<(), InferenceError>;

    /// Model names as reported by the backend.
    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;
}

// =============================================================================
// Backend availability
// =============================================================================

/// Liveness of the inference backend as published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Starting,
    Available,
    Unavailable,
    /// Restart budget exhausted; the bridge must stop.
    Failed,
}

impl BackendStatus {
    pub fn is_available(self) -> bool {
        matches!(self, BackendStatus::Available)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Starting => write!(f, "starting"),
            BackendStatus::Available => write!(f, "available"),
            BackendStatus::Unavailable => write!(f, "unavailable"),
            BackendStatus::Failed => write!(f, "failed"),
        }
    }
}
