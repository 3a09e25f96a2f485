//! DispatchJob entity - one trigger firing for one row change
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!               |
//!               +-----> Failed -> (retry) Pending
//! ```
//!
//! Whether a `Failed` job is retried or abandoned is the scheduler's call;
//! the entity only refuses transitions outside this graph.

use std::fmt;
use std::sync::Arc;

use super::row_change::RowChange;
use super::trigger::TriggerDefinition;
use crate::error::DomainError;
use crate::{ConcurrencyKey, JobId, SequenceMarker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::InFlight => write!(f, "in_flight"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub id: JobId,
    pub trigger: Arc<TriggerDefinition>,
    pub source: Arc<RowChange>,
    pub concurrency_key: ConcurrencyKey,
    state: JobState,
    attempt: u32,
}

impl DispatchJob {
    pub fn new(trigger: Arc<TriggerDefinition>, source: Arc<RowChange>) -> Self {
        let concurrency_key = trigger.concurrency_key_for(&source);
        Self {
            id: JobId::new(),
            trigger,
            source,
            concurrency_key,
            state: JobState::Pending,
            attempt: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Number of times the job has entered `InFlight`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn marker(&self) -> SequenceMarker {
        self.source.marker
    }

    pub fn trigger_name(&self) -> &str {
        &self.trigger.name
    }

    pub fn tag(&self) -> &str {
        &self.source.tag
    }

    /// Pending -> InFlight; counts an attempt.
    pub fn start(&mut self) -> Result<(), DomainError> {
        self.transition(JobState::Pending, JobState::InFlight)?;
        self.attempt += 1;
        Ok(())
    }

    /// InFlight -> Succeeded
    pub fn succeed(&mut self) -> Result<(), DomainError> {
        self.transition(JobState::InFlight, JobState::Succeeded)
    }

    /// InFlight -> Failed
    pub fn fail(&mut self) -> Result<(), DomainError> {
        self.transition(JobState::InFlight, JobState::Failed)
    }

    /// Failed -> Pending
    pub fn retry(&mut self) -> Result<(), DomainError> {
        self.transition(JobState::Failed, JobState::Pending)
    }

    fn transition(&mut self, from: JobState, to: JobState) -> Result<(), DomainError> {
        if self.state != from {
            return Err(DomainError::invalid_state_transition(format!(
                "job {} ({}): cannot move {} -> {}",
                self.id, self.trigger.name, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}
