//! Unified error types for the domain layer
//!
//! `DomainError` covers rule violations inside the bridge's own types
//! (state machine, identifiers, templates). `ParseError` is reserved for the
//! triggers file and always names the entry and field that failed.

use std::fmt;

use thiserror::Error;

/// Unified error type for domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Validation failed (e.g., invalid field values)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Identifier is not usable as a SQL table/column name
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// State transition not allowed
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl DomainError {
    /// Creates a validation error for business rule violations.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid identifier error
    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::InvalidIdentifier(msg.into())
    }

    /// Create an invalid state transition error
    pub fn invalid_state_transition(msg: impl Into<String>) -> Self {
        Self::InvalidStateTransition(msg.into())
    }
}

/// Which entry of the triggers file an error belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    /// The document as a whole (not an array, invalid JSON, ...)
    Document,
    /// Entry by position, with its name when one could be read.
    Entry { index: usize, name: Option<String> },
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::Document => write!(f, "document"),
            EntryRef::Entry {
                index,
                name: Some(name),
            } => write!(f, "entry #{index} ('{name}')"),
            EntryRef::Entry { index, name: None } => write!(f, "entry #{index}"),
        }
    }
}

/// Triggers file rejected while loading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{entry}: field '{field}': {message}")]
pub struct ParseError {
    pub entry: EntryRef,
    pub field: String,
    pub message: String,
}

impl ParseError {
    pub fn document(message: impl Into<String>) -> Self {
        Self {
            entry: EntryRef::Document,
            field: "-".to_string(),
            message: message.into(),
        }
    }

    pub fn entry(
        index: usize,
        name: Option<&str>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entry: EntryRef::Entry {
                index,
                name: name.map(str::to_string),
            },
            field: field.into(),
            message: message.into(),
        }
    }
}
