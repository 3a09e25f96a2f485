//! Infrastructure implementations.
//!
//! Contains port trait implementations for external dependencies.

pub mod backend_supervisor;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod ollama;
pub mod ports;
pub mod sqlite_state;
pub mod trigger_file;
