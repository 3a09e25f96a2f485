//! NWN Bridge engine library.
//!
//! Watches the game database for changes, dispatches matching triggers to a
//! local model and writes the responses back.
//!
//! ## Structure
//!
//! - `infrastructure/` - Ports plus SQLite, Ollama, backend process and config adapters
//! - `use_cases/` - Dispatch scheduler and catalog reload
//! - `app` - Application composition

pub mod app;
pub mod infrastructure;
pub mod use_cases;

pub use app::{run, BridgeArgs, RunError};
