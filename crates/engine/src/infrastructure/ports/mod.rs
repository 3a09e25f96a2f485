//! Port traits for infrastructure boundaries.
//!
//! These are the ONLY abstractions in the engine. Everything else is concrete types.
//! Ports exist for:
//! - The game database (scan / commit / resume marker)
//! - Inference calls (could swap Ollama -> any OpenAI-compatible server)
//! - Clock (for testing)

mod error;
mod external;
mod testing;

pub use external::{BackendStatus, InferencePort, InferenceRequest, StateSourcePort};

#[cfg(test)]
pub use external::{MockInferencePort, MockStateSourcePort};

pub use testing::ClockPort;

#[cfg(test)]
pub use testing::MockClockPort;

pub use error::{InferenceError, StoreError};
