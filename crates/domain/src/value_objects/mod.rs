//! Value objects shared by trigger definitions and dispatch jobs.

mod identifier;
mod prompt_template;

pub use identifier::SqlIdentifier;
pub use prompt_template::{PromptTemplate, RenderedPrompt};
