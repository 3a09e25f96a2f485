//! Bridge domain: trigger definitions, row changes, and dispatch jobs.
//!
//! Everything here is pure data plus the rules over it. Storage, HTTP and
//! scheduling live in `nwnbridge-engine`.

pub mod catalog;
pub mod entities;
pub mod error;
pub mod ids;
pub mod value_objects;

pub use catalog::TriggerCatalog;
pub use entities::{
    value_text, DispatchJob, FieldCondition, FieldMatch, JobState, MatchPredicate, RegexPattern,
    RowChange, TriggerDefinition, WriteTarget,
};
pub use error::{DomainError, EntryRef, ParseError};
pub use ids::{ConcurrencyKey, JobId, SequenceMarker};
pub use value_objects::{PromptTemplate, RenderedPrompt, SqlIdentifier};
