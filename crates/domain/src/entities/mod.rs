//! Domain entities

mod dispatch_job;
mod row_change;
mod trigger;

pub use dispatch_job::{DispatchJob, JobState};
pub use row_change::{value_text, RowChange};
pub use trigger::{
    FieldCondition, FieldMatch, MatchPredicate, RegexPattern, TriggerDefinition, WriteTarget,
};
