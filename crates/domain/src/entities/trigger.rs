//! Trigger entities - rules mapping row changes to prompts and write targets

use std::fmt;
use std::str::FromStr;

use regex_lite::Regex;

use super::row_change::RowChange;
use crate::error::DomainError;
use crate::value_objects::{PromptTemplate, RenderedPrompt, SqlIdentifier};
use crate::ConcurrencyKey;

/// Compiled regular expression that compares by its source pattern.
#[derive(Debug, Clone)]
pub struct RegexPattern {
    pattern: String,
    regex: Regex,
}

impl RegexPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, DomainError> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)
            .map_err(|e| DomainError::validation(format!("invalid regex '{pattern}': {e}")))?;
        Ok(Self { pattern, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for RegexPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for RegexPattern {}

/// Condition on a single changed field.
///
/// A closed set of predicate kinds keeps matching total and side-effect free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldCondition {
    /// Field text equals the value (numbers and booleans compare by spelling)
    Equals(String),
    /// Field is present and non-null (`true`) or absent/null (`false`)
    Exists(bool),
    /// Field text matches the pattern (unanchored unless the pattern anchors)
    Regex(RegexPattern),
}

impl FieldCondition {
    pub fn holds(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (FieldCondition::Equals(expected), Some(actual)) => expected == actual,
            (FieldCondition::Exists(expected), value) => *expected == value.is_some(),
            (FieldCondition::Regex(pattern), Some(actual)) => pattern.is_match(actual),
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub field: String,
    pub condition: FieldCondition,
}

/// Conjunction of field conditions. Empty matches every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPredicate {
    fields: Vec<FieldMatch>,
}

impl MatchPredicate {
    pub fn new(mut fields: Vec<FieldMatch>) -> Self {
        fields.sort_by(|a, b| a.field.cmp(&b.field));
        Self { fields }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        self.fields.iter().all(|m| {
            let text = change.field_text(&m.field);
            m.condition.holds(text.as_deref())
        })
    }
}

/// `table.column` the response is written into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteTarget {
    pub table: SqlIdentifier,
    pub column: SqlIdentifier,
}

impl WriteTarget {
    pub fn new(table: SqlIdentifier, column: SqlIdentifier) -> Self {
        Self { table, column }
    }
}

impl FromStr for WriteTarget {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (table, column) = s.split_once('.').ok_or_else(|| {
            DomainError::validation(format!("'{s}' must have the form table.column"))
        })?;
        Ok(Self {
            table: SqlIdentifier::new(table)?,
            column: SqlIdentifier::new(column)?,
        })
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// A named rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDefinition {
    pub name: String,
    /// Table whose changes this trigger watches
    pub table: String,
    pub predicate: MatchPredicate,
    pub prompt_template: PromptTemplate,
    /// Model override; `None` uses the bridge's default model
    pub model: Option<String>,
    pub write_target: WriteTarget,
    /// Rendered per change; defaults to the trigger name
    pub concurrency_key: PromptTemplate,
}

impl TriggerDefinition {
    pub fn matches(&self, change: &RowChange) -> bool {
        self.table == change.table && self.predicate.matches(change)
    }

    pub fn render_prompt(&self, change: &RowChange) -> RenderedPrompt {
        self.prompt_template.render(|name| self.placeholder(change, name))
    }

    pub fn concurrency_key_for(&self, change: &RowChange) -> ConcurrencyKey {
        let rendered = self
            .concurrency_key
            .render(|name| self.placeholder(change, name));
        ConcurrencyKey::new(rendered.text)
    }

    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default)
    }

    fn placeholder(&self, change: &RowChange, name: &str) -> Option<String> {
        if name == "trigger" {
            return Some(self.name.clone());
        }
        change.placeholder(name)
    }
}
