//! Prompt templates with `{placeholder}` substitution.
//!
//! Templates are parsed once when the triggers file loads, so a malformed
//! template is rejected with the rest of the file instead of failing jobs
//! later. `{{` and `}}` produce literal braces.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Output of [`PromptTemplate::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub text: String,
    /// Placeholders that had no value and were left verbatim.
    pub missing: Vec<String>,
}

impl PromptTemplate {
    pub fn parse(source: impl Into<String>) -> Result<Self, DomainError> {
        let source = source.into();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        match n {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(DomainError::validation(format!(
                                    "nested '{{' in placeholder starting at byte {pos}"
                                )))
                            }
                            other => name.push(other),
                        }
                    }
                    if !closed {
                        return Err(DomainError::validation(format!(
                            "unclosed '{{' at byte {pos}"
                        )));
                    }
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(DomainError::validation(format!(
                            "empty placeholder at byte {pos}"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => {
                    return Err(DomainError::validation(format!(
                        "unmatched '}}' at byte {pos} (use '}}}}' for a literal brace)"
                    )))
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { source, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of all placeholders in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute placeholders using `lookup`; unknown names stay verbatim.
    pub fn render<F>(&self, lookup: F) -> RenderedPrompt
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut text = String::with_capacity(self.source.len());
        let mut missing = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Placeholder(name) => match lookup(name) {
                    Some(value) => text.push_str(&value),
                    None => {
                        text.push('{');
                        text.push_str(name);
                        text.push('}');
                        missing.push(name.clone());
                    }
                },
            }
        }
        RenderedPrompt { text, missing }
    }
}

impl TryFrom<String> for PromptTemplate {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PromptTemplate> for String {
    fn from(value: PromptTemplate) -> Self {
        value.source
    }
}
