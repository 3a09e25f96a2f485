//! Trigger catalog - parsed, indexed trigger definitions.
//!
//! The catalog is immutable after [`TriggerCatalog::parse`]. Reloading means
//! parsing a new catalog and swapping the whole value; nothing is updated
//! in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::entities::{
    FieldCondition, FieldMatch, MatchPredicate, RegexPattern, RowChange, TriggerDefinition,
    WriteTarget,
};
use crate::error::ParseError;
use crate::value_objects::PromptTemplate;

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "table",
    "match",
    "prompt_template",
    "model",
    "write_target",
    "concurrency_key",
];

#[derive(Debug, Clone, Default)]
pub struct TriggerCatalog {
    by_name: BTreeMap<String, Arc<TriggerDefinition>>,
    /// table -> triggers on that table, ordered by name
    by_table: HashMap<String, Vec<Arc<TriggerDefinition>>>,
}

impl TriggerCatalog {
    /// Parse a triggers document (JSON array of definitions).
    pub fn parse(document: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(document)
            .map_err(|e| ParseError::document(format!("invalid JSON: {e}")))?;
        let Value::Array(entries) = value else {
            return Err(ParseError::document(
                "expected a JSON array of trigger definitions",
            ));
        };

        let mut definitions = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            definitions.push(parse_entry(index, entry)?);
        }
        Self::from_definitions_indexed(definitions)
    }

    /// Build a catalog from already-validated definitions.
    pub fn from_definitions(definitions: Vec<TriggerDefinition>) -> Result<Self, ParseError> {
        Self::from_definitions_indexed(definitions.into_iter().enumerate().collect())
    }

    fn from_definitions_indexed(
        definitions: Vec<(usize, TriggerDefinition)>,
    ) -> Result<Self, ParseError> {
        let mut by_name = BTreeMap::new();
        for (index, definition) in definitions {
            let name = definition.name.clone();
            if by_name.insert(name.clone(), Arc::new(definition)).is_some() {
                return Err(ParseError::entry(
                    index,
                    Some(&name),
                    "name",
                    "duplicate trigger name",
                ));
            }
        }

        let mut by_table: HashMap<String, Vec<Arc<TriggerDefinition>>> = HashMap::new();
        for definition in by_name.values() {
            by_table
                .entry(definition.table.clone())
                .or_default()
                .push(Arc::clone(definition));
        }

        Ok(Self { by_name, by_table })
    }

    /// All definitions whose table and predicate match the change, by name.
    pub fn resolve(&self, change: &RowChange) -> Vec<Arc<TriggerDefinition>> {
        self.by_table
            .get(&change.table)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|t| t.predicate.matches(change))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TriggerDefinition>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TriggerDefinition>> {
        self.by_name.values()
    }
}

fn parse_entry(index: usize, entry: Value) -> Result<(usize, TriggerDefinition), ParseError> {
    let Value::Object(mut obj) = entry else {
        return Err(ParseError::entry(index, None, "-", "entry must be a JSON object"));
    };

    // Read the name first so every later error can mention it.
    let name = required_string(index, None, &mut obj, "name")?;
    let name_ref = Some(name.as_str());
    if name.trim().is_empty() {
        return Err(ParseError::entry(index, name_ref, "name", "must not be empty"));
    }

    if let Some(unknown) = obj.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
        return Err(ParseError::entry(
            index,
            name_ref,
            unknown.clone(),
            "unknown field",
        ));
    }

    let table = required_string(index, name_ref, &mut obj, "table")?;
    let prompt_source = required_string(index, name_ref, &mut obj, "prompt_template")?;
    let prompt_template = PromptTemplate::parse(prompt_source)
        .map_err(|e| ParseError::entry(index, name_ref, "prompt_template", e.to_string()))?;

    let write_target: WriteTarget = required_string(index, name_ref, &mut obj, "write_target")?
        .parse()
        .map_err(|e: crate::DomainError| {
            ParseError::entry(index, name_ref, "write_target", e.to_string())
        })?;

    let model = optional_string(index, name_ref, &mut obj, "model")?
        .filter(|m| !m.trim().is_empty());

    let concurrency_key = match optional_string(index, name_ref, &mut obj, "concurrency_key")? {
        Some(key) => PromptTemplate::parse(key)
            .map_err(|e| ParseError::entry(index, name_ref, "concurrency_key", e.to_string()))?,
        None => PromptTemplate::parse(name.replace('{', "{{").replace('}', "}}"))
            .map_err(|e| ParseError::entry(index, name_ref, "name", e.to_string()))?,
    };

    let predicate = match obj.remove("match") {
        None | Some(Value::Null) => MatchPredicate::any(),
        Some(Value::Object(fields)) => parse_predicate(index, name_ref, fields)?,
        Some(_) => {
            return Err(ParseError::entry(
                index,
                name_ref,
                "match",
                "must be an object of field -> predicate",
            ))
        }
    };

    Ok((
        index,
        TriggerDefinition {
            name,
            table,
            predicate,
            prompt_template,
            model,
            write_target,
            concurrency_key,
        },
    ))
}

fn parse_predicate(
    index: usize,
    name: Option<&str>,
    fields: Map<String, Value>,
) -> Result<MatchPredicate, ParseError> {
    let mut matches = Vec::with_capacity(fields.len());
    for (field, spec) in fields {
        let path = format!("match.{field}");
        let condition = parse_condition(spec)
            .map_err(|message| ParseError::entry(index, name, path, message))?;
        matches.push(FieldMatch { field, condition });
    }
    Ok(MatchPredicate::new(matches))
}

fn parse_condition(spec: Value) -> Result<FieldCondition, String> {
    match spec {
        Value::String(s) => Ok(FieldCondition::Equals(s)),
        Value::Number(n) => Ok(FieldCondition::Equals(n.to_string())),
        Value::Bool(b) => Ok(FieldCondition::Equals(b.to_string())),
        Value::Null => Err("null is not a predicate; use {\"exists\": false}".to_string()),
        Value::Array(_) => Err("arrays are not supported as predicates".to_string()),
        Value::Object(obj) => {
            if obj.len() != 1 {
                return Err(
                    "predicate object must have exactly one of 'equals', 'exists', 'regex'"
                        .to_string(),
                );
            }
            let Some((kind, arg)) = obj.into_iter().next() else {
                return Err("empty predicate object".to_string());
            };
            match (kind.as_str(), arg) {
                ("equals", Value::String(s)) => Ok(FieldCondition::Equals(s)),
                ("equals", Value::Number(n)) => Ok(FieldCondition::Equals(n.to_string())),
                ("equals", Value::Bool(b)) => Ok(FieldCondition::Equals(b.to_string())),
                ("equals", _) => Err("'equals' takes a string, number or boolean".to_string()),
                ("exists", Value::Bool(b)) => Ok(FieldCondition::Exists(b)),
                ("exists", _) => Err("'exists' takes a boolean".to_string()),
                ("regex", Value::String(pattern)) => RegexPattern::new(pattern)
                    .map(FieldCondition::Regex)
                    .map_err(|e| e.to_string()),
                ("regex", _) => Err("'regex' takes a string pattern".to_string()),
                (other, _) => Err(format!("unknown predicate kind '{other}'")),
            }
        }
    }
}

fn required_string(
    index: usize,
    name: Option<&str>,
    obj: &mut Map<String, Value>,
    field: &str,
) -> Result<String, ParseError> {
    optional_string(index, name, obj, field)?
        .ok_or_else(|| ParseError::entry(index, name, field, "required field is missing"))
}

fn optional_string(
    index: usize,
    name: Option<&str>,
    obj: &mut Map<String, Value>,
    field: &str,
) -> Result<Option<String>, ParseError> {
    match obj.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ParseError::entry(
            index,
            name,
            field,
            format!("expected a string, found {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
