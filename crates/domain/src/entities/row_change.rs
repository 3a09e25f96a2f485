//! RowChange entity - one detected mutation in the watched store

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SequenceMarker;

/// A change read from the events table since the last scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Game-assigned identifier of the row the event is about
    pub tag: String,
    /// Table the event is about
    pub table: String,
    /// Field name -> new value
    pub changed_fields: BTreeMap<String, Value>,
    pub marker: SequenceMarker,
}

impl RowChange {
    pub fn new(tag: impl Into<String>, table: impl Into<String>, marker: SequenceMarker) -> Self {
        Self {
            tag: tag.into(),
            table: table.into(),
            changed_fields: BTreeMap::new(),
            marker,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changed_fields.insert(name.into(), value.into());
        self
    }

    /// Text form of a changed field; `None` when absent or null.
    pub fn field_text(&self, name: &str) -> Option<String> {
        self.changed_fields.get(name).and_then(value_text)
    }

    /// Value for a prompt placeholder. `tag`, `table` and `marker` shadow
    /// fields of the same name.
    pub fn placeholder(&self, name: &str) -> Option<String> {
        match name {
            "tag" => Some(self.tag.clone()),
            "table" => Some(self.table.clone()),
            "marker" => Some(self.marker.to_string()),
            field => self.field_text(field),
        }
    }
}

/// Text form used for matching and rendering: strings verbatim, other
/// scalars through their JSON spelling, null as absent.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
