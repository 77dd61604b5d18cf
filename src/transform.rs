//! Row transform: source record → ordered column tuple.
//!
//! [`map_row`] is pure; the same record, mapping and options always produce
//! the same [`MappedRow`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column layout for one job, read from `mapping.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Target columns, in load order.
    pub columns: Vec<String>,
    /// `source field → target column`.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Maximum length in characters per target column.
    #[serde(default)]
    pub length: BTreeMap<String, usize>,
}

/// Value policy applied while mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    pub null_if_empty: bool,
    pub trim_strings: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            null_if_empty: true,
            trim_strings: false,
        }
    }
}

/// Values aligned to `Mapping::columns`.
pub type MappedRow = Vec<Value>;

impl Mapping {
    /// Source field names needed to populate every column.
    ///
    /// A column fed by one or more `rename` entries contributes those source
    /// names; any other column is read under its own name.
    pub fn source_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for column in &self.columns {
            let mut sources: Vec<&String> = self
                .rename
                .iter()
                .filter(|(_, target)| *target == column)
                .map(|(source, _)| source)
                .collect();
            if sources.is_empty() {
                sources.push(column);
            }
            for source in sources {
                if !fields.contains(source) {
                    fields.push(source.clone());
                }
            }
        }
        fields
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Map one source record into the column order defined by `mapping`.
pub fn map_row(record: &Value, mapping: &Mapping, options: MapOptions) -> MappedRow {
    let mut renamed: Map<String, Value> = match record {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (source, target) in &mapping.rename {
        if let Some(value) = renamed.get(source).cloned() {
            renamed.insert(target.clone(), value);
        }
    }

    mapping
        .columns
        .iter()
        .map(|column| {
            let max_len = mapping.length.get(column).copied();
            normalize_value(renamed.get(column), max_len, options)
        })
        .collect()
}

/// Zip a mapped row back into a JSON object keyed by column.
pub fn to_object(mapping: &Mapping, row: &[Value]) -> Map<String, Value> {
    mapping
        .columns
        .iter()
        .cloned()
        .zip(row.iter().cloned())
        .collect()
}

fn normalize_value(value: Option<&Value>, max_len: Option<usize>, options: MapOptions) -> Value {
    let value = match value {
        None | Some(Value::Null) => return Value::Null,
        Some(value) => value,
    };

    let text = match (value, max_len) {
        (Value::String(s), _) => s.clone(),
        (other, Some(_)) => other.to_string(),
        (other, None) => return other.clone(),
    };

    let text = if options.trim_strings {
        text.trim().to_string()
    } else {
        text
    };

    if text.is_empty() && options.null_if_empty {
        return Value::Null;
    }

    match max_len {
        Some(max) if text.chars().count() > max => Value::String(text.chars().take(max).collect()),
        _ => Value::String(text),
    }
}
