//! Flat records shared by every source.
//!
//! A [`Record`] is a string-keyed mapping of [`Value`]s tagged with the
//! collection it came from and its identifier inside that collection.
//! Nested structures (authors, file locations, ...) are kept as
//! `Value::Record` / `Value::List` and addressed with dotted paths such as
//! `authors.0.family_names`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field map used by records and merged rows.
pub type Fields = BTreeMap<String, Value>;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Record(Fields),
}

impl Value {
    /// Null, blank text or an empty list.
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            Value::List(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Follow a dotted path. Numeric segments index into lists.
    pub fn path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                Value::Record(fields) => fields.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Text items of a list value, skipping non-text entries.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Value::List(items) => items.iter().filter_map(Value::as_str).collect(),
            Value::Text(s) => vec![s.as_str()],
            _ => Vec::new(),
        }
    }

    /// Flat string form used by CSV output.
    pub fn to_flat_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_flat_string)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
            Value::Record(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Record(fields)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Read access to named fields, shared by [`Record`] and merged rows.
pub trait FieldAccess {
    fn field(&self, key: &str) -> Option<&Value>;

    /// Trimmed, non-empty text of a field.
    fn text(&self, key: &str) -> Option<&str> {
        self.field(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One harvested or fetched entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source_collection: String,
    pub identifier: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    pub fn new(source_collection: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            source_collection: source_collection.into(),
            identifier: identifier.into(),
            fields: Fields::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Dotted-path lookup, first segment being the field name.
    pub fn path(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, rest),
            None => (path, ""),
        };
        self.fields.get(head)?.path(rest)
    }
}

impl FieldAccess for Record {
    fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_collection, self.identifier)
    }
}
