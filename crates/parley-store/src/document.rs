//! Documents, paths and JSON value helpers.
//!
//! A document is an id plus a JSON object of fields.  Nested collections are
//! addressed with slash-separated paths (`chats/{chatId}/messages/{id}`), so a
//! collection path always has an odd number of segments and a document path
//! an even number.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// The field map of a document.
pub type Fields = Map<String, Value>;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a (possibly dotted) field path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.fields, path)
    }

    /// The fields plus an `id` entry, ready for `serde_json::from_value`.
    pub fn to_value_with_id(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }
}

/// Address of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `collection/id` (collection may itself be nested).
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 2
            || segments.len() % 2 != 0
            || segments.iter().any(|s| s.is_empty())
        {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let (id, collection) = segments
            .split_last()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        Ok(Self::new(collection.join("/"), *id))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let collection_ok = !self.collection.is_empty()
            && self.collection.split('/').count() % 2 == 1
            && self.collection.split('/').all(|s| !s.is_empty());
        if !collection_ok || self.id.is_empty() || self.id.contains('/') {
            return Err(StoreError::InvalidPath(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Resolve a dotted path inside a field map.
pub fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Total order over JSON values used for `order_by` and cursors.
///
/// Missing and null sort first, then booleans, numbers, strings, arrays and
/// objects.  Arrays and objects compare equal within their own rank.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
