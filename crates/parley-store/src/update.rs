//! Field-level partial updates.
//!
//! An [`Update`] is an ordered list of operations on field paths, so
//! `unreadCount.bob` can be incremented without touching `unreadCount.alice`.

use std::fmt;

use serde_json::{Map, Value};

use crate::document::Fields;
use crate::error::{Result, StoreError};

/// Path to a possibly nested field.
///
/// Strings are split on `.`.  [`FieldPath::at`] takes the segments as
/// given, so a map key that contains a dot (a user id used as a key)
/// stays a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn at<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Overwrite the field.
    Set(Value),
    /// Atomic numeric add; a missing field counts as 0.
    Increment(i64),
    /// Append values not already present; a missing field becomes an array.
    ArrayUnion(Vec<Value>),
    /// Remove the field if present.
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<(FieldPath, FieldOp)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        self.ops.push((path.into(), FieldOp::Set(value.into())));
        self
    }

    pub fn increment(mut self, path: impl Into<FieldPath>, by: i64) -> Self {
        self.ops.push((path.into(), FieldOp::Increment(by)));
        self
    }

    pub fn array_union(mut self, path: impl Into<FieldPath>, values: Vec<Value>) -> Self {
        self.ops.push((path.into(), FieldOp::ArrayUnion(values)));
        self
    }

    pub fn delete(mut self, path: impl Into<FieldPath>) -> Self {
        self.ops.push((path.into(), FieldOp::Delete));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(FieldPath, FieldOp)] {
        &self.ops
    }

    /// Apply every operation in order.
    pub fn apply(&self, fields: &mut Fields) -> Result<()> {
        for (path, op) in &self.ops {
            apply_op(fields, path, op)?;
        }
        Ok(())
    }
}

fn apply_op(fields: &mut Fields, path: &FieldPath, op: &FieldOp) -> Result<()> {
    let parts: Vec<&str> = path.segments().iter().map(String::as_str).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StoreError::InvalidUpdate(format!("bad field path '{path}'")));
    }
    let (leaf, parents) = parts
        .split_last()
        .ok_or_else(|| StoreError::InvalidUpdate("empty field path".to_string()))?;

    if let FieldOp::Delete = op {
        let mut current = fields;
        for part in parents {
            match current.get_mut(*part).and_then(Value::as_object_mut) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        current.remove(*leaf);
        return Ok(());
    }

    // Walk down, replacing non-object intermediates with empty objects.
    let mut current = fields;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry.as_object_mut() {
            Some(next) => next,
            None => return Err(StoreError::InvalidUpdate(path.to_string())),
        };
    }

    match op {
        FieldOp::Set(value) => {
            current.insert(leaf.to_string(), value.clone());
        }
        FieldOp::Increment(by) => {
            let next = match current.get(*leaf) {
                Some(Value::Number(n)) => match n.as_i64() {
                    Some(i) => Value::from(i + by),
                    None => Value::from(n.as_f64().unwrap_or(0.0) + *by as f64),
                },
                _ => Value::from(*by),
            };
            current.insert(leaf.to_string(), next);
        }
        FieldOp::ArrayUnion(values) => {
            let entry = current
                .entry(leaf.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            if let Some(items) = entry.as_array_mut() {
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
            }
        }
        FieldOp::Delete => unreachable!("handled above"),
    }
    Ok(())
}
