//! Ordered queries and snapshots.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{compare_values, DocPath, Document};

/// A single predicate over a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the value.
    Eq(String, Value),
    /// Field is an array containing the value.
    ArrayContains(String, Value),
    /// Document id equals the value.
    DocumentId(String),
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, value) => doc.get(field) == Some(value),
            Filter::ArrayContains(field, value) => doc
                .get(field)
                .and_then(Value::as_array)
                .map(|items| items.contains(value))
                .unwrap_or(false),
            Filter::DocumentId(id) => &doc.id == id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Position of the last document of a previous page.
///
/// Carries the id as well as the ordered value so documents sharing the
/// same value are neither skipped nor repeated across pages.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub value: Value,
    pub id: String,
}

impl Cursor {
    pub fn new(value: Value, id: impl Into<String>) -> Self {
        Self {
            value,
            id: id.into(),
        }
    }

    /// Cursor positioned on `doc` for an ordering on `field`.
    pub fn at(doc: &Document, field: &str) -> Self {
        Self::new(doc.get(field).cloned().unwrap_or(Value::Null), doc.id.clone())
    }
}

/// A query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    /// A query matching exactly the document at `path`.
    pub fn document(path: &DocPath) -> Self {
        Self::new(path.collection.clone()).filter(Filter::DocumentId(path.id.clone()))
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(field.into(), value.into()))
    }

    pub fn array_contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::ArrayContains(field.into(), value.into()))
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Compare two `(value, id)` keys in this query's order.
    fn compare_keys(&self, a: (Option<&Value>, &str), b: (Option<&Value>, &str)) -> Ordering {
        let ordering = compare_values(a.0, b.0).then_with(|| a.1.cmp(b.1));
        match self.order_by.as_ref().map(|o| o.direction) {
            Some(Direction::Descending) => ordering.reverse(),
            _ => ordering,
        }
    }

    fn key<'a>(&self, doc: &'a Document) -> (Option<&'a Value>, &'a str) {
        let value = self.order_by.as_ref().and_then(|o| doc.get(&o.field));
        (value, doc.id.as_str())
    }

    /// Filter, order, page and limit a full collection scan.
    pub fn evaluate(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        matched.sort_by(|a, b| self.compare_keys(self.key(a), self.key(b)));

        if let Some(cursor) = &self.start_after {
            let cursor_key = (Some(&cursor.value), cursor.id.as_str());
            matched.retain(|d| self.compare_keys(self.key(d), cursor_key) == Ordering::Greater);
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// The ordered result set of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub docs: Vec<Document>,
}

impl Snapshot {
    pub fn new(docs: Vec<Document>) -> Self {
        Self { docs }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.docs.iter()
    }

    /// Cursor after the last document, for fetching the next page.
    pub fn last_cursor(&self, field: &str) -> Option<Cursor> {
        self.docs.last().map(|d| Cursor::at(d, field))
    }
}
