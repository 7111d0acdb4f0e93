//! Volatile backend used by tests and embedders that need no persistence.

use std::collections::{BTreeMap, HashMap};

use crate::document::{Document, Fields};
use crate::engine::{Backend, Change};
use crate::error::Result;

/// Collections of documents kept in ordinary maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: HashMap<String, BTreeMap<String, Fields>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored documents across all collections.
    pub fn document_count(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }
}

impl Backend for MemoryBackend {
    fn load(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&mut self, changes: &[Change]) -> Result<()> {
        for change in changes {
            match change {
                Change::Put {
                    collection,
                    id,
                    fields,
                } => {
                    self.collections
                        .entry(collection.clone())
                        .or_default()
                        .insert(id.clone(), fields.clone());
                }
                Change::Remove { collection, id } => {
                    if let Some(docs) = self.collections.get_mut(collection) {
                        docs.remove(id);
                    }
                }
            }
        }
        Ok(())
    }
}
