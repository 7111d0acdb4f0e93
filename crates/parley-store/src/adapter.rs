//! The remote store boundary consumed by the sync core.
//!
//! Any backend offering ordered document CRUD, field-level updates, atomic
//! batches and live queries can sit behind [`RemoteStore`].  The crate ships
//! [`DocumentStore`](crate::DocumentStore) as an in-process implementation.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::document::{DocPath, Document, Fields};
use crate::error::{Result, StoreError};
use crate::query::{Query, Snapshot};
use crate::update::Update;

/// One operation inside an atomic [`RemoteStore::batch_write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create a document; fails if one already exists at `path`.
    Create { path: DocPath, fields: Fields },
    /// Overwrite, or merge top-level keys into, the document at `path`.
    Set {
        path: DocPath,
        fields: Fields,
        merge: bool,
    },
    /// Partial update; the document must exist.
    Update { path: DocPath, update: Update },
    /// Delete; missing documents are ignored.
    Delete { path: DocPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Create { path, .. }
            | WriteOp::Set { path, .. }
            | WriteOp::Update { path, .. }
            | WriteOp::Delete { path } => path,
        }
    }
}

/// A single delivery on a live query.
pub type SnapshotResult = std::result::Result<Snapshot, StoreError>;

/// Idempotent cancellation hook for a live query.  Dropping it cancels.
pub struct CancelGuard {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Cancel the underlying listener.  Safe to call any number of times.
    pub fn cancel(&self) {
        let hook = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelGuard")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A live query: a stream of full ordered snapshots plus its cancel guard.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<SnapshotResult>,
    guard: CancelGuard,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<SnapshotResult>, guard: CancelGuard) -> Self {
        Self { receiver, guard }
    }

    /// Wait for the next delivery.  `None` once the listener is gone.
    pub async fn next(&mut self) -> Option<SnapshotResult> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.guard.cancel();
    }

    /// Split into the delivery stream and the guard, so they can be owned
    /// by different tasks.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<SnapshotResult>, CancelGuard) {
        (self.receiver, self.guard)
    }
}

/// Ordered document CRUD plus subscribe-to-query.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document with a generated id and return the id.
    async fn create_document(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Create a document at a fixed path; `AlreadyExists` if taken.
    async fn create_document_with_id(&self, path: &DocPath, fields: Fields) -> Result<()>;

    async fn set_document(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<()>;

    async fn get_document(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Apply a partial update; `NotFound` if the document is absent.
    async fn update_document(&self, path: &DocPath, update: Update) -> Result<()>;

    /// Delete a document.  Deleting a missing document succeeds.
    async fn delete_document(&self, path: &DocPath) -> Result<()>;

    async fn query(&self, query: &Query) -> Result<Snapshot>;

    /// Open a live query.  The first delivery is the current result set.
    async fn subscribe(&self, query: Query) -> Result<Subscription>;

    /// Apply all operations atomically, or none of them.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()>;
}
