//! In-process change-stream store.
//!
//! [`DocumentStore`] implements [`RemoteStore`] on top of a synchronous
//! [`Backend`] (in-memory map or SQLite).  Every write is staged, validated
//! and committed atomically, then each live query on an affected collection
//! is re-evaluated and receives a fresh snapshot if its result changed.
//!
//! Lock order is always backend, then watchers.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{CancelGuard, RemoteStore, SnapshotResult, Subscription, WriteOp};
use crate::database::Database;
use crate::document::{DocPath, Document, Fields};
use crate::error::{Result, StoreError};
use crate::memory::MemoryBackend;
use crate::query::{Query, Snapshot};
use crate::update::Update;

/// Maximum operations accepted by a single batch write.
pub const MAX_BATCH_OPS: usize = 500;

/// A committed change to one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Put {
        collection: String,
        id: String,
        fields: Fields,
    },
    Remove {
        collection: String,
        id: String,
    },
}

/// Synchronous persistence used by [`DocumentStore`].
pub trait Backend: Send + 'static {
    fn load(&self, collection: &str, id: &str) -> Result<Option<Fields>>;

    fn scan(&self, collection: &str) -> Result<Vec<Document>>;

    /// Persist all changes atomically.
    fn commit(&mut self, changes: &[Change]) -> Result<()>;
}

/// Operation counters, used to assert read amplification in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: u64,
    pub queries: u64,
    pub writes: u64,
}

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<SnapshotResult>,
    last: Option<Vec<Document>>,
}

struct Inner<B> {
    backend: Mutex<B>,
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_watcher: AtomicU64,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    gets: AtomicU64,
    queries: AtomicU64,
    writes: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Change-stream document store over a [`Backend`].
pub struct DocumentStore<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for DocumentStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl DocumentStore<MemoryBackend> {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }
}

impl DocumentStore<Database> {
    /// Open (or create) a SQLite-backed store at `path`.
    pub fn open_sqlite(path: &Path) -> Result<Self> {
        Ok(Self::with_backend(Database::open_at(path)?))
    }

    /// Open the store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::with_backend(Database::new()?))
    }
}

impl<B: Backend> DocumentStore<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Mutex::new(backend),
                watchers: Mutex::new(HashMap::new()),
                next_watcher: AtomicU64::new(1),
                offline: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
                gets: AtomicU64::new(0),
                queries: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection.
    ///
    /// While offline every operation fails with [`StoreError::Unavailable`]
    /// and each live query receives one error delivery.
    pub fn set_offline(&self, offline: bool) {
        let was = self.inner.offline.swap(offline, Ordering::SeqCst);
        if offline && !was {
            warn!("document store going offline");
            let watchers = lock(&self.inner.watchers);
            for watcher in watchers.values() {
                let _ = watcher.tx.send(Err(StoreError::Unavailable));
            }
        } else if !offline && was {
            info!("document store back online");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Delay every operation by `latency`, so concurrent callers interleave.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.inner.gets.load(Ordering::SeqCst),
            queries: self.inner.queries.load(Ordering::SeqCst),
            writes: self.inner.writes.load(Ordering::SeqCst),
        }
    }

    /// Number of live queries currently registered.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner.watchers).len()
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_offline() {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    /// Stage, commit and broadcast a set of writes.
    fn apply_writes(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge {
                size: ops.len(),
                max: MAX_BATCH_OPS,
            });
        }
        for op in ops {
            op.path().validate()?;
        }

        let mut backend = lock(&self.inner.backend);

        // Later operations on the same path see earlier staged results.
        let mut staged: HashMap<DocPath, Option<Fields>> = HashMap::new();
        for op in ops {
            let path = op.path();
            let current = match staged.get(path) {
                Some(state) => state.clone(),
                None => backend.load(&path.collection, &path.id)?,
            };
            let next = match op {
                WriteOp::Create { fields, .. } => {
                    if current.is_some() {
                        return Err(StoreError::AlreadyExists(path.to_string()));
                    }
                    Some(fields.clone())
                }
                WriteOp::Set { fields, merge, .. } => match (current, merge) {
                    (Some(mut existing), true) => {
                        for (key, value) in fields {
                            existing.insert(key.clone(), value.clone());
                        }
                        Some(existing)
                    }
                    _ => Some(fields.clone()),
                },
                WriteOp::Update { update, .. } => {
                    let mut existing =
                        current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    update.apply(&mut existing)?;
                    Some(existing)
                }
                WriteOp::Delete { .. } => None,
            };
            staged.insert(path.clone(), next);
        }

        let changes: Vec<Change> = staged
            .into_iter()
            .map(|(path, state)| match state {
                Some(fields) => Change::Put {
                    collection: path.collection,
                    id: path.id,
                    fields,
                },
                None => Change::Remove {
                    collection: path.collection,
                    id: path.id,
                },
            })
            .collect();

        backend.commit(&changes)?;
        self.inner
            .writes
            .fetch_add(ops.len() as u64, Ordering::SeqCst);

        let touched: BTreeSet<&str> = changes
            .iter()
            .map(|c| match c {
                Change::Put { collection, .. } | Change::Remove { collection, .. } => {
                    collection.as_str()
                }
            })
            .collect();

        let mut watchers = lock(&self.inner.watchers);
        for (id, watcher) in watchers.iter_mut() {
            if !touched.contains(watcher.query.collection.as_str()) {
                continue;
            }
            match backend.scan(&watcher.query.collection) {
                Ok(docs) => {
                    let result = watcher.query.evaluate(docs);
                    if watcher.last.as_ref() == Some(&result) {
                        continue;
                    }
                    watcher.last = Some(result.clone());
                    let _ = watcher.tx.send(Ok(Snapshot::new(result)));
                }
                Err(e) => {
                    warn!(watcher = id, error = %e, "failed to re-evaluate live query");
                    let _ = watcher.tx.send(Err(StoreError::Subscription(e.to_string())));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> RemoteStore for DocumentStore<B> {
    async fn create_document(&self, collection: &str, fields: Fields) -> Result<String> {
        self.enter().await?;
        let id = Uuid::new_v4().simple().to_string();
        let path = DocPath::new(collection, id.clone());
        self.apply_writes(&[WriteOp::Create { path, fields }])?;
        Ok(id)
    }

    async fn create_document_with_id(&self, path: &DocPath, fields: Fields) -> Result<()> {
        self.enter().await?;
        self.apply_writes(&[WriteOp::Create {
            path: path.clone(),
            fields,
        }])
    }

    async fn set_document(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<()> {
        self.enter().await?;
        self.apply_writes(&[WriteOp::Set {
            path: path.clone(),
            fields,
            merge,
        }])
    }

    async fn get_document(&self, path: &DocPath) -> Result<Option<Document>> {
        self.enter().await?;
        path.validate()?;
        self.inner.gets.fetch_add(1, Ordering::SeqCst);
        let backend = lock(&self.inner.backend);
        Ok(backend
            .load(&path.collection, &path.id)?
            .map(|fields| Document::new(path.id.clone(), fields)))
    }

    async fn update_document(&self, path: &DocPath, update: Update) -> Result<()> {
        self.enter().await?;
        self.apply_writes(&[WriteOp::Update {
            path: path.clone(),
            update,
        }])
    }

    async fn delete_document(&self, path: &DocPath) -> Result<()> {
        self.enter().await?;
        self.apply_writes(&[WriteOp::Delete { path: path.clone() }])
    }

    async fn query(&self, query: &Query) -> Result<Snapshot> {
        self.enter().await?;
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        let docs = lock(&self.inner.backend).scan(&query.collection)?;
        Ok(Snapshot::new(query.evaluate(docs)))
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription> {
        self.enter().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_watcher.fetch_add(1, Ordering::SeqCst);

        {
            let backend = lock(&self.inner.backend);
            let initial = query.evaluate(backend.scan(&query.collection)?);
            let _ = tx.send(Ok(Snapshot::new(initial.clone())));

            let mut watchers = lock(&self.inner.watchers);
            debug!(watcher = id, collection = %query.collection, "live query registered");
            watchers.insert(
                id,
                Watcher {
                    query,
                    tx,
                    last: Some(initial),
                },
            );
        }

        let weak = Arc::downgrade(&self.inner);
        let guard = CancelGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                if lock(&inner.watchers).remove(&id).is_some() {
                    debug!(watcher = id, "live query cancelled");
                }
            }
        });
        Ok(Subscription::new(rx, guard))
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.enter().await?;
        if ops.is_empty() {
            return Ok(());
        }
        self.apply_writes(&ops)
    }
}
