//! # parley-store
//!
//! The remote document store boundary used by the Parley sync core.
//!
//! [`RemoteStore`] is the async contract: ordered document CRUD, field-level
//! updates (atomic increments, array unions), atomic batches and live
//! queries that push a full ordered snapshot on every change.
//! [`DocumentStore`] is an in-process implementation over either an
//! in-memory map or a SQLite table, used by tests and embedders.

pub mod adapter;
pub mod database;
pub mod document;
pub mod engine;
pub mod memory;
pub mod migrations;
pub mod query;
pub mod update;

mod error;

pub use adapter::{CancelGuard, RemoteStore, SnapshotResult, Subscription, WriteOp};
pub use database::Database;
pub use document::{DocPath, Document, Fields};
pub use engine::{Backend, Change, DocumentStore, StoreStats, MAX_BATCH_OPS};
pub use error::{Result, StoreError};
pub use memory::MemoryBackend;
pub use query::{Cursor, Direction, Filter, Query, Snapshot};
pub use update::{FieldOp, FieldPath, Update};
