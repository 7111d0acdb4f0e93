//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.  It persists documents as
//! JSON text in a single `documents` table keyed by `(collection, id)` and
//! serves as a durable [`Backend`] for [`DocumentStore`](crate::DocumentStore).

use std::path::Path;

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use crate::document::{Document, Fields};
use crate::engine::{Backend, Change};
use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/parley/parley.db`
    /// - macOS:   `~/Library/Application Support/com.parley.parley/parley.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\parley\parley\data\parley.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "parley", "parley").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("parley.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// A private database that disappears with the connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }
}

impl Backend for Database {
    fn load(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, data FROM documents WHERE collection = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![collection], |row| {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            Ok((id, data))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, data) = row?;
            docs.push(Document::new(id, serde_json::from_str(&data)?));
        }
        Ok(docs)
    }

    fn commit(&mut self, changes: &[Change]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        for change in changes {
            match change {
                Change::Put {
                    collection,
                    id,
                    fields,
                } => {
                    tx.execute(
                        "INSERT INTO documents (collection, id, data, updated_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(collection, id)
                         DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                        params![collection, id, serde_json::to_string(fields)?, now],
                    )?;
                }
                Change::Remove { collection, id } => {
                    tx.execute(
                        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                        params![collection, id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RemoteStore;
    use crate::document::DocPath;
    use crate::engine::DocumentStore;
    use crate::query::{Direction, Query};
    use crate::update::Update;
    use serde_json::json;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.conn.path().is_some());
    }

    #[test]
    fn test_commit_and_scan() {
        let mut db = Database::open_in_memory().unwrap();
        let fields = json!({ "createdAt": 5 }).as_object().unwrap().clone();
        db.commit(&[
            Change::Put {
                collection: "chats/c1/messages".into(),
                id: "m2".into(),
                fields: fields.clone(),
            },
            Change::Put {
                collection: "chats/c1/messages".into(),
                id: "m1".into(),
                fields,
            },
        ])
        .unwrap();

        let docs = db.scan("chats/c1/messages").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "m1");
        assert!(db.scan("chats/c2/messages").unwrap().is_empty());

        db.commit(&[Change::Remove {
            collection: "chats/c1/messages".into(),
            id: "m1".into(),
        }])
        .unwrap();
        assert!(db.load("chats/c1/messages", "m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");
        let doc_path = DocPath::new("chats", "a_b");

        {
            let store = DocumentStore::open_sqlite(&path).unwrap();
            let fields = json!({ "participants": ["a", "b"], "lastMessageTime": 1 });
            store
                .create_document_with_id(&doc_path, fields.as_object().unwrap().clone())
                .await
                .unwrap();
            store
                .update_document(&doc_path, Update::new().increment("unreadCount.b", 1))
                .await
                .unwrap();
        }

        let store = DocumentStore::open_sqlite(&path).unwrap();
        let doc = store.get_document(&doc_path).await.unwrap().unwrap();
        assert_eq!(doc.fields["unreadCount"]["b"], 1);

        let snapshot = store
            .query(
                &Query::new("chats")
                    .array_contains("participants", "a")
                    .order_by("lastMessageTime", Direction::Descending),
            )
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
