//! v001 -- Document table.
//!
//! Every collection (including nested ones such as `chats/{id}/messages`)
//! shares one table; the field map is stored as JSON text.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Documents
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,              -- slash-separated collection path
    id         TEXT NOT NULL,
    data       TEXT NOT NULL,              -- JSON object
    updated_at TEXT NOT NULL,              -- RFC-3339

    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection
    ON documents(collection);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
