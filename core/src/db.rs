use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// Failures of the persistent byte store underneath the Local Cache.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: write needs {needed} bytes, limit is {limit}")]
    QuotaExceeded { needed: u64, limit: u64 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct Database {
    conn: Connection,
    quota_bytes: Option<u64>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database {
            conn,
            quota_bytes: None,
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn,
            quota_bytes: None,
        };
        db.migrate()?;
        Ok(db)
    }

    /// Cap the total size (keys plus values) of the key/value table.
    #[must_use]
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );

                CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Key/value store ---

    pub fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if let Some(limit) = self.quota_bytes {
            let needed = self.kv_usage_excluding(key)? + (key.len() + value.len()) as u64;
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool, StorageError> {
        let rows = self
            .conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    pub fn kv_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Bytes held by every entry except `key` (the value a write replaces).
    fn kv_usage_excluding(&self, key: &str) -> Result<u64, StorageError> {
        let used: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(length(key) + length(value)), 0) FROM kv_store WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(used).unwrap_or(0))
    }

    // --- Documents (hosted remote store) ---

    pub fn list_documents(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut documents = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            let value = serde_json::from_str(&body)
                .with_context(|| format!("Corrupt document {collection}/{id}"))?;
            documents.push((id, value));
        }
        Ok(documents)
    }

    pub fn put_document(
        &self,
        collection: &str,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let body = serde_json::to_string(body)?;
        self.conn.execute(
            "INSERT INTO documents (collection, id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![collection, id, body, now],
        )?;
        Ok(())
    }

    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(rows > 0)
    }
}
