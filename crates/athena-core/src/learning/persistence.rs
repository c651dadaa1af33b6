//! Opaque key/value persistence for JSON blobs
//!
//! An absent key reads as `None`, never as an error.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Storage for JSON blobs by key
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Process-local persistence
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blobs: RwLock<HashMap<String, Value>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// SQL to create the blob table
pub const CREATE_KV_BLOBS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_blobs (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// SQLite-backed persistence, one row per key
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create from an existing connection pool; call [`Self::init`] before use
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (creating if needed) a database file and initialize it
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(Error::DatabaseError)?;

        let persistence = Self { pool };
        persistence.init().await?;
        Ok(persistence)
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_KV_BLOBS_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        info!("Blob table initialized");
        Ok(())
    }

    /// Remove a key; returns whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_blobs WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let text: String = row.get("value");
        let value = serde_json::from_str(&text)
            .map_err(|e| {
                Error::StoreCorruption(format!("blob '{}' is not valid JSON: {}", key, e))
            })?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let text = serde_json::to_string(&value)?;

        sqlx::query(
            r#"
            INSERT INTO kv_blobs (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(&text)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        debug!(key = %key, bytes = text.len(), "Saved blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    async fn create_test_store() -> (SqlitePersistence, TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("athena.db");
        let store = SqlitePersistence::connect(&db_path).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_memory_get_set() {
        let store = MemoryPersistence::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_sqlite_absent_key_is_none() {
        let (store, _temp) = create_test_store().await;
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_upsert() {
        let (store, _temp) = create_test_store().await;

        store.set("k", json!([1, 2])).await.unwrap();
        store.set("k", json!({"replaced": true})).await.unwrap();

        assert_eq!(
            store.get("k").await.unwrap(),
            Some(json!({"replaced": true}))
        );
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_survives_reconnect() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("athena.db");

        {
            let store = SqlitePersistence::connect(&db_path).await.unwrap();
            store.set("learning", json!({"patterns": []})).await.unwrap();
        }

        let store = SqlitePersistence::connect(&db_path).await.unwrap();
        assert_eq!(
            store.get("learning").await.unwrap(),
            Some(json!({"patterns": []}))
        );
    }

    #[tokio::test]
    async fn test_sqlite_invalid_json_is_corruption() {
        let (store, _temp) = create_test_store().await;
        sqlx::query("INSERT INTO kv_blobs (key, value) VALUES ('bad', '{oops')")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(matches!(
            store.get("bad").await,
            Err(Error::StoreCorruption(_))
        ));
    }
}
