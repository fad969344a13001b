use crate::model::LookupEntry;
use async_trait::async_trait;
use eyre::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

/// `attest:{entity_id}:{ver}` and `attest:{entity_id}:latest`. Eventually
/// consistent: a failed write here does not block chain-head advancement
/// because a later tick can reconstruct it from the
/// on-network record.
#[async_trait]
pub trait LookupIndexStore: Send + Sync {
    async fn put(&self, key: &str, entry: &LookupEntry) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<LookupEntry>>;
}

pub fn versioned_key(entity_id: &str, ver: i64) -> String {
    format!("attest:{entity_id}:{ver}")
}

pub fn latest_key(entity_id: &str) -> String {
    format!("attest:{entity_id}:latest")
}

pub struct SqliteLookupIndexStore {
    pool: SqlitePool,
}

impl SqliteLookupIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lookup_index (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LookupIndexStore for SqliteLookupIndexStore {
    async fn put(&self, key: &str, entry: &LookupEntry) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        sqlx::query(
            r#"
            INSERT INTO lookup_index (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<LookupEntry>> {
        let row = sqlx::query("SELECT value FROM lookup_index WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct InMemoryLookupIndexStore {
    entries: Mutex<HashMap<String, LookupEntry>>,
}

#[async_trait]
impl LookupIndexStore for InMemoryLookupIndexStore {
    async fn put(&self, key: &str, entry: &LookupEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<LookupEntry>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }
}
