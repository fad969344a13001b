use crate::model::ChainHead;
use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

/// Must be linearizable: a single writer produces the next head, readers
/// observe the old or the new value, never a composite.
#[async_trait]
pub trait ChainHeadStore: Send + Sync {
    async fn get(&self, chain_key: &str) -> Result<ChainHead>;
    async fn update(&self, chain_key: &str, tx: &str, cid: &str, seq: i64) -> Result<()>;
    async fn reset(&self, chain_key: &str) -> Result<()>;
}

pub struct SqliteChainHeadStore {
    pool: SqlitePool,
}

impl SqliteChainHeadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_state (
                key TEXT PRIMARY KEY,
                tx TEXT,
                cid TEXT,
                seq INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChainHeadStore for SqliteChainHeadStore {
    async fn get(&self, chain_key: &str) -> Result<ChainHead> {
        let row = sqlx::query("SELECT tx, cid, seq, updated_at FROM chain_state WHERE key = ?1")
            .bind(chain_key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let updated_at: String = row.try_get("updated_at")?;
                Ok(ChainHead {
                    tx: row.try_get("tx")?,
                    cid: row.try_get("cid")?,
                    seq: row.try_get("seq")?,
                    updated_at: updated_at
                        .parse()
                        .map_err(|e| eyre!("corrupt chain_state.updated_at: {e}"))?,
                })
            }
            None => Ok(ChainHead::genesis(Utc::now())),
        }
    }

    async fn update(&self, chain_key: &str, tx: &str, cid: &str, seq: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        // Upsert, but refuse to let seq go backwards except via explicit reset.
        sqlx::query(
            r#"
            INSERT INTO chain_state (key, tx, cid, seq, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                tx = excluded.tx,
                cid = excluded.cid,
                seq = excluded.seq,
                updated_at = excluded.updated_at
            WHERE excluded.seq >= chain_state.seq
            "#,
        )
        .bind(chain_key)
        .bind(tx)
        .bind(cid)
        .bind(seq)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, chain_key: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO chain_state (key, tx, cid, seq, updated_at)
            VALUES (?1, NULL, NULL, 0, ?2)
            ON CONFLICT(key) DO UPDATE SET tx = NULL, cid = NULL, seq = 0, updated_at = excluded.updated_at
            "#,
        )
        .bind(chain_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory fake for tests, matching the trait exactly.
#[derive(Default)]
pub struct InMemoryChainHeadStore {
    heads: Mutex<HashMap<String, ChainHead>>,
}

#[async_trait]
impl ChainHeadStore for InMemoryChainHeadStore {
    async fn get(&self, chain_key: &str) -> Result<ChainHead> {
        Ok(self
            .heads
            .lock()
            .unwrap()
            .get(chain_key)
            .cloned()
            .unwrap_or_else(|| ChainHead::genesis(Utc::now())))
    }

    async fn update(&self, chain_key: &str, tx: &str, cid: &str, seq: i64) -> Result<()> {
        let mut heads = self.heads.lock().unwrap();
        let entry = heads
            .entry(chain_key.to_string())
            .or_insert_with(|| ChainHead::genesis(Utc::now()));
        if seq >= entry.seq {
            entry.tx = Some(tx.to_string());
            entry.cid = Some(cid.to_string());
            entry.seq = seq;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset(&self, chain_key: &str) -> Result<()> {
        self.heads
            .lock()
            .unwrap()
            .insert(chain_key.to_string(), ChainHead::genesis(Utc::now()));
        Ok(())
    }
}
