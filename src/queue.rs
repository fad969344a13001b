use crate::model::{Operation, QueueEntry, QueueStatus, Visibility};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;

/// Underlying stores may cap the number of bind parameters per statement
/// (sqlite's default is a few hundred, but we chunk conservatively so the
/// same code works against stricter backends too).
pub const CHUNK_SIZE: usize = 50;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Re-queue (or first-queue) a request. Enforces uniqueness on
    /// `(entity_id, cid)`: re-queuing an identical pending/signing row is
    /// a no-op, not a duplicate insert.
    async fn enqueue(&self, entity_id: &str, cid: &str, op: Operation, vis: Visibility) -> Result<()>;

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>>;
    async fn mark_signing(&self, ids: &[i64]) -> Result<()>;
    async fn delete(&self, ids: &[i64]) -> Result<()>;
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Reverts a row to `pending` after a failure, bumping `retry_count`.
    /// `error: None` marks a benign deferral (not a failure) and leaves
    /// `retry_count` untouched: the caller has more work queued than it
    /// chose to process this tick, nothing actually failed. When `error`
    /// is `Some`, the row is abandoned to `failed` instead of `pending`
    /// once the post-increment `retry_count` reaches `max_retries`.
    async fn revert_to_pending(&self, id: i64, error: Option<&str>, max_retries: i64) -> Result<()>;
    async fn reset_stuck(&self, threshold: DateTime<Utc>) -> Result<usize>;
    async fn reset_failed_under_limit(&self, max_retries: i64) -> Result<Vec<i64>>;
    async fn stats(&self) -> Result<QueueStats>;
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub signing: i64,
    pub uploading: i64,
    pub failed: i64,
    pub total: i64,
}

pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                cid TEXT NOT NULL,
                op TEXT NOT NULL,
                vis TEXT NOT NULL,
                ts TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending','signing','uploading','failed')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(entity_id, cid)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<QueueEntry> {
        let status: String = row.try_get("status")?;
        let op: String = row.try_get("op")?;
        let vis: String = row.try_get("vis")?;
        let ts: String = row.try_get("ts")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(QueueEntry {
            id: row.try_get("id")?,
            entity_id: row.try_get("entity_id")?,
            cid: row.try_get("cid")?,
            op: Operation::parse(&op).ok_or_else(|| eyre::eyre!("bad op {op}"))?,
            vis: Visibility::parse(&vis).ok_or_else(|| eyre::eyre!("bad vis {vis}"))?,
            ts: ts.parse()?,
            status: QueueStatus::parse(&status).ok_or_else(|| eyre::eyre!("bad status {status}"))?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
            created_at: created_at.parse()?,
            updated_at: updated_at.parse()?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, entity_id: &str, cid: &str, op: Operation, vis: Visibility) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO queue (entity_id, cid, op, vis, ts, status, retry_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?5, ?5)
            ON CONFLICT(entity_id, cid) DO UPDATE SET
                status = 'pending',
                updated_at = excluded.updated_at
            WHERE queue.status = 'failed'
            "#,
        )
        .bind(entity_id)
        .bind(cid)
        .bind(op.as_str())
        .bind(vis.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM queue WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn mark_signing(&self, ids: &[i64]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "UPDATE queue SET status = 'signing', updated_at = ? WHERE id IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql).bind(&now);
            for id in chunk {
                q = q.bind(id);
            }
            q.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM queue WHERE id IN ({placeholders})");
            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(id);
            }
            q.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE queue SET status = 'failed', error_message = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revert_to_pending(&self, id: i64, error: Option<&str>, max_retries: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        match error {
            None => {
                sqlx::query(
                    "UPDATE queue SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                )
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            Some(e) => {
                sqlx::query(
                    r#"
                    UPDATE queue
                    SET
                        retry_count = retry_count + 1,
                        status = CASE WHEN retry_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                        error_message = ?2,
                        updated_at = ?3
                    WHERE id = ?4
                    "#,
                )
                .bind(max_retries)
                .bind(e)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn reset_stuck(&self, threshold: DateTime<Utc>) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'pending', updated_at = ?1
            WHERE status IN ('signing', 'uploading') AND updated_at < ?2
            "#,
        )
        .bind(&now)
        .bind(threshold.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn reset_failed_under_limit(&self, max_retries: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM queue WHERE status = 'failed' AND retry_count < ?1",
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;

        let now = Utc::now().to_rfc3339();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "UPDATE queue SET status = 'pending', updated_at = ? WHERE id IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql).bind(&now);
            for id in chunk {
                q = q.bind(id);
            }
            q.execute(&self.pool).await?;
        }
        Ok(ids)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.total += n;
            match status.as_str() {
                "pending" => stats.pending = n,
                "signing" => stats.signing = n,
                "uploading" => stats.uploading = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// In-memory fake for tests.
#[derive(Default)]
pub struct InMemoryQueueStore {
    rows: Mutex<HashMap<i64, QueueEntry>>,
    next_id: Mutex<i64>,
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, entity_id: &str, cid: &str, op: Operation, vis: Visibility) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let existing = rows
            .values_mut()
            .find(|r| r.entity_id == entity_id && r.cid == cid);
        match existing {
            Some(row) if row.status == QueueStatus::Failed => {
                row.status = QueueStatus::Pending;
                row.updated_at = Utc::now();
            }
            Some(_) => {}
            None => {
                let mut next_id = self.next_id.lock().unwrap();
                *next_id += 1;
                let now = Utc::now();
                rows.insert(
                    *next_id,
                    QueueEntry {
                        id: *next_id,
                        entity_id: entity_id.to_string(),
                        cid: cid.to_string(),
                        op,
                        vis,
                        ts: now,
                        status: QueueStatus::Pending,
                        retry_count: 0,
                        error_message: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<QueueEntry> = rows
            .values()
            .filter(|r| r.status == QueueStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn mark_signing(&self, ids: &[i64]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                row.status = QueueStatus::Signing;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.status = QueueStatus::Failed;
            row.error_message = Some(error.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn revert_to_pending(&self, id: i64, error: Option<&str>, max_retries: i64) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            match error {
                None => {
                    row.status = QueueStatus::Pending;
                }
                Some(e) => {
                    row.retry_count += 1;
                    row.error_message = Some(e.to_string());
                    row.status = if row.retry_count >= max_retries {
                        QueueStatus::Failed
                    } else {
                        QueueStatus::Pending
                    };
                }
            }
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_stuck(&self, threshold: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.rows.lock().unwrap();
        let mut count = 0;
        for row in rows.values_mut() {
            if matches!(row.status, QueueStatus::Signing | QueueStatus::Uploading)
                && row.updated_at < threshold
            {
                row.status = QueueStatus::Pending;
                row.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reset_failed_under_limit(&self, max_retries: i64) -> Result<Vec<i64>> {
        let mut rows = self.rows.lock().unwrap();
        let mut ids = Vec::new();
        for row in rows.values_mut() {
            if row.status == QueueStatus::Failed && row.retry_count < max_retries {
                row.status = QueueStatus::Pending;
                row.updated_at = Utc::now();
                ids.push(row.id);
            }
        }
        Ok(ids)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = self.rows.lock().unwrap();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            stats.total += 1;
            match row.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Signing => stats.signing += 1,
                QueueStatus::Uploading => stats.uploading += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
