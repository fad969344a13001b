use crate::clock::Clock;
use crate::model::{Operation, TrackedBundle, TrackedItem, Visibility};
use crate::queue::QueueStore;
use crate::uploader::Uploader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait TrackedBundleStore: Send + Sync {
    async fn insert(&self, bundle: &TrackedBundle) -> Result<()>;
    async fn pending(&self) -> Result<Vec<TrackedBundle>>;
    async fn mark_verified(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()>;
    async fn mark_failed(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()>;
    async fn increment_check_count(&self, bundle_tx: &str) -> Result<()>;
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    async fn counts_last(&self, since: DateTime<Utc>) -> Result<VerificationCounts>;
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct VerificationCounts {
    pub verified: i64,
    pub failed: i64,
}

pub struct SqliteTrackedBundleStore {
    pool: SqlitePool,
}

impl SqliteTrackedBundleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_bundles (
                bundle_tx TEXT PRIMARY KEY,
                items TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                uploaded_at TEXT NOT NULL,
                check_count INTEGER NOT NULL DEFAULT 0,
                verified_at TEXT,
                failed_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn row_to_bundle(row: &sqlx::sqlite::SqliteRow) -> Result<TrackedBundle> {
        let items: String = row.try_get("items")?;
        let uploaded_at: String = row.try_get("uploaded_at")?;
        let verified_at: Option<String> = row.try_get("verified_at")?;
        let failed_at: Option<String> = row.try_get("failed_at")?;
        Ok(TrackedBundle {
            bundle_tx: row.try_get("bundle_tx")?,
            items: serde_json::from_str(&items)?,
            item_count: row.try_get("item_count")?,
            uploaded_at: uploaded_at.parse()?,
            check_count: row.try_get("check_count")?,
            verified_at: verified_at.map(|s| s.parse()).transpose()?,
            failed_at: failed_at.map(|s| s.parse()).transpose()?,
        })
    }
}

#[async_trait]
impl TrackedBundleStore for SqliteTrackedBundleStore {
    async fn insert(&self, bundle: &TrackedBundle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracked_bundles (bundle_tx, items, item_count, uploaded_at, check_count)
            VALUES (?1, ?2, ?3, ?4, 0)
            "#,
        )
        .bind(&bundle.bundle_tx)
        .bind(serde_json::to_string(&bundle.items)?)
        .bind(bundle.item_count)
        .bind(bundle.uploaded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<TrackedBundle>> {
        let rows = sqlx::query(
            "SELECT * FROM tracked_bundles WHERE verified_at IS NULL AND failed_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_bundle).collect()
    }

    async fn mark_verified(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tracked_bundles SET verified_at = ?1 WHERE bundle_tx = ?2")
            .bind(at.to_rfc3339())
            .bind(bundle_tx)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tracked_bundles SET failed_at = ?1 WHERE bundle_tx = ?2")
            .bind(at.to_rfc3339())
            .bind(bundle_tx)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_check_count(&self, bundle_tx: &str) -> Result<()> {
        sqlx::query("UPDATE tracked_bundles SET check_count = check_count + 1 WHERE bundle_tx = ?1")
            .bind(bundle_tx)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM tracked_bundles
            WHERE (verified_at IS NOT NULL OR failed_at IS NOT NULL) AND uploaded_at < ?1
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn counts_last(&self, since: DateTime<Utc>) -> Result<VerificationCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN verified_at IS NOT NULL AND verified_at >= ?1 THEN 1 ELSE 0 END) as verified,
                SUM(CASE WHEN failed_at IS NOT NULL AND failed_at >= ?1 THEN 1 ELSE 0 END) as failed
            FROM tracked_bundles
            "#,
        )
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(VerificationCounts {
            verified: row.try_get::<Option<i64>, _>("verified")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }
}

#[derive(Default)]
pub struct InMemoryTrackedBundleStore {
    bundles: Mutex<HashMap<String, TrackedBundle>>,
}

#[async_trait]
impl TrackedBundleStore for InMemoryTrackedBundleStore {
    async fn insert(&self, bundle: &TrackedBundle) -> Result<()> {
        self.bundles
            .lock()
            .unwrap()
            .insert(bundle.bundle_tx.clone(), bundle.clone());
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<TrackedBundle>> {
        Ok(self
            .bundles
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.verified_at.is_none() && b.failed_at.is_none())
            .cloned()
            .collect())
    }

    async fn mark_verified(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(b) = self.bundles.lock().unwrap().get_mut(bundle_tx) {
            b.verified_at = Some(at);
        }
        Ok(())
    }

    async fn mark_failed(&self, bundle_tx: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(b) = self.bundles.lock().unwrap().get_mut(bundle_tx) {
            b.failed_at = Some(at);
        }
        Ok(())
    }

    async fn increment_check_count(&self, bundle_tx: &str) -> Result<()> {
        if let Some(b) = self.bundles.lock().unwrap().get_mut(bundle_tx) {
            b.check_count += 1;
        }
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut bundles = self.bundles.lock().unwrap();
        let before = bundles.len();
        bundles.retain(|_, b| {
            let done = b.verified_at.is_some() || b.failed_at.is_some();
            !(done && b.uploaded_at < cutoff)
        });
        Ok(before - bundles.len())
    }

    async fn counts_last(&self, since: DateTime<Utc>) -> Result<VerificationCounts> {
        let bundles = self.bundles.lock().unwrap();
        let mut counts = VerificationCounts::default();
        for b in bundles.values() {
            if b.verified_at.map(|t| t >= since).unwrap_or(false) {
                counts.verified += 1;
            }
            if b.failed_at.map(|t| t >= since).unwrap_or(false) {
                counts.failed += 1;
            }
        }
        Ok(counts)
    }
}

/// Tracks a newly-uploaded bundle for seeding verification.
pub fn new_tracked_bundle(bundle_tx: String, items: Vec<TrackedItem>, now: DateTime<Utc>) -> TrackedBundle {
    TrackedBundle {
        item_count: items.len() as i64,
        bundle_tx,
        items,
        uploaded_at: now,
        check_count: 0,
        verified_at: None,
        failed_at: None,
    }
}

pub struct VerifyOutcome {
    pub verified: usize,
    pub failed: usize,
    pub still_pending: usize,
}

/// Runs one seeding-verification pass over every tracked bundle past its
/// grace period. Timed-out bundles re-queue every `{entity_id,
/// cid}` as fresh pending rows (dedup on the unique constraint) and the
/// caller is expected to fire a seeding-failure alert for each.
pub async fn verify_tick(
    store: &dyn TrackedBundleStore,
    queue: &dyn QueueStore,
    uploader: &dyn Uploader,
    clock: &dyn Clock,
    grace_period: Duration,
    timeout: Duration,
) -> Result<(VerifyOutcome, Vec<TrackedBundle>)> {
    let now = clock.now();
    let pending = store.pending().await?;
    let mut outcome = VerifyOutcome {
        verified: 0,
        failed: 0,
        still_pending: 0,
    };
    let mut timed_out = Vec::new();

    for bundle in pending {
        let age = now.signed_duration_since(bundle.uploaded_at);
        if age < chrono::Duration::from_std(grace_period).unwrap_or_default() {
            continue;
        }

        match uploader.check_seeded(&bundle.bundle_tx).await {
            Ok(true) => {
                store.mark_verified(&bundle.bundle_tx, now).await?;
                outcome.verified += 1;
            }
            Ok(false) => {
                if age >= chrono::Duration::from_std(timeout).unwrap_or_default() {
                    store.mark_failed(&bundle.bundle_tx, now).await?;
                    for item in &bundle.items {
                        queue
                            .enqueue(&item.entity_id, &item.cid, Operation::U, Visibility::Pub)
                            .await?;
                    }
                    outcome.failed += 1;
                    timed_out.push(bundle);
                } else {
                    store.increment_check_count(&bundle.bundle_tx).await?;
                    outcome.still_pending += 1;
                }
            }
            Err(err) => {
                tracing::warn!(bundle_tx = %bundle.bundle_tx, error = %err, "seeding status check failed; will retry next tick");
                outcome.still_pending += 1;
            }
        }
    }

    Ok((outcome, timed_out))
}
