use crate::clock::Clock;
use crate::queue::QueueStore;
use eyre::Result;
use std::time::Duration;

/// Reclaims rows stuck in `signing`/`uploading` past `stuck_threshold`.
/// Runs before each processing tick.
pub async fn cleanup_stuck(queue: &dyn QueueStore, clock: &dyn Clock, stuck_threshold: Duration) -> Result<usize> {
    let threshold = clock.now() - chrono::Duration::from_std(stuck_threshold).unwrap_or_default();
    let reclaimed = queue.reset_stuck(threshold).await?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "cleanup reclaimed stuck queue rows");
    }
    Ok(reclaimed)
}

/// Resets `failed` rows below the retry cap to `pending`. Runs
/// daily. Rows at or above the cap are left `failed` for forensic
/// inspection and logged as abandoned; this function only resets the
/// eligible ones, so it never touches abandoned rows on later runs.
pub async fn retry_failed_items(queue: &dyn QueueStore, max_retries: i64) -> Result<usize> {
    let reset = queue.reset_failed_under_limit(max_retries).await?;
    if !reset.is_empty() {
        tracing::info!(count = reset.len(), "retry job reset failed rows to pending");
    }

    let stats = queue.stats().await?;
    if stats.failed > 0 {
        tracing::warn!(
            abandoned = stats.failed,
            max_retries,
            "failed rows remain at or above the retry cap; left for forensic inspection"
        );
    }
    Ok(reset.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_util::FixedClock;
    use crate::model::{Operation, Visibility};
    use crate::queue::InMemoryQueueStore;
    use chrono::Utc;

    #[tokio::test]
    async fn stuck_signing_rows_are_reclaimed_after_threshold() {
        let queue = InMemoryQueueStore::default();
        queue.enqueue("E1", "C1", Operation::U, Visibility::Pub).await.unwrap();
        let id = queue.fetch_pending(10).await.unwrap()[0].id;
        queue.mark_signing(&[id]).await.unwrap();

        let clock = FixedClock::new(Utc::now());
        clock.advance(chrono::Duration::minutes(20));

        let reclaimed = cleanup_stuck(&queue, &clock, Duration::from_secs(600)).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_rows_under_cap_reset_but_abandoned_rows_stay() {
        let queue = InMemoryQueueStore::default();
        queue.enqueue("E1", "C1", Operation::U, Visibility::Pub).await.unwrap();
        queue.enqueue("E2", "C2", Operation::U, Visibility::Pub).await.unwrap();
        let rows = queue.fetch_pending(10).await.unwrap();

        queue.mark_failed(rows[0].id, "transient").await.unwrap();
        for _ in 0..5 {
            queue.revert_to_pending(rows[1].id, Some("transient"), 100).await.unwrap();
        }
        queue.mark_failed(rows[1].id, "transient").await.unwrap();

        let reset = retry_failed_items(&queue, 5).await.unwrap();
        assert_eq!(reset, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn repeated_failures_abandon_a_row_at_the_retry_cap() {
        let queue = InMemoryQueueStore::default();
        queue.enqueue("E1", "C1", Operation::U, Visibility::Pub).await.unwrap();
        let id = queue.fetch_pending(10).await.unwrap()[0].id;

        for _ in 0..2 {
            queue.revert_to_pending(id, Some("transient"), 3).await.unwrap();
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.pending, 1);
            assert_eq!(stats.failed, 0);
        }

        queue.revert_to_pending(id, Some("transient"), 3).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn benign_deferral_does_not_count_against_the_retry_cap() {
        let queue = InMemoryQueueStore::default();
        queue.enqueue("E1", "C1", Operation::U, Visibility::Pub).await.unwrap();
        let id = queue.fetch_pending(10).await.unwrap()[0].id;

        for _ in 0..10 {
            queue.revert_to_pending(id, None, 3).await.unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
    }
}
