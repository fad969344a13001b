use crate::chain_head::ChainHeadStore;
use crate::error::DomainError;
use crate::index::{latest_key, versioned_key, LookupIndexStore};
use crate::model::{LookupEntry, SignedRecord, UploadOutcome};
use crate::queue::QueueStore;
use chrono::Utc;
use eyre::Result;

pub struct FinalizeOutcome {
    pub succeeded: Vec<SignedRecord>,
    pub failed: Vec<SignedRecord>,
    pub new_seq: i64,
}

/// Computes the longest successful prefix: the first failure
/// breaks the chain and every record after it is treated as failed
/// regardless of its own outcome, since it carries a now-invalid
/// `prev_tx`. In bundle mode callers pass outcomes that are already
/// all-or-nothing (every record shares the bundle's single outcome), so
/// this same function implements both modes.
pub fn longest_successful_prefix(
    records: Vec<SignedRecord>,
    outcomes: &[UploadOutcome],
) -> (Vec<SignedRecord>, Vec<SignedRecord>) {
    let outcome_by_id: std::collections::HashMap<&str, &UploadOutcome> =
        outcomes.iter().map(|o| (o.id.as_str(), o)).collect();

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    let mut broken = false;

    for record in records {
        if !broken {
            let ok = outcome_by_id.get(record.id.as_str()).map(|o| o.success).unwrap_or(false);
            if ok {
                succeeded.push(record);
                continue;
            }
            broken = true;
        }
        failed.push(record);
    }

    (succeeded, failed)
}

/// Finalizes one signed batch: advances the chain head to the last
/// successful record, writes the lookup index (chunked, with backoff on
/// rate limits), deletes succeeded queue rows, and reverts failed rows to
/// `pending` with `retry_count` incremented so the next tick re-signs
/// them against the new head.
pub async fn finalize(
    chain_head: &dyn ChainHeadStore,
    queue: &dyn QueueStore,
    index: &dyn LookupIndexStore,
    chain_key: &str,
    succeeded: Vec<SignedRecord>,
    failed: Vec<SignedRecord>,
    max_retries: i64,
) -> Result<FinalizeOutcome> {
    let mut new_seq = 0;

    if let Some(last) = succeeded.last() {
        new_seq = last.payload.seq;
        chain_head
            .update(chain_key, &last.id, &last.cid, last.payload.seq)
            .await
            .map_err(|e| DomainError::ChainHeadUpdateFailed(e.to_string()))?;
    }

    write_index_chunked(index, &succeeded).await;

    let succeeded_ids: Vec<i64> = succeeded.iter().map(|r| r.row_id).collect();
    if !succeeded_ids.is_empty() {
        queue.delete(&succeeded_ids).await?;
    }

    for record in &failed {
        let err = "upload failed or chain broken by an earlier failure in this batch";
        queue.revert_to_pending(record.row_id, Some(err), max_retries).await?;
    }

    Ok(FinalizeOutcome {
        succeeded,
        failed,
        new_seq,
    })
}

async fn write_index_chunked(index: &dyn LookupIndexStore, succeeded: &[SignedRecord]) {
    const CHUNK: usize = 50;
    for chunk in succeeded.chunks(CHUNK) {
        let mut delay = std::time::Duration::from_millis(200);
        for record in chunk {
            let entry = LookupEntry {
                cid: record.cid.clone(),
                tx: record.id.clone(),
                seq: record.payload.seq,
                ts: record.payload.ts,
                bundled: false,
            };

            for attempt in 1..=3u32 {
                let v_key = versioned_key(&record.entity_id, record.payload.ver);
                let l_key = latest_key(&record.entity_id);
                let v_res = index.put(&v_key, &entry).await;
                let l_res = index.put(&l_key, &entry).await;

                if v_res.is_ok() && l_res.is_ok() {
                    break;
                }
                if attempt == 3 {
                    // A subsequent tick can reconstruct the index from the
                    // on-network record; log and move on.
                    tracing::warn!(
                        entity_id = %record.entity_id,
                        ver = record.payload.ver,
                        "lookup index write failed after retries"
                    );
                    break;
                }
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
    let _ = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_head::InMemoryChainHeadStore;
    use crate::index::InMemoryLookupIndexStore;
    use crate::model::{AttestationPayload, Operation, Visibility};
    use crate::queue::InMemoryQueueStore;

    fn record(row_id: i64, seq: i64, entity: &str, cid: &str) -> SignedRecord {
        SignedRecord {
            row_id,
            entity_id: entity.to_string(),
            cid: cid.to_string(),
            payload: AttestationPayload {
                pi: entity.to_string(),
                ver: 1,
                cid: cid.to_string(),
                op: Operation::U,
                vis: Visibility::Pub,
                ts: 0,
                prev_tx: None,
                prev_cid: None,
                seq,
                manifest: serde_json::json!({}),
            },
            payload_bytes: vec![],
            signature: vec![],
            owner_pubkey: vec![],
            id: format!("TX{seq}"),
        }
    }

    #[test]
    fn longest_prefix_cuts_at_first_failure() {
        let records = vec![
            record(1, 101, "E1", "C1"),
            record(2, 102, "E2", "C2"),
            record(3, 103, "E3", "C3"),
            record(4, 104, "E4", "C4"),
            record(5, 105, "E5", "C5"),
        ];
        let outcomes: Vec<UploadOutcome> = records
            .iter()
            .enumerate()
            .map(|(i, r)| UploadOutcome {
                id: r.id.clone(),
                success: i != 2,
                error: None,
                attempts: 1,
            })
            .collect();

        let (succeeded, failed) = longest_successful_prefix(records, &outcomes);
        assert_eq!(succeeded.len(), 2);
        assert_eq!(failed.len(), 3);
        assert_eq!(succeeded.last().unwrap().payload.seq, 102);
    }

    #[tokio::test]
    async fn finalize_advances_head_and_reverts_failures() {
        let chain_head = InMemoryChainHeadStore::default();
        let queue = InMemoryQueueStore::default();
        let index = InMemoryLookupIndexStore::default();

        let succeeded = vec![record(1, 11, "E1", "C1"), record(2, 12, "E2", "C2")];
        let failed = vec![record(3, 13, "E3", "C3")];

        queue.enqueue("E3", "C3", Operation::U, Visibility::Pub).await.unwrap();
        let entries = queue.fetch_pending(10).await.unwrap();
        let row3_id = entries[0].id;
        let failed = failed
            .into_iter()
            .map(|mut r| {
                r.row_id = row3_id;
                r
            })
            .collect();

        let outcome = finalize(&chain_head, &queue, &index, "head", succeeded, failed, 5)
            .await
            .unwrap();

        assert_eq!(outcome.new_seq, 12);
        let head = chain_head.get("head").await.unwrap();
        assert_eq!(head.seq, 12);
        assert_eq!(head.tx.as_deref(), Some("TX12"));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 1);

        let latest = index.get(&latest_key("E1")).await.unwrap().unwrap();
        assert_eq!(latest.seq, 11);
    }
}
