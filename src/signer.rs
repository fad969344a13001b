use crate::model::{AttestationPayload, ChainHead, QueueEntry, SignedRecord};
use crate::wallet::{base64_url, Wallet};
use chrono::Utc;
use ed25519_dalek::{Signer as _, SigningKey};
use sha2::{Digest, Sha256};

/// A manifest-bearing row ready to sign.
pub struct SignableRow {
    pub entry: QueueEntry,
    pub manifest: serde_json::Value,
    pub ver: i64,
}

/// The outcome of one sequential signing pass over a batch.
pub struct SignResult {
    pub signed: Vec<SignedRecord>,
    /// The head this batch would produce, absent any upload failures.
    pub next_head: ChainHead,
}

/// Signs rows strictly in order: each record's id feeds the next record's
/// `prev_tx`, so this step must not be parallelized. Signing is
/// pure and CPU-local: no network calls happen here. `now_ms` is the
/// injected clock's reading for this tick, not a fresh `Utc::now()` per
/// row, so that signatures (and thus ids) reproduce for identical inputs.
pub fn sign_sequential(
    rows: Vec<SignableRow>,
    head: &ChainHead,
    wallet: &dyn Wallet,
    now_ms: i64,
) -> SignResult {
    let mut prev_tx = head.tx.clone();
    let mut prev_cid = head.cid.clone();
    let mut seq = head.seq;
    let mut signed = Vec::with_capacity(rows.len());

    for row in rows {
        seq += 1;
        let payload = AttestationPayload {
            pi: row.entry.entity_id.clone(),
            ver: row.ver,
            cid: row.entry.cid.clone(),
            op: row.entry.op,
            vis: row.entry.vis,
            ts: now_ms,
            prev_tx: prev_tx.clone(),
            prev_cid: prev_cid.clone(),
            seq,
            manifest: row.manifest,
        };

        let record = sign_one(row.entry.id, &row.entry.entity_id, &row.entry.cid, payload, wallet.signing_key());

        prev_tx = Some(record.id.clone());
        prev_cid = Some(record.cid.clone());
        signed.push(record);
    }

    SignResult {
        signed,
        next_head: ChainHead {
            tx: prev_tx,
            cid: prev_cid,
            seq,
            updated_at: Utc::now(),
        },
    }
}

/// Signature is deterministic from `(payload, key)`; the record id is
/// `base64url(SHA-256(signature))`. This reproducibility is what
/// lets ids be known before any network round trip.
fn sign_one(
    row_id: i64,
    entity_id: &str,
    cid: &str,
    payload: AttestationPayload,
    key: &SigningKey,
) -> SignedRecord {
    let payload_bytes =
        serde_json::to_vec(&payload).expect("AttestationPayload serialization cannot fail");
    let signature = key.sign(&payload_bytes);
    let signature_bytes = signature.to_bytes().to_vec();

    let mut hasher = Sha256::new();
    hasher.update(&signature_bytes);
    let id = base64_url(&hasher.finalize());

    SignedRecord {
        row_id,
        entity_id: entity_id.to_string(),
        cid: cid.to_string(),
        payload,
        payload_bytes,
        signature: signature_bytes,
        owner_pubkey: key.verifying_key().as_bytes().to_vec(),
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, QueueStatus, Visibility};
    use crate::wallet::TestWallet;

    fn row(id: i64, entity: &str, cid: &str, ver: i64) -> SignableRow {
        let now = Utc::now();
        SignableRow {
            entry: QueueEntry {
                id,
                entity_id: entity.to_string(),
                cid: cid.to_string(),
                op: Operation::U,
                vis: Visibility::Pub,
                ts: now,
                status: QueueStatus::Signing,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
            manifest: serde_json::json!({"ver": ver}),
            ver,
        }
    }

    #[test]
    fn genesis_chain_produces_contiguous_seq_starting_at_one() {
        let wallet = TestWallet::new([7u8; 32]);
        let head = ChainHead::genesis(Utc::now());
        let rows = vec![row(1, "E1", "C1", 1)];
        let result = sign_sequential(rows, &head, &wallet, 1_700_000_000_000);

        assert_eq!(result.signed.len(), 1);
        assert_eq!(result.signed[0].payload.seq, 1);
        assert_eq!(result.signed[0].payload.prev_tx, None);
        assert_eq!(result.next_head.seq, 1);
    }

    #[test]
    fn chained_batch_links_each_record_to_the_previous_id() {
        let wallet = TestWallet::new([9u8; 32]);
        let head = ChainHead {
            tx: Some("TX0".into()),
            cid: Some("CID0".into()),
            seq: 10,
            updated_at: Utc::now(),
        };
        let rows = vec![row(1, "E1", "C1", 1), row(2, "E2", "C2", 2), row(3, "E3", "C3", 1)];
        let result = sign_sequential(rows, &head, &wallet, 1_700_000_000_000);

        assert_eq!(result.signed[0].payload.prev_tx.as_deref(), Some("TX0"));
        assert_eq!(result.signed[1].payload.prev_tx.as_deref(), Some(result.signed[0].id.as_str()));
        assert_eq!(result.signed[2].payload.prev_tx.as_deref(), Some(result.signed[1].id.as_str()));
        assert_eq!(result.signed[0].payload.seq, 11);
        assert_eq!(result.signed[2].payload.seq, 13);
        assert_eq!(result.next_head.seq, 13);
    }

    #[test]
    fn signing_is_deterministic_for_identical_payload_and_key() {
        let wallet = TestWallet::new([3u8; 32]);
        let head = ChainHead::genesis(Utc::now());
        let a = sign_sequential(vec![row(1, "E1", "C1", 1)], &head, &wallet, 1_700_000_000_000);

        // Re-sign with the exact same inputs: the signature (and thus id)
        // must reproduce, since ts is embedded but we pin it manually here
        // by reusing the same payload bytes rather than re-deriving ts.
        let key = wallet.signing_key();
        use ed25519_dalek::Signer as _;
        let sig_again = key.sign(&a.signed[0].payload_bytes);
        assert_eq!(sig_again.to_bytes().to_vec(), a.signed[0].signature);
    }
}
