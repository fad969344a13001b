use crate::alert::{Alert, Alerter, Severity};
use crate::chain_head::ChainHeadStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::finalizer::{finalize, longest_successful_prefix};
use crate::manifest::ManifestSource;
use crate::model::{ProcessResult, TrackedItem, UploadMode};
use crate::queue::QueueStore;
use crate::retry::{cleanup_stuck, retry_failed_items};
use crate::signer::{sign_sequential, SignableRow};
use crate::uploader::Uploader;
use crate::verifier::{self, new_tracked_bundle, TrackedBundleStore};
use crate::wallet::{classify_balance, BalanceStatus, Wallet};
use eyre::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;

/// All injected collaborators for one chain. Plain fields rather than a
/// trait object registry, matching the reference bot's flat
/// `client`/`opensub`/`state` composition in `main`.
pub struct Daemon {
    pub config: Config,
    pub chain_head: Arc<dyn ChainHeadStore>,
    pub queue: Arc<dyn QueueStore>,
    pub manifests: Arc<dyn ManifestSource>,
    pub index: Arc<dyn crate::index::LookupIndexStore>,
    pub tracked_bundles: Arc<dyn TrackedBundleStore>,
    pub wallet: Arc<dyn Wallet>,
    pub uploader: Arc<dyn Uploader>,
    pub alerter: Arc<dyn Alerter>,
    pub clock: Arc<dyn Clock>,
    pub last_batch: std::sync::Mutex<Option<ProcessResult>>,
}

impl Daemon {
    /// One processing tick: cleanup -> balance gate -> fetch ->
    /// sign -> bundle/upload -> finalize. Bounded by `MAX_PROCESS_TIME`
    /// in spirit (the caller wraps this in `tokio::time::timeout`);
    /// overrun here is not fatal, unfinished work stays in its state.
    pub async fn process_tick(&self) -> Result<ProcessResult> {
        self.process_tick_for(&self.config.chain_key).await
    }

    /// Same pipeline, but advancing a caller-chosen chain key instead of
    /// the configured production one. `/test-bundle` uses this so a test
    /// run advances an isolated head rather than the production chain.
    pub async fn process_tick_for(&self, chain_key: &str) -> Result<ProcessResult> {
        let result = self.process_tick_inner(chain_key).await?;
        *self.last_batch.lock().unwrap() = Some(result.clone());
        Ok(result)
    }

    async fn process_tick_inner(&self, chain_key: &str) -> Result<ProcessResult> {
        let start = Instant::now();

        cleanup_stuck(self.queue.as_ref(), self.clock.as_ref(), self.config.stuck_threshold).await?;

        if let Some(gate) = self.balance_gate().await {
            if gate == BalanceStatus::Critical {
                return Ok(ProcessResult {
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        }

        let pending = self.queue.fetch_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(ProcessResult {
                processed: 0,
                succeeded: 0,
                failed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let ids: Vec<i64> = pending.iter().map(|r| r.id).collect();
        self.queue.mark_signing(&ids).await?;

        // Manifest pre-fetch: parallel, up to batch size.
        let rows: Vec<_> = stream::iter(pending.into_iter())
            .map(|entry| {
                let manifests = self.manifests.clone();
                async move {
                    let manifest = manifests.get(&entry.cid).await;
                    (entry, manifest)
                }
            })
            .buffer_unordered(self.config.batch_size.max(1))
            .collect()
            .await;

        let mut signable = Vec::new();
        for (entry, manifest_result) in rows {
            match manifest_result {
                Ok(Some(manifest)) => {
                    let row_id = entry.id;
                    signable.push((
                        row_id,
                        SignableRow {
                            entry,
                            manifest: manifest.body.clone(),
                            ver: manifest.ver,
                        },
                    ));
                }
                Ok(None) => {
                    self.queue
                        .mark_failed(entry.id, "manifest missing or invalid")
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(row_id = entry.id, error = %err, "manifest fetch failed; reverting for retry");
                    self.queue
                        .revert_to_pending(
                            entry.id,
                            Some(&format!("manifest fetch error: {err}")),
                            self.config.max_retries,
                        )
                        .await?;
                }
            }
        }

        if signable.is_empty() {
            return Ok(ProcessResult {
                processed: 0,
                succeeded: 0,
                failed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        // Size-gate before signing so we know whether a split is needed
        // while queue order is still intact: defer the tail to the next
        // tick rather than interleave it into a second bundle now.
        let (this_batch, deferred): (Vec<_>, Vec<_>) =
            split_by_max_bundle_size(signable, self.config.max_bundle_size);

        for (row_id, _) in &deferred {
            self.queue.revert_to_pending(*row_id, None, self.config.max_retries).await?;
        }

        let oldest_ts = this_batch.iter().map(|(_, r)| r.entry.created_at).min();
        let signable_rows: Vec<SignableRow> = this_batch.into_iter().map(|(_, r)| r).collect();

        let head = self.chain_head.get(chain_key).await?;
        let sign_result = sign_sequential(signable_rows, &head, self.wallet.as_ref(), self.clock.now_ms());

        match self.config.upload_mode {
            UploadMode::Bundle => {
                self.process_bundle_mode(chain_key, sign_result.signed, oldest_ts, start).await
            }
            UploadMode::Direct => self.process_direct_mode(chain_key, sign_result.signed, start).await,
        }
    }

    async fn process_bundle_mode(
        &self,
        chain_key: &str,
        signed: Vec<crate::model::SignedRecord>,
        oldest_ts: Option<chrono::DateTime<chrono::Utc>>,
        start: Instant,
    ) -> Result<ProcessResult> {
        let total_size: usize = signed.iter().map(|r| r.payload_bytes.len()).sum();
        let oldest_age = oldest_ts
            .map(|ts| self.clock.now().signed_duration_since(ts))
            .unwrap_or_default();
        let time_threshold = chrono::Duration::from_std(self.config.bundle_time_threshold).unwrap_or_default();

        let should_upload =
            total_size as u64 >= self.config.bundle_size_threshold || oldest_age >= time_threshold;

        if !should_upload {
            for record in &signed {
                self.queue.revert_to_pending(record.row_id, None, self.config.max_retries).await?;
            }
            tracing::info!(
                batch_size = signed.len(),
                total_size,
                "bundle thresholds not met; reverting batch to pending"
            );
            return Ok(ProcessResult {
                processed: signed.len(),
                succeeded: 0,
                failed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let processed = signed.len();
        match self.uploader.upload_bundle(&signed).await {
            Ok(bundle_tx) => {
                let outcome = finalize(
                    self.chain_head.as_ref(),
                    self.queue.as_ref(),
                    self.index.as_ref(),
                    chain_key,
                    signed,
                    Vec::new(),
                    self.config.max_retries,
                )
                .await?;

                let items: Vec<TrackedItem> = outcome
                    .succeeded
                    .iter()
                    .map(|r| TrackedItem {
                        entity_id: r.entity_id.clone(),
                        cid: r.cid.clone(),
                    })
                    .collect();
                self.tracked_bundles
                    .insert(&new_tracked_bundle(bundle_tx, items, self.clock.now()))
                    .await?;

                Ok(ProcessResult {
                    processed,
                    succeeded: outcome.succeeded.len(),
                    failed: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(err) => {
                // All-or-nothing: every row in the bundle reverts to pending.
                tracing::warn!(error = %err, batch_size = processed, "bundle upload failed; reverting batch");
                let payment_required = matches!(
                    err.downcast_ref::<crate::error::DomainError>(),
                    Some(crate::error::DomainError::PaymentRequired)
                );
                for record in &signed {
                    self.queue
                        .revert_to_pending(record.row_id, Some(&err.to_string()), self.config.max_retries)
                        .await?;
                }
                if payment_required {
                    self.alerter
                        .fire(
                            Alert::new(
                                "attestation upload rejected",
                                "gateway returned payment required",
                                Severity::Error,
                            )
                            .with_field("batch_size", processed.to_string()),
                        )
                        .await;
                }
                Ok(ProcessResult {
                    processed,
                    succeeded: 0,
                    failed: processed,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn process_direct_mode(
        &self,
        chain_key: &str,
        signed: Vec<crate::model::SignedRecord>,
        start: Instant,
    ) -> Result<ProcessResult> {
        let processed = signed.len();
        let outcomes = self.uploader.upload_direct(&signed, self.config.concurrency).await;

        for outcome in &outcomes {
            if !outcome.success && outcome.error.as_deref() == Some("payment required") {
                self.alerter
                    .fire(
                        Alert::new(
                            "attestation upload rejected",
                            "gateway returned payment required",
                            Severity::Error,
                        )
                        .with_field("record_id", outcome.id.clone()),
                    )
                    .await;
            }
        }

        let (succeeded, failed) = longest_successful_prefix(signed, &outcomes);
        let succeeded_count = succeeded.len();
        let failed_count = failed.len();

        finalize(
            self.chain_head.as_ref(),
            self.queue.as_ref(),
            self.index.as_ref(),
            chain_key,
            succeeded,
            failed,
            self.config.max_retries,
        )
        .await?;

        Ok(ProcessResult {
            processed,
            succeeded: succeeded_count,
            failed: failed_count,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Balance-gated admission. Returns `None` if the check
    /// itself failed; failures must not block processing.
    async fn balance_gate(&self) -> Option<BalanceStatus> {
        let balance = match self.wallet.balance().await {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(error = %err, "balance check failed; proceeding without gating");
                return None;
            }
        };

        let status = classify_balance(
            balance,
            self.config.critical_balance_threshold,
            self.config.warning_balance_threshold,
        );

        match status {
            BalanceStatus::Critical => {
                self.alerter
                    .fire(
                        Alert::new(
                            "wallet balance critical",
                            format!("balance {balance} AR is below critical threshold"),
                            Severity::Critical,
                        )
                        .with_field("balance_ar", balance.to_string()),
                    )
                    .await;
            }
            BalanceStatus::Low => {
                self.alerter
                    .fire(
                        Alert::new(
                            "wallet balance low",
                            format!("balance {balance} AR is below warning threshold"),
                            Severity::Warn,
                        )
                        .with_field("balance_ar", balance.to_string()),
                    )
                    .await;
            }
            BalanceStatus::Ok => {}
        }

        Some(status)
    }

    /// Seeding verification pass, run after every processing tick.
    pub async fn verify_tick(&self) -> Result<()> {
        let (outcome, timed_out) = verifier::verify_tick(
            self.tracked_bundles.as_ref(),
            self.queue.as_ref(),
            self.uploader.as_ref(),
            self.clock.as_ref(),
            self.config.seed_grace_period,
            self.config.seed_timeout,
        )
        .await?;

        for bundle in &timed_out {
            self.alerter
                .fire(
                    Alert::new(
                        "bundle seeding timed out",
                        format!("{} records re-queued", bundle.items.len()),
                        Severity::Error,
                    )
                    .with_field("bundle_tx", bundle.bundle_tx.clone()),
                )
                .await;
        }

        if outcome.verified > 0 || outcome.failed > 0 {
            tracing::info!(
                verified = outcome.verified,
                failed = outcome.failed,
                still_pending = outcome.still_pending,
                "seeding verification pass complete"
            );
        }

        let cutoff = self.clock.now() - chrono::Duration::from_std(self.config.retention_window).unwrap_or_default();
        let pruned = self.tracked_bundles.prune_older_than(cutoff).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned retained tracked bundles past retention window");
        }

        Ok(())
    }

    /// The daily tick: retry failed-under-cap rows, then cleanup
    /// stuck rows once more.
    pub async fn daily_tick(&self) -> Result<()> {
        retry_failed_items(self.queue.as_ref(), self.config.max_retries).await?;
        cleanup_stuck(self.queue.as_ref(), self.clock.as_ref(), self.config.stuck_threshold).await?;
        Ok(())
    }
}

/// Splits a queue-ordered batch by cumulative manifest byte size,
/// deferring the tail to the next tick rather than interleaving.
fn split_by_max_bundle_size(
    rows: Vec<(i64, SignableRow)>,
    max_bundle_size: u64,
) -> (Vec<(i64, SignableRow)>, Vec<(i64, SignableRow)>) {
    let mut total: u64 = 0;
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut splitting = false;

    for (row_id, row) in rows {
        if splitting {
            tail.push((row_id, row));
            continue;
        }
        let size = serde_json::to_vec(&row.manifest).map(|v| v.len() as u64).unwrap_or(0);
        if total + size > max_bundle_size && !head.is_empty() {
            splitting = true;
            tail.push((row_id, row));
            continue;
        }
        total += size;
        head.push((row_id, row));
    }

    (head, tail)
}
