use crate::bundle::{build_bundle, pack_item};
use crate::error::DomainError;
use crate::model::{SignedRecord, UploadOutcome};
use async_trait::async_trait;
use eyre::Result;
use futures::stream::{self, StreamExt};
use std::time::Duration;

/// `upload(batch) -> per-record outcome`. In bundle mode the
/// uploader posts one container and then polls the gateway's status
/// endpoint before reporting success, guarding against "ghost uploads"
/// where HTTP 200 is returned but the data never propagates.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads each record individually, bounded by `concurrency`.
    async fn upload_direct(&self, records: &[SignedRecord], concurrency: usize) -> Vec<UploadOutcome>;

    /// Packs `records` into one bundle transaction and uploads it.
    /// Returns the bundle transaction id on success.
    async fn upload_bundle(&self, records: &[SignedRecord]) -> Result<String>;

    /// Queries the gateway for confirmations of `tx`. `Ok(true)` means
    /// seeded (>= 1 confirmation).
    async fn check_seeded(&self, tx: &str) -> Result<bool>;
}

pub struct GatewayUploader {
    client: reqwest::Client,
    base_url: String,
    upload_timeout: Duration,
    max_retries: u32,
}

impl GatewayUploader {
    pub fn new(base_url: String, upload_timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(upload_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            upload_timeout,
            max_retries,
        })
    }

    async fn post_record(&self, record: &SignedRecord, max_retries: u32) -> UploadOutcome {
        let item = pack_item(record);
        let url = format!("{}/tx", self.base_url.trim_end_matches('/'));
        let mut delay = Duration::from_millis(200);

        for attempt in 1..=max_retries.max(1) {
            let resp = self
                .client
                .post(&url)
                .header("Content-Type", "application/octet-stream")
                .body(item.bytes.clone())
                .send()
                .await;

            match resp {
                Ok(r) if r.status() == reqwest::StatusCode::PAYMENT_REQUIRED => {
                    return UploadOutcome {
                        id: record.id.clone(),
                        success: false,
                        error: Some("payment required".to_string()),
                        attempts: attempt,
                    };
                }
                Ok(r) if r.status().is_success() => {
                    return UploadOutcome {
                        id: record.id.clone(),
                        success: true,
                        error: None,
                        attempts: attempt,
                    };
                }
                Ok(r) => {
                    let status = r.status();
                    if attempt == max_retries {
                        return UploadOutcome {
                            id: record.id.clone(),
                            success: false,
                            error: Some(format!("upload rejected: {status}")),
                            attempts: attempt,
                        };
                    }
                }
                Err(err) => {
                    if attempt == max_retries {
                        return UploadOutcome {
                            id: record.id.clone(),
                            success: false,
                            error: Some(err.to_string()),
                            attempts: attempt,
                        };
                    }
                }
            }

            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }

        UploadOutcome {
            id: record.id.clone(),
            success: false,
            error: Some("exhausted retries".to_string()),
            attempts: max_retries,
        }
    }
}

#[async_trait]
impl Uploader for GatewayUploader {
    async fn upload_direct(&self, records: &[SignedRecord], concurrency: usize) -> Vec<UploadOutcome> {
        stream::iter(records)
            .map(|record| self.post_record(record, self.max_retries))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    async fn upload_bundle(&self, records: &[SignedRecord]) -> Result<String> {
        let items: Vec<_> = records.iter().map(pack_item).collect();
        let bundle_bytes = build_bundle(&items);

        let url = format!("{}/tx", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Bundle-Format", "binary")
            .header("Bundle-Version", "2.0.0")
            .timeout(self.upload_timeout)
            .body(bundle_bytes)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(DomainError::PaymentRequired.into());
        }
        let resp = resp.error_for_status()?;
        let tx: BundleTxResponse = resp.json().await?;
        Ok(tx.id)
    }

    async fn check_seeded(&self, tx: &str) -> Result<bool> {
        let url = format!("{}/tx/{}/status", self.base_url.trim_end_matches('/'), tx);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let resp = resp.error_for_status()?;
        let status: StatusResponse = resp.json().await?;
        Ok(status.number_of_confirmations >= 1)
    }
}

#[derive(serde::Deserialize)]
struct BundleTxResponse {
    id: String,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    #[serde(default)]
    number_of_confirmations: u64,
}

/// A controllable fake for tests: per-record success/failure is scripted
/// up front so tests can reproduce the longest-prefix and all-or-nothing
/// upload scenarios exactly.
pub mod test_util {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedUploader {
        pub fail_ids: Mutex<HashSet<String>>,
        pub bundle_should_fail: Mutex<bool>,
        pub seeded: Mutex<HashMap<String, bool>>,
        pub bundle_tx_counter: Mutex<u64>,
    }

    impl ScriptedUploader {
        pub fn fail(&self, id: &str) {
            self.fail_ids.lock().unwrap().insert(id.to_string());
        }

        pub fn fail_bundle(&self) {
            *self.bundle_should_fail.lock().unwrap() = true;
        }

        pub fn set_seeded(&self, tx: &str, seeded: bool) {
            self.seeded.lock().unwrap().insert(tx.to_string(), seeded);
        }
    }

    #[async_trait]
    impl Uploader for ScriptedUploader {
        async fn upload_direct(&self, records: &[SignedRecord], _concurrency: usize) -> Vec<UploadOutcome> {
            let fail_ids = self.fail_ids.lock().unwrap();
            records
                .iter()
                .map(|r| {
                    let fails = fail_ids.contains(&r.id);
                    UploadOutcome {
                        id: r.id.clone(),
                        success: !fails,
                        error: fails.then(|| "scripted failure".to_string()),
                        attempts: 1,
                    }
                })
                .collect()
        }

        async fn upload_bundle(&self, _records: &[SignedRecord]) -> Result<String> {
            if *self.bundle_should_fail.lock().unwrap() {
                return Err(eyre::eyre!("scripted bundle failure"));
            }
            let mut counter = self.bundle_tx_counter.lock().unwrap();
            *counter += 1;
            Ok(format!("BUNDLE_TX_{counter}"))
        }

        async fn check_seeded(&self, tx: &str) -> Result<bool> {
            Ok(*self.seeded.lock().unwrap().get(tx).unwrap_or(&false))
        }
    }
}
