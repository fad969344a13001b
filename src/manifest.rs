use crate::model::Manifest;
use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Read-only `cid -> manifest` lookup; production deployments point this
/// at the key-value store that holds manifest bodies. Returns `Ok(None)`
/// for a missing manifest (the row is marked failed, no retry) and `Err`
/// only for transport failures (the row reverts to pending for retry).
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn get(&self, cid: &str) -> Result<Option<Manifest>>;
}

/// Fetches manifests from an HTTP key-value service at `{base_url}/{cid}`.
pub struct HttpManifestSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpManifestSource {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn get(&self, cid: &str) -> Result<Option<Manifest>> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), cid);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let manifest: Manifest = resp.json().await?;
        if manifest.ver <= 0 {
            return Ok(None);
        }
        Ok(Some(manifest))
    }
}

#[derive(Default)]
pub struct InMemoryManifestSource {
    manifests: Mutex<HashMap<String, Manifest>>,
}

impl InMemoryManifestSource {
    pub fn insert(&self, cid: impl Into<String>, ver: i64, body: serde_json::Value) {
        self.manifests
            .lock()
            .unwrap()
            .insert(cid.into(), Manifest { ver, body });
    }
}

#[async_trait]
impl ManifestSource for InMemoryManifestSource {
    async fn get(&self, cid: &str) -> Result<Option<Manifest>> {
        Ok(self.manifests.lock().unwrap().get(cid).cloned())
    }
}
