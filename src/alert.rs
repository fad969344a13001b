use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub detail: String,
    pub severity: Severity,
    pub fields: HashMap<String, String>,
}

impl Alert {
    pub fn new(title: impl Into<String>, detail: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
            severity,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Fire-and-forget delivery to an operator-configured webhook.
/// Absent webhook => log only; delivery failures are themselves only
/// logged, never propagated, since alerting must never block the tick.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn fire(&self, alert: Alert);
}

pub struct WebhookAlerter {
    client: reqwest::Client,
    webhook: Option<String>,
}

impl WebhookAlerter {
    pub fn new(webhook: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client build cannot fail with this config");
        Self { client, webhook }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn fire(&self, alert: Alert) {
        match alert.severity {
            Severity::Critical => tracing::error!(title = %alert.title, detail = %alert.detail, "critical alert"),
            Severity::Error => tracing::error!(title = %alert.title, detail = %alert.detail, "error alert"),
            Severity::Warn => tracing::warn!(title = %alert.title, detail = %alert.detail, "warning alert"),
        }

        let Some(webhook) = &self.webhook else {
            return;
        };

        if let Err(err) = self.client.post(webhook).json(&alert).send().await {
            tracing::warn!(error = %err, "failed to deliver alert webhook; continuing");
        }
    }
}

/// Test double that records fired alerts instead of sending HTTP.
#[derive(Default)]
pub struct RecordingAlerter {
    pub fired: std::sync::Mutex<Vec<Alert>>,
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn fire(&self, alert: Alert) {
        self.fired.lock().unwrap().push(alert);
    }
}
