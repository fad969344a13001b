use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single authoritative `{tx, cid, seq}` pointer for a chain key.
/// Absent row reads back as genesis: `{None, None, 0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub tx: Option<String>,
    pub cid: Option<String>,
    pub seq: i64,
    pub updated_at: DateTime<Utc>,
}

impl ChainHead {
    pub fn genesis(now: DateTime<Utc>) -> Self {
        Self {
            tx: None,
            cid: None,
            seq: 0,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Signing,
    Uploading,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Signing => "signing",
            QueueStatus::Uploading => "uploading",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "signing" => Some(QueueStatus::Signing),
            "uploading" => Some(QueueStatus::Uploading),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Create.
    C,
    /// Update.
    U,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::C => "C",
            Operation::U => "U",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "C" => Some(Operation::C),
            "U" => Some(Operation::U),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Pub,
    Priv,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Pub => "pub",
            Visibility::Priv => "priv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pub" => Some(Visibility::Pub),
            "priv" => Some(Visibility::Priv),
            _ => None,
        }
    }
}

/// A persisted attestation request. Uniqueness of `(entity_id, cid)` is
/// enforced on re-queue, not on the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_id: String,
    pub cid: String,
    pub op: Operation,
    pub vis: Visibility,
    pub ts: DateTime<Utc>,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A manifest read from the external manifest source. Must carry at
/// least a numeric version; other fields are opaque and embedded
/// verbatim into the attestation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub ver: i64,
    #[serde(flatten)]
    pub body: serde_json::Value,
}

/// The JSON payload that gets uploaded, signed byte-for-byte as serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub pi: String,
    pub ver: i64,
    pub cid: String,
    pub op: Operation,
    pub vis: Visibility,
    pub ts: i64,
    pub prev_tx: Option<String>,
    pub prev_cid: Option<String>,
    pub seq: i64,
    pub manifest: serde_json::Value,
}

/// A signed record, pre-upload. Its `id` is known immediately because the
/// signature is deterministic from `(payload, key)`.
#[derive(Debug, Clone)]
pub struct SignedRecord {
    pub row_id: i64,
    pub entity_id: String,
    pub cid: String,
    pub payload: AttestationPayload,
    pub payload_bytes: Vec<u8>,
    pub signature: Vec<u8>,
    pub owner_pubkey: Vec<u8>,
    pub id: String,
}

/// Per-record upload outcome, in the same order records were signed.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

/// A bundle transaction tracked for seeding verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedBundle {
    pub bundle_tx: String,
    pub items: Vec<TrackedItem>,
    pub item_count: i64,
    pub uploaded_at: DateTime<Utc>,
    pub check_count: i64,
    pub verified_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    pub entity_id: String,
    pub cid: String,
}

/// Value stored under `attest:{entity_id}:{ver}` and `attest:{entity_id}:latest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupEntry {
    pub cid: String,
    pub tx: String,
    pub seq: i64,
    pub ts: i64,
    pub bundled: bool,
}

/// Outcome of a single processing tick, returned by `POST /trigger`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessResult {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Bundle,
    Direct,
}
