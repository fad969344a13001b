use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use eyre::{eyre, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceStatus {
    Ok,
    Low,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub ar: f64,
    pub status: BalanceStatus,
}

/// Holds the signing key and reports spendable balance. Balance
/// check failures must not block processing; callers log and ignore.
#[async_trait]
pub trait Wallet: Send + Sync {
    fn signing_key(&self) -> &SigningKey;
    fn address(&self) -> String;
    async fn balance(&self) -> Result<f64>;
}

pub struct LiveWallet {
    key: SigningKey,
    client: reqwest::Client,
    balance_url: Option<String>,
}

impl LiveWallet {
    /// Loads the signing key from a hex-encoded 32-byte seed in the named
    /// environment variable, exactly the indirection the reference bot
    /// uses for its private key: the CLI never accepts key material
    /// directly.
    pub fn from_env(env_var: &str, balance_url: Option<String>) -> Result<Self> {
        let raw = std::env::var(env_var)
            .map_err(|_| eyre!("missing wallet key env var '{env_var}'. Set it before running."))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| eyre!("invalid wallet key in {env_var}: {e}"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre!("wallet key in {env_var} must decode to exactly 32 bytes"))?;
        let key = SigningKey::from_bytes(&seed);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            key,
            client,
            balance_url,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

#[async_trait]
impl Wallet for LiveWallet {
    fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    fn address(&self) -> String {
        base64_url(self.key.verifying_key().as_bytes())
    }

    async fn balance(&self) -> Result<f64> {
        let Some(url) = &self.balance_url else {
            // No balance endpoint configured: treat as comfortably funded
            // rather than failing every tick on a missing optional config.
            return Ok(f64::MAX);
        };
        let url = format!("{}/wallet/{}/balance", url.trim_end_matches('/'), self.address());
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let text = resp.text().await?;
        let winston: u128 = text
            .trim()
            .parse()
            .map_err(|e| eyre!("balance endpoint returned non-numeric body: {e}"))?;
        // 1 AR = 1e12 winston, the storage network's smallest unit.
        Ok(winston as f64 / 1e12)
    }
}

pub fn classify_balance(ar: f64, critical: f64, warning: f64) -> BalanceStatus {
    if ar < critical {
        BalanceStatus::Critical
    } else if ar < warning {
        BalanceStatus::Low
    } else {
        BalanceStatus::Ok
    }
}

pub fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Fixed test wallet: deterministic key, no network balance check.
pub struct TestWallet {
    key: SigningKey,
    pub fixed_balance: std::sync::atomic::AtomicU64,
}

impl TestWallet {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
            fixed_balance: std::sync::atomic::AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_balance_ar(&self, ar: f64) {
        self.fixed_balance
            .store((ar * 1e6) as u64, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Wallet for TestWallet {
    fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    fn address(&self) -> String {
        base64_url(self.key.verifying_key().as_bytes())
    }

    async fn balance(&self) -> Result<f64> {
        Ok(self.fixed_balance.load(std::sync::atomic::Ordering::SeqCst) as f64 / 1e6)
    }
}
