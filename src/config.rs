use crate::model::UploadMode;
use clap::Parser;
use eyre::{eyre, Result};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "attest-chain",
    version,
    about = "Asynchronous write path for the attestation chain"
)]
pub struct Args {
    /// Sqlite database URL (queue, chain head, lookup index, tracked bundles).
    #[arg(long, env = "ATTEST_DATABASE_URL", default_value = "sqlite://attest-chain.db")]
    pub database_url: String,

    /// Chain key to advance. Production uses "head"; /test-bundle uses an isolated key.
    #[arg(long, default_value = "head")]
    pub chain_key: String,

    /// Environment variable name holding the wallet signing key (hex-encoded 32-byte seed).
    #[arg(long, default_value = "ATTEST_WALLET_KEY")]
    pub wallet_key_env: String,

    /// Base URL of the storage network gateway (upload + status endpoints).
    #[arg(long, env = "ATTEST_GATEWAY_URL", default_value = "https://arweave.net")]
    pub gateway_url: String,

    /// Base URL of the external manifest key-value service (C3).
    #[arg(long, env = "ATTEST_MANIFEST_URL")]
    pub manifest_url: String,

    /// Base URL of the wallet balance endpoint.
    #[arg(long, env = "ATTEST_WALLET_BALANCE_URL")]
    pub wallet_balance_url: Option<String>,

    /// Optional alert webhook URL. Absent => log-only alerting.
    #[arg(long, env = "ATTEST_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Upload mode: bundle (default, batches many records into one tx) or direct.
    #[arg(long, value_enum, default_value = "bundle")]
    pub upload_mode: UploadModeArg,

    /// Admin HTTP bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub admin_bind: String,

    /// Bearer secret for admin mutating routes. Absent => no auth (local/dev only).
    #[arg(long, env = "ATTEST_ADMIN_SECRET")]
    pub admin_secret: Option<String>,

    /// How many pending rows to fetch per tick.
    #[arg(long, default_value_t = 200)]
    pub batch_size: usize,

    /// Bundle upload when accumulated size crosses this many bytes.
    #[arg(long, default_value_t = 300 * 1024)]
    pub bundle_size_threshold: u64,

    /// Bundle upload when the oldest queued row is at least this old (seconds).
    #[arg(long, default_value_t = 600)]
    pub bundle_time_threshold_seconds: u64,

    /// Hard cap on bundle size; batches are split (tail deferred) above this.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_bundle_size: u64,

    /// Direct-mode upload concurrency.
    #[arg(long, default_value_t = 50)]
    pub concurrency: usize,

    /// Maximum retry attempts before a row is abandoned.
    #[arg(long, default_value_t = 5)]
    pub max_retries: i64,

    /// Per-request upload timeout (seconds).
    #[arg(long, default_value_t = 30)]
    pub upload_timeout_seconds: u64,

    /// Rows stuck in signing/uploading longer than this (seconds) are reclaimed.
    #[arg(long, default_value_t = 600)]
    pub stuck_threshold_seconds: u64,

    /// Grace period (seconds) before a tracked bundle is first checked for seeding.
    #[arg(long, default_value_t = 600)]
    pub seed_grace_period_seconds: u64,

    /// Seconds after which an unconfirmed bundle is declared failed and re-queued.
    #[arg(long, default_value_t = 1800)]
    pub seed_timeout_seconds: u64,

    /// How long verified/failed tracked bundles are retained for operator visibility (seconds).
    #[arg(long, default_value_t = 86_400)]
    pub retention_window_seconds: u64,

    /// Below this AR balance, skip processing entirely and alert critical.
    #[arg(long, default_value_t = 0.05)]
    pub critical_balance_threshold: f64,

    /// Below this AR balance (but above critical), proceed and alert warning.
    #[arg(long, default_value_t = 2.0)]
    pub warning_balance_threshold: f64,

    /// Bound on a single tick's wall-clock time (seconds); overrun is not fatal.
    #[arg(long, default_value_t = 55)]
    pub max_process_time_seconds: u64,

    /// Processing tick period (seconds).
    #[arg(long, default_value_t = 60)]
    pub tick_period_seconds: u64,

    /// Daily retry/cleanup tick period (seconds). Default once per day.
    #[arg(long, default_value_t = 86_400)]
    pub daily_tick_period_seconds: u64,

    /// Run a single tick then exit, instead of looping.
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UploadModeArg {
    Bundle,
    Direct,
}

impl From<UploadModeArg> for UploadMode {
    fn from(v: UploadModeArg) -> Self {
        match v {
            UploadModeArg::Bundle => UploadMode::Bundle,
            UploadModeArg::Direct => UploadMode::Direct,
        }
    }
}

/// Resolved, validated runtime configuration. Durations are pre-converted
/// so the rest of the codebase never has to remember which fields are
/// seconds vs. `Duration`, the same normalization the reference bot's
/// `KeeperConfig::from_cli_and_deployment` performs.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub chain_key: String,
    pub wallet_key_env: String,
    pub gateway_url: String,
    pub manifest_url: String,
    pub wallet_balance_url: Option<String>,
    pub alert_webhook: Option<String>,
    pub upload_mode: UploadMode,
    pub admin_bind: String,
    pub admin_secret: Option<String>,

    pub batch_size: usize,
    pub bundle_size_threshold: u64,
    pub bundle_time_threshold: Duration,
    pub max_bundle_size: u64,
    pub concurrency: usize,
    pub max_retries: i64,
    pub upload_timeout: Duration,
    pub stuck_threshold: Duration,
    pub seed_grace_period: Duration,
    pub seed_timeout: Duration,
    pub retention_window: Duration,
    pub critical_balance_threshold: f64,
    pub warning_balance_threshold: f64,
    pub max_process_time: Duration,
    pub tick_period: Duration,
    pub daily_tick_period: Duration,
    pub once: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.batch_size == 0 {
            return Err(eyre!("batch size must be > 0"));
        }
        if args.concurrency == 0 {
            return Err(eyre!("concurrency must be > 0"));
        }
        if args.max_retries <= 0 {
            return Err(eyre!("max retries must be > 0"));
        }
        if args.max_bundle_size < args.bundle_size_threshold {
            tracing::warn!(
                max_bundle_size = args.max_bundle_size,
                bundle_size_threshold = args.bundle_size_threshold,
                "max bundle size is below the upload threshold; every bundle will be split"
            );
        }
        if args.critical_balance_threshold > args.warning_balance_threshold {
            return Err(eyre!(
                "critical balance threshold ({}) must be <= warning threshold ({})",
                args.critical_balance_threshold,
                args.warning_balance_threshold
            ));
        }

        Ok(Self {
            database_url: args.database_url,
            chain_key: args.chain_key,
            wallet_key_env: args.wallet_key_env,
            gateway_url: args.gateway_url,
            manifest_url: args.manifest_url,
            wallet_balance_url: args.wallet_balance_url,
            alert_webhook: args.alert_webhook,
            upload_mode: args.upload_mode.into(),
            admin_bind: args.admin_bind,
            admin_secret: args.admin_secret,
            batch_size: args.batch_size,
            bundle_size_threshold: args.bundle_size_threshold,
            bundle_time_threshold: Duration::from_secs(args.bundle_time_threshold_seconds),
            max_bundle_size: args.max_bundle_size,
            concurrency: args.concurrency,
            max_retries: args.max_retries,
            upload_timeout: Duration::from_secs(args.upload_timeout_seconds.max(1)),
            stuck_threshold: Duration::from_secs(args.stuck_threshold_seconds.max(1)),
            seed_grace_period: Duration::from_secs(args.seed_grace_period_seconds),
            seed_timeout: Duration::from_secs(args.seed_timeout_seconds.max(1)),
            retention_window: Duration::from_secs(args.retention_window_seconds.max(1)),
            critical_balance_threshold: args.critical_balance_threshold,
            warning_balance_threshold: args.warning_balance_threshold,
            max_process_time: Duration::from_secs(args.max_process_time_seconds.max(1)),
            tick_period: Duration::from_secs(args.tick_period_seconds.max(1)),
            daily_tick_period: Duration::from_secs(args.daily_tick_period_seconds.max(1)),
            once: args.once,
        })
    }
}
