use attest_chain::admin::{self, AdminState};
use attest_chain::chain_head::SqliteChainHeadStore;
use attest_chain::clock::SystemClock;
use attest_chain::config::{Args, Config};
use attest_chain::index::SqliteLookupIndexStore;
use attest_chain::manifest::HttpManifestSource;
use attest_chain::queue::SqliteQueueStore;
use attest_chain::scheduler::Daemon;
use attest_chain::uploader::GatewayUploader;
use attest_chain::verifier::SqliteTrackedBundleStore;
use attest_chain::wallet::{LiveWallet, Wallet};
use attest_chain::alert::WebhookAlerter;
use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use sqlx::sqlite::SqlitePoolOptions;
use std::fs::OpenOptions;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_args(args)?;

    // Single-instance guard, alongside the database file: two writers
    // advancing the same chain key would race on signing order.
    let lock_path = lock_path_for(&config.database_url);
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("another instance is already running ({}): {e}", lock_path.display()))?;
    let _lock_guard = lock_file;

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .map_err(|e| eyre!("failed to open database {}: {e}", config.database_url))?;

    SqliteChainHeadStore::migrate(&pool).await?;
    SqliteQueueStore::migrate(&pool).await?;
    SqliteLookupIndexStore::migrate(&pool).await?;
    SqliteTrackedBundleStore::migrate(&pool).await?;

    let wallet = Arc::new(LiveWallet::from_env(
        &config.wallet_key_env,
        config.wallet_balance_url.clone(),
    )?);

    let uploader = Arc::new(GatewayUploader::new(
        config.gateway_url.clone(),
        config.upload_timeout,
        config.max_retries as u32,
    )?);
    let manifests = Arc::new(HttpManifestSource::new(config.manifest_url.clone(), config.upload_timeout)?);
    let alerter = Arc::new(WebhookAlerter::new(config.alert_webhook.clone()));
    let clock = Arc::new(SystemClock);

    tracing::info!(
        chain_key = %config.chain_key,
        upload_mode = ?config.upload_mode,
        address = %wallet.address(),
        admin_bind = %config.admin_bind,
        once = config.once,
        "attestation chain writer starting"
    );

    let daemon = Arc::new(Daemon {
        config: config.clone(),
        chain_head: Arc::new(SqliteChainHeadStore::new(pool.clone())),
        queue: Arc::new(SqliteQueueStore::new(pool.clone())),
        manifests,
        index: Arc::new(SqliteLookupIndexStore::new(pool.clone())),
        tracked_bundles: Arc::new(SqliteTrackedBundleStore::new(pool.clone())),
        wallet,
        uploader,
        alerter,
        clock,
        last_batch: std::sync::Mutex::new(None),
    });

    let admin_state = AdminState {
        daemon: daemon.clone(),
        admin_secret: config.admin_secret.clone(),
        test_chain_key: format!("{}:test", config.chain_key),
    };
    let admin_bind = config.admin_bind.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(err) = admin::serve(admin_state, &admin_bind).await {
            tracing::error!(error = %err, "admin HTTP surface exited");
        }
    });

    let processing = run_processing_loop(daemon.clone());
    let daily = run_daily_loop(daemon.clone());

    tokio::select! {
        result = processing => result?,
        result = daily => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    admin_handle.abort();
    Ok(())
}

fn lock_path_for(database_url: &str) -> std::path::PathBuf {
    let stripped = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    std::path::PathBuf::from(stripped).with_extension("lock")
}

async fn run_processing_loop(daemon: Arc<Daemon>) -> Result<()> {
    loop {
        let tick_start = std::time::Instant::now();
        match tokio::time::timeout(daemon.config.max_process_time, daemon.process_tick()).await {
            Ok(Ok(result)) => {
                if result.processed > 0 {
                    tracing::info!(
                        processed = result.processed,
                        succeeded = result.succeeded,
                        failed = result.failed,
                        duration_ms = result.duration_ms,
                        "processing tick complete"
                    );
                }
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "processing tick failed");
            }
            Err(_) => {
                tracing::warn!(
                    max_process_time_secs = daemon.config.max_process_time.as_secs(),
                    "processing tick exceeded its time budget; continuing"
                );
            }
        }

        if let Err(err) = daemon.verify_tick().await {
            tracing::error!(error = %err, "seeding verification pass failed");
        }

        if daemon.config.once {
            return Ok(());
        }

        let elapsed = tick_start.elapsed();
        let remaining = daemon.config.tick_period.saturating_sub(elapsed);
        tokio::time::sleep(remaining).await;
    }
}

async fn run_daily_loop(daemon: Arc<Daemon>) -> Result<()> {
    if daemon.config.once {
        return std::future::pending().await;
    }
    loop {
        tokio::time::sleep(daemon.config.daily_tick_period).await;
        if let Err(err) = daemon.daily_tick().await {
            tracing::error!(error = %err, "daily retry/cleanup tick failed");
        }
    }
}
