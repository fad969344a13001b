//! Admin HTTP surface, grounded in the RPC server shape of a
//! production daemon: a flat set of routes backed by `web::Data` handles,
//! with a `thiserror`-derived error type mapped to HTTP status codes.

use crate::chain_head::ChainHeadStore;
use crate::clock::Clock;
use crate::model::{Operation, ProcessResult, Visibility};
use crate::queue::QueueStore;
use crate::scheduler::Daemon;
use crate::verifier::TrackedBundleStore;
use crate::wallet::classify_balance;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

impl actix_web::ResponseError for AdminError {
    fn error_response(&self) -> HttpResponse {
        match self {
            AdminError::Unauthorized => HttpResponse::Unauthorized().json(ErrorBody {
                error: self.to_string(),
            }),
            AdminError::BadRequest(_) => HttpResponse::BadRequest().json(ErrorBody {
                error: self.to_string(),
            }),
            AdminError::Internal(_) => HttpResponse::InternalServerError().json(ErrorBody {
                error: self.to_string(),
            }),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct AdminState {
    pub daemon: Arc<Daemon>,
    pub admin_secret: Option<String>,
    pub test_chain_key: String,
}

fn require_auth(req: &HttpRequest, state: &AdminState) -> Result<(), AdminError> {
    let Some(secret) = &state.admin_secret else {
        return Ok(());
    };
    let provided = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(secret.as_str()) {
        Ok(())
    } else {
        Err(AdminError::Unauthorized)
    }
}

#[derive(Serialize)]
struct DashboardConfig {
    batch_size: usize,
    bundle_size_threshold: u64,
    bundle_time_threshold_seconds: u64,
}

#[derive(Serialize)]
struct DashboardChain {
    seq: i64,
    head_tx: Option<String>,
}

#[derive(Serialize)]
struct DashboardQueue {
    pending: i64,
    processing: i64,
    failed: i64,
    total: i64,
}

#[derive(Serialize)]
struct DashboardWallet {
    address: String,
    balance_ar: f64,
    status: &'static str,
}

#[derive(Serialize)]
struct DashboardVerification {
    pending_bundles: usize,
    verified_last_24h: i64,
    failed_last_24h: i64,
}

#[derive(Serialize)]
struct DashboardBody {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    config: DashboardConfig,
    chain: DashboardChain,
    queue: DashboardQueue,
    #[serde(skip_serializing_if = "Option::is_none")]
    wallet: Option<DashboardWallet>,
    verification: DashboardVerification,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_batch: Option<ProcessResult>,
}

/// `GET /`: health/dashboard snapshot. Unauthenticated: read-only status
/// is safe to expose, matching the reference daemon's public `getinfo`.
async fn dashboard(state: web::Data<AdminState>) -> Result<HttpResponse, AdminError> {
    let daemon = &state.daemon;
    let queue = daemon.queue.stats().await?;
    let chain_head = daemon.chain_head.get(&daemon.config.chain_key).await?;

    let since = daemon.clock.now() - chrono::Duration::hours(24);
    let verification_counts = daemon.tracked_bundles.counts_last(since).await?;
    let pending_bundles = daemon.tracked_bundles.pending().await?.len();

    let wallet = match daemon.wallet.balance().await {
        Ok(ar) => {
            let status = classify_balance(
                ar,
                daemon.config.critical_balance_threshold,
                daemon.config.warning_balance_threshold,
            );
            Some(DashboardWallet {
                address: daemon.wallet.address(),
                balance_ar: ar,
                status: match status {
                    crate::wallet::BalanceStatus::Ok => "ok",
                    crate::wallet::BalanceStatus::Low => "low",
                    crate::wallet::BalanceStatus::Critical => "critical",
                },
            })
        }
        Err(err) => {
            tracing::warn!(error = %err, "wallet balance unavailable for dashboard");
            None
        }
    };

    let last_batch = daemon.last_batch.lock().unwrap().clone();

    Ok(HttpResponse::Ok().json(DashboardBody {
        status: "ok",
        service: "attest-chain",
        version: env!("CARGO_PKG_VERSION"),
        config: DashboardConfig {
            batch_size: daemon.config.batch_size,
            bundle_size_threshold: daemon.config.bundle_size_threshold,
            bundle_time_threshold_seconds: daemon.config.bundle_time_threshold.as_secs(),
        },
        chain: DashboardChain {
            seq: chain_head.seq,
            head_tx: chain_head.tx,
        },
        queue: DashboardQueue {
            pending: queue.pending,
            processing: queue.signing + queue.uploading,
            failed: queue.failed,
            total: queue.total,
        },
        wallet,
        verification: DashboardVerification {
            pending_bundles,
            verified_last_24h: verification_counts.verified,
            failed_last_24h: verification_counts.failed,
        },
        last_batch,
    }))
}

/// `POST /trigger`: runs one processing tick plus a verification pass,
/// returning the tick's outcome. Gated by the bearer secret, if set.
async fn trigger(req: HttpRequest, state: web::Data<AdminState>) -> Result<HttpResponse, AdminError> {
    require_auth(&req, &state)?;
    let result: ProcessResult = state.daemon.process_tick().await?;
    state.daemon.verify_tick().await?;
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Deserialize)]
struct TestBundleQuery {
    count: usize,
}

#[derive(Serialize)]
struct TestBundleBody {
    enqueued: usize,
    result: ProcessResult,
}

/// `POST /test-bundle?count=N`: enqueues `N` synthetic records against the
/// isolated test chain key and runs one tick, exercising the full
/// sign/bundle/upload/finalize path without touching the production head.
async fn test_bundle(
    req: HttpRequest,
    state: web::Data<AdminState>,
    query: web::Query<TestBundleQuery>,
) -> Result<HttpResponse, AdminError> {
    require_auth(&req, &state)?;
    let count = query.count;
    if count == 0 || count > 100 {
        return Err(AdminError::BadRequest(
            "count must be between 1 and 100".to_string(),
        ));
    }

    for i in 0..count {
        state
            .daemon
            .queue
            .enqueue(
                &format!("test-entity-{i}"),
                &format!("test-cid-{i}"),
                Operation::U,
                Visibility::Pub,
            )
            .await?;
    }

    let result = state.daemon.process_tick_for(&state.test_chain_key).await?;
    Ok(HttpResponse::Ok().json(TestBundleBody {
        enqueued: count,
        result,
    }))
}

#[derive(Deserialize)]
struct InjectTrackedBundle {
    bundle_tx: String,
    entity_id: String,
    cid: String,
}

#[derive(Serialize)]
struct TrackedBundleListBody {
    pending: Vec<crate::model::TrackedBundle>,
}

/// `GET /test-verify`: lists tracked bundles still awaiting seeding
/// confirmation.
async fn test_verify_get(state: web::Data<AdminState>) -> Result<HttpResponse, AdminError> {
    let pending = state.daemon.tracked_bundles.pending().await?;
    Ok(HttpResponse::Ok().json(TrackedBundleListBody { pending }))
}

/// `POST /test-verify`: injects a synthetic tracked bundle so a test run
/// can exercise the seeding-verification path without a real upload.
async fn test_verify_post(
    req: HttpRequest,
    state: web::Data<AdminState>,
    body: web::Json<InjectTrackedBundle>,
) -> Result<HttpResponse, AdminError> {
    require_auth(&req, &state)?;
    let bundle = crate::verifier::new_tracked_bundle(
        body.bundle_tx.clone(),
        vec![crate::model::TrackedItem {
            entity_id: body.entity_id.clone(),
            cid: body.cid.clone(),
        }],
        state.daemon.clock.now(),
    );
    state.daemon.tracked_bundles.insert(&bundle).await?;
    Ok(HttpResponse::Ok().json(bundle))
}

pub async fn serve(state: AdminState, bind: &str) -> eyre::Result<()> {
    let state = web::Data::new(state);
    tracing::info!(bind, "admin HTTP surface listening");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(dashboard))
            .route("/trigger", web::post().to(trigger))
            .route("/test-bundle", web::post().to(test_bundle))
            .route("/test-verify", web::get().to(test_verify_get))
            .route("/test-verify", web::post().to(test_verify_post))
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
