use thiserror::Error;

/// Error kinds callers match on where the retry/alerting policy differs
/// by kind (payment-required is non-retryable and pages the operator,
/// unlike a chain-head update race); everything else flows through
/// `eyre` at the orchestration boundary.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("upload rejected: payment required")]
    PaymentRequired,

    #[error("chain head update failed after upload succeeded: {0}")]
    ChainHeadUpdateFailed(String),
}
