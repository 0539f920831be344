//! Billing error types

use thiserror::Error;

/// Errors produced by the billing event processor
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("Malformed event payload: {0}")]
    MalformedPayload(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Entitlement sync failed: {0}")]
    EntitlementSync(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// Whether this error means an event was recognized but could not be
    /// applied (as opposed to a transport/storage failure). Used by the
    /// dispatcher when deciding what to write into the ledger's
    /// `error_detail`.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, BillingError::AccountNotFound(_))
    }
}
