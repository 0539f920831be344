//! Idempotency ledger
//!
//! One row per externally-issued event id. The ledger is the only
//! linearization point in the pipeline: `admit` atomically claims exclusive
//! processing rights with INSERT ... ON CONFLICT so two concurrent
//! deliveries of the same event can never both run side effects.
//!
//! Status policy:
//! - `success`, `skipped`, `dead` are terminal. Redelivery short-circuits.
//! - `failed` is retry-eligible: a redelivery re-claims the record and the
//!   event is reprocessed from scratch, up to [`FAILED_ATTEMPT_LIMIT`]
//!   attempts, after which the record escalates to `dead`.
//! - `processing` means another invocation holds the claim; redelivery is
//!   acknowledged without reprocessing, unless the claim is older than
//!   [`PROCESSING_TIMEOUT_MINUTES`] (crashed invocation recovery).

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::EventType;

/// Retries allowed for a `failed` event before it is declared `dead`
pub const FAILED_ATTEMPT_LIMIT: i32 = 5;

/// Minutes after which a `processing` claim is considered abandoned
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Processing status of a ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Skipped,
    Dead,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
            ProcessingStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<ProcessingStatus> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "success" => Some(ProcessingStatus::Success),
            "failed" => Some(ProcessingStatus::Failed),
            "skipped" => Some(ProcessingStatus::Skipped),
            "dead" => Some(ProcessingStatus::Dead),
            _ => None,
        }
    }

    /// Terminal statuses never re-admit. `failed` is deliberately not
    /// terminal so transient failures recover on the sender's retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Success | ProcessingStatus::Skipped | ProcessingStatus::Dead
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Status the record already held when admission was refused
    pub prior_status: Option<ProcessingStatus>,
}

/// Durable gatekeeper for the event pipeline
pub struct ProcessingLedger {
    pool: PgPool,
}

impl ProcessingLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event.
    ///
    /// Claims succeed when the event was never seen, when a prior attempt
    /// ended `failed` (under the attempt cap), or when a `processing` claim
    /// has been stuck past the timeout. Every other case refuses admission
    /// and reports the record's current status.
    ///
    /// If the ledger itself is unreachable this returns the database error
    /// untouched: the caller must fail closed and perform no side effects.
    pub async fn admit(&self, external_id: &str, event_type: EventType) -> BillingResult<Admission> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_event_records
                (external_event_id, event_type, status, attempt_count, first_seen_at, last_updated_at)
            VALUES ($1, $2, 'processing', 1, NOW(), NOW())
            ON CONFLICT (external_event_id) DO UPDATE SET
                status = 'processing',
                attempt_count = billing_event_records.attempt_count + 1,
                last_updated_at = NOW()
            WHERE
                (billing_event_records.status = 'failed'
                 AND billing_event_records.attempt_count < $3)
                OR (billing_event_records.status = 'processing'
                    AND billing_event_records.last_updated_at < NOW() - make_interval(mins => $4))
            RETURNING external_event_id
            "#,
        )
        .bind(external_id)
        .bind(event_type.as_str())
        .bind(FAILED_ATTEMPT_LIMIT)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(Admission {
                admitted: true,
                prior_status: None,
            });
        }

        // Claim refused; report why so the dispatcher can acknowledge.
        let existing: Option<(String, i32)> = sqlx::query_as(
            "SELECT status, attempt_count FROM billing_event_records WHERE external_event_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        let (status_str, attempts) = existing.ok_or_else(|| {
            BillingError::Internal(format!(
                "ledger refused claim for {external_id} but no record exists"
            ))
        })?;

        let mut prior_status = ProcessingStatus::parse(&status_str).ok_or_else(|| {
            BillingError::Internal(format!("unknown ledger status '{status_str}'"))
        })?;

        // A failed record at the attempt cap escalates to dead so a
        // misbehaving event cannot loop forever.
        if prior_status == ProcessingStatus::Failed && attempts >= FAILED_ATTEMPT_LIMIT {
            sqlx::query(
                r#"
                UPDATE billing_event_records
                SET status = 'dead', last_updated_at = NOW()
                WHERE external_event_id = $1 AND status = 'failed'
                "#,
            )
            .bind(external_id)
            .execute(&self.pool)
            .await?;

            tracing::error!(
                external_id = %external_id,
                attempts = attempts,
                "Event exceeded failed-retry limit, marked dead"
            );
            prior_status = ProcessingStatus::Dead;
        }

        tracing::info!(
            external_id = %external_id,
            event_type = %event_type,
            prior_status = %prior_status,
            "Duplicate delivery refused by idempotency ledger"
        );

        Ok(Admission {
            admitted: false,
            prior_status: Some(prior_status),
        })
    }

    /// Record the terminal outcome of a processing attempt.
    ///
    /// Idempotent: only a record still in `processing` is updated, so
    /// repeated finalization with the same status is a no-op. Retried once
    /// on database error because the ledger row is what makes redelivery
    /// safe.
    pub async fn finalize(
        &self,
        external_id: &str,
        status: ProcessingStatus,
        error_detail: Option<&str>,
        account_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let first = self
            .finalize_once(external_id, status, error_detail, account_id)
            .await;

        if let Err(e) = first {
            tracing::warn!(
                external_id = %external_id,
                error = %e,
                "Ledger finalize failed, retrying once"
            );

            if let Err(retry_err) = self
                .finalize_once(external_id, status, error_detail, account_id)
                .await
            {
                tracing::error!(
                    external_id = %external_id,
                    status = %status,
                    error_detail = ?error_detail,
                    retry_error = %retry_err,
                    "CRITICAL: failed to finalize ledger record after retry. \
                     Event may appear stuck in 'processing' state. \
                     Manual reconciliation may be required."
                );
                return Err(retry_err);
            }
        }

        Ok(())
    }

    async fn finalize_once(
        &self,
        external_id: &str,
        status: ProcessingStatus,
        error_detail: Option<&str>,
        account_id: Option<Uuid>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_event_records
            SET status = $2,
                error_detail = $3,
                account_id = COALESCE($4, account_id),
                last_updated_at = NOW()
            WHERE external_event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(external_id)
        .bind(status.as_str())
        .bind(error_detail)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
