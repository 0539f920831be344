//! Billing webhook endpoint
//!
//! Response codes are the retry protocol with the provider: 2xx
//! acknowledges and stops redelivery, non-2xx asks for another attempt.
//! Skips and already-processed duplicates are therefore acknowledged, and
//! only handler failures and our own storage problems ask for a retry.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use chartflow_billing::dispatch::Outcome;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "Billing-Signature";

pub async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing Billing-Signature header" })),
        )
            .into_response();
    };

    let event = match state.verifier.verify(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Webhook rejected at verification boundary");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    match state.dispatcher.dispatch(&event).await {
        Ok(outcome) => outcome_response(outcome).into_response(),
        Err(e) => {
            // No durable ledger claim exists; fail closed and let the
            // provider redeliver.
            tracing::error!(
                external_id = %event.external_id,
                error = %e,
                "Webhook dispatch failed before an outcome was recorded"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "event processing unavailable" })),
            )
                .into_response()
        }
    }
}

/// Map a dispatch outcome onto the provider's retry protocol.
fn outcome_response(outcome: Outcome) -> (StatusCode, Json<Value>) {
    match outcome {
        Outcome::Processed { .. } => (StatusCode::OK, Json(json!({ "received": true }))),
        Outcome::AlreadyProcessed { prior_status } => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "duplicate": true,
                "prior_status": prior_status.as_str(),
            })),
        ),
        Outcome::Skipped { reason } => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "skipped": true,
                "reason": reason,
            })),
        ),
        Outcome::Failed { reason } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "received": false,
                "error": reason,
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartflow_billing::ledger::ProcessingStatus;

    #[test]
    fn processed_acknowledges() {
        let (status, _) = outcome_response(Outcome::Processed { account_id: None });
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn duplicates_acknowledge_without_reprocessing() {
        let (status, Json(body)) = outcome_response(Outcome::AlreadyProcessed {
            prior_status: ProcessingStatus::Success,
        });
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duplicate"], true);
        assert_eq!(body["prior_status"], "success");
    }

    #[test]
    fn skips_acknowledge_with_a_reason() {
        let (status, Json(body)) = outcome_response(Outcome::Skipped {
            reason: "unrecognized price reference: price_x".to_string(),
        });
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped"], true);
    }

    #[test]
    fn failures_request_redelivery() {
        let (status, Json(body)) = outcome_response(Outcome::Failed {
            reason: "Account not found: cus_9".to_string(),
        });
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["received"], false);
    }
}
