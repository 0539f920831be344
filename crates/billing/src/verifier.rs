//! Event verification boundary
//!
//! The processor treats authentication of inbound webhooks as an external
//! collaborator: raw bytes and a signature header go in, a typed
//! [`BillingEvent`] or a rejection comes out. Nothing past this boundary
//! ever sees an unverified payload.

use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;

/// Contract for webhook authentication.
///
/// Implementations must reject before parsing on any authenticity failure;
/// a returned event is trusted by the dispatcher.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, body: &[u8], signature: &str) -> BillingResult<BillingEvent>;
}

/// Shared-secret verifier.
///
/// Compares the signature header against a configured secret in constant
/// time, then parses the body into the closed event union. Provider-grade
/// signature schemes (HMAC over timestamped payloads etc.) plug in behind
/// the same trait without touching the dispatcher.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl EventVerifier for SharedSecretVerifier {
    fn verify(&self, body: &[u8], signature: &str) -> BillingResult<BillingEvent> {
        let matches: bool = signature.as_bytes().ct_eq(self.secret.as_bytes()).into();

        if !matches {
            tracing::warn!(
                signature_len = signature.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::SignatureInvalid);
        }

        BillingEvent::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_body() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "invoice_paid",
            "data": { "customer_ref": "cus_1" }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn accepts_matching_secret() {
        let verifier = SharedSecretVerifier::new("whk_secret");
        let event = verifier.verify(&event_body(), "whk_secret").unwrap();
        assert_eq!(event.external_id, "evt_1");
    }

    #[test]
    fn rejects_wrong_secret_before_parsing() {
        let verifier = SharedSecretVerifier::new("whk_secret");
        // Body is garbage; the signature failure must win.
        let err = verifier.verify(b"garbage", "nope").unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn rejects_malformed_body_after_valid_secret() {
        let verifier = SharedSecretVerifier::new("whk_secret");
        let err = verifier.verify(b"garbage", "whk_secret").unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }
}
