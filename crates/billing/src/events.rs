//! Typed billing events
//!
//! The provider delivers webhook notifications as a JSON envelope:
//!
//! ```json
//! {
//!   "id": "evt_1a2b3c",
//!   "type": "subscription_updated",
//!   "created": 1724700000,
//!   "data": { ... }
//! }
//! ```
//!
//! Events are modeled as a closed tagged union keyed by `type`. An envelope
//! whose `type` is unknown, or whose `data` does not parse into the shape
//! that type requires, is rejected at the boundary and never reaches the
//! ledger.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Event types this processor handles. Closed set: anything else is
/// rejected by the verifier boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CheckoutCompleted => "checkout_completed",
            EventType::SubscriptionCreated => "subscription_created",
            EventType::SubscriptionUpdated => "subscription_updated",
            EventType::SubscriptionDeleted => "subscription_deleted",
            EventType::InvoicePaid => "invoice_paid",
            EventType::InvoicePaymentFailed => "invoice_payment_failed",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "checkout_completed" => Some(EventType::CheckoutCompleted),
            "subscription_created" => Some(EventType::SubscriptionCreated),
            "subscription_updated" => Some(EventType::SubscriptionUpdated),
            "subscription_deleted" => Some(EventType::SubscriptionDeleted),
            "invoice_paid" => Some(EventType::InvoicePaid),
            "invoice_payment_failed" => Some(EventType::InvoicePaymentFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
}

/// Payload for `checkout_completed`
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutData {
    /// Internal account id carried in checkout metadata, when present
    pub account_id: Option<Uuid>,
    pub customer_ref: String,
    pub subscription_ref: Option<String>,
    pub price_ref: String,
    pub status: Option<ProviderStatus>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
}

/// Payload for `subscription_created` / `subscription_updated` /
/// `subscription_deleted`
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionData {
    pub customer_ref: String,
    pub subscription_ref: String,
    pub price_ref: String,
    pub status: ProviderStatus,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
}

/// Payload for `invoice_paid` / `invoice_payment_failed`
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceData {
    pub customer_ref: String,
    pub subscription_ref: Option<String>,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    pub attempt_count: Option<i32>,
    pub amount_due_cents: Option<i64>,
}

/// Per-type payload shapes
#[derive(Debug, Clone)]
pub enum EventPayload {
    Checkout(CheckoutData),
    Subscription(SubscriptionData),
    Invoice(InvoiceData),
}

/// One externally-issued billing notification, verified and typed.
/// Identity is `external_id`; it is the idempotency key for the ledger.
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub external_id: String,
    pub event_type: EventType,
    pub received_at: OffsetDateTime,
    pub payload: EventPayload,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<i64>,
    data: serde_json::Value,
}

impl BillingEvent {
    /// Parse a raw webhook body into a typed event.
    ///
    /// The provider's `created` timestamp is preferred for `received_at` so
    /// ordering follows the provider's clock rather than ours.
    pub fn from_slice(body: &[u8]) -> BillingResult<BillingEvent> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| BillingError::MalformedPayload(format!("invalid envelope: {e}")))?;

        if envelope.id.is_empty() {
            return Err(BillingError::MalformedPayload(
                "envelope is missing an event id".to_string(),
            ));
        }

        let event_type = EventType::parse(&envelope.event_type)
            .ok_or_else(|| BillingError::UnsupportedEventType(envelope.event_type.clone()))?;

        let payload = match event_type {
            EventType::CheckoutCompleted => {
                EventPayload::Checkout(parse_data(event_type, envelope.data)?)
            }
            EventType::SubscriptionCreated
            | EventType::SubscriptionUpdated
            | EventType::SubscriptionDeleted => {
                EventPayload::Subscription(parse_data(event_type, envelope.data)?)
            }
            EventType::InvoicePaid | EventType::InvoicePaymentFailed => {
                EventPayload::Invoice(parse_data(event_type, envelope.data)?)
            }
        };

        let received_at = envelope
            .created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(BillingEvent {
            external_id: envelope.id,
            event_type,
            received_at,
            payload,
        })
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(
    event_type: EventType,
    data: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(data)
        .map_err(|e| BillingError::MalformedPayload(format!("{event_type} data: {e}")))
}

/// Convert a provider unix timestamp to an absolute instant.
///
/// Period boundaries are taken verbatim from the payload rather than
/// recomputed locally, so clock skew between us and the provider never
/// drifts entitlement windows.
pub fn provider_timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| BillingError::MalformedPayload(format!("timestamp out of range: {ts}")))
}
