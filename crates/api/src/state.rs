//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use chartflow_billing::dispatch::EventDispatcher;
use chartflow_billing::entitlements::HttpEntitlementSync;
use chartflow_billing::verifier::EventVerifier;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub dispatcher: Arc<EventDispatcher<HttpEntitlementSync>>,
    pub verifier: Arc<dyn EventVerifier>,
}
