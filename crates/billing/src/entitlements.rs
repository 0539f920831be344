//! Entitlement propagation
//!
//! The feature-limits service is an external collaborator: after a base-plan
//! transition commits, the new tier and status are pushed to it so request
//! quotas and feature gates line up with billing state. Propagation is
//! best-effort from the dispatcher's point of view; the database remains the
//! source of truth and a failed push never rolls back a transition.

use std::future::Future;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::pricing::Tier;
use crate::subscriptions::AccountStatus;

/// Contract for pushing committed entitlement state to the limits service.
pub trait EntitlementSync: Send + Sync {
    fn sync(
        &self,
        account_id: Uuid,
        tier: Tier,
        status: AccountStatus,
    ) -> impl Future<Output = BillingResult<()>> + Send;
}

/// HTTP implementation of [`EntitlementSync`].
///
/// Posts the committed state as JSON to the configured endpoint. With no
/// endpoint configured the sync is a no-op, which is how local development
/// and tests run.
pub struct HttpEntitlementSync {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpEntitlementSync {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("ENTITLEMENT_SYNC_URL").ok())
    }
}

impl EntitlementSync for HttpEntitlementSync {
    async fn sync(
        &self,
        account_id: Uuid,
        tier: Tier,
        status: AccountStatus,
    ) -> BillingResult<()> {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!(
                account_id = %account_id,
                "No entitlement sync endpoint configured, skipping push"
            );
            return Ok(());
        };

        self.client
            .post(endpoint)
            .json(&serde_json::json!({
                "account_id": account_id,
                "tier": tier.as_str(),
                "status": status.as_str(),
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| BillingError::EntitlementSync(e.to_string()))?;

        tracing::debug!(
            account_id = %account_id,
            tier = %tier,
            "Entitlement state pushed to limits service"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_endpoint_is_a_noop() {
        let sync = HttpEntitlementSync::new(None);
        sync.sync(Uuid::new_v4(), Tier::Professional, AccountStatus::Active)
            .await
            .unwrap();
    }
}
