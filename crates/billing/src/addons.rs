//! Add-on entitlement management
//!
//! Add-ons live on an independent lifecycle from the base plan. An add-on
//! event never touches `accounts.tier` or `accounts.status`; the partition
//! is enforced here by construction — this service only writes
//! `addon_entitlements` rows.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::ProviderStatus;

/// Lifecycle status of an add-on entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonStatus {
    Active,
    Canceled,
    Expired,
}

impl AddonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AddonStatus::Active => "active",
            AddonStatus::Canceled => "canceled",
            AddonStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<AddonStatus> {
        match s {
            "active" => Some(AddonStatus::Active),
            "canceled" => Some(AddonStatus::Canceled),
            "expired" => Some(AddonStatus::Expired),
            _ => None,
        }
    }
}

/// One add-on entitlement row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AddonEntitlement {
    pub id: Uuid,
    pub account_id: Uuid,
    pub addon_name: String,
    pub addon_category: String,
    pub status: String,
    pub billing_subscription_ref: Option<String>,
    pub activated_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

/// What an upsert will do, decided from the existing row's status.
///
/// This three-way branch is the idempotency guarantee for add-on
/// purchases: replayed checkouts for the same (account, addon) converge to
/// a single active row instead of duplicating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    /// Active row exists: refresh the subscription reference only
    /// (provider re-issued a subscription for the same product)
    RefreshReference,
    /// Canceled/expired row exists: reactivate in place, preserving the
    /// row's historical identity
    Reactivate,
    /// No row: insert a fresh active entitlement
    Insert,
}

pub fn upsert_action(existing: Option<AddonStatus>) -> UpsertAction {
    match existing {
        Some(AddonStatus::Active) => UpsertAction::RefreshReference,
        Some(AddonStatus::Canceled) | Some(AddonStatus::Expired) => UpsertAction::Reactivate,
        None => UpsertAction::Insert,
    }
}

/// Manages the add-on entitlement lifecycle
pub struct AddonService {
    pool: PgPool,
}

impl AddonService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or converge the entitlement for (account, addon).
    pub async fn upsert(
        &self,
        account_id: Uuid,
        addon_name: &str,
        addon_category: &str,
        subscription_ref: Option<&str>,
    ) -> BillingResult<AddonEntitlement> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM addon_entitlements WHERE account_id = $1 AND addon_name = $2",
        )
        .bind(account_id)
        .bind(addon_name)
        .fetch_optional(&self.pool)
        .await?;

        let action = upsert_action(existing.and_then(|(s,)| AddonStatus::parse(&s)));

        let entitlement: AddonEntitlement = match action {
            UpsertAction::RefreshReference => {
                sqlx::query_as(
                    r#"
                    UPDATE addon_entitlements
                    SET billing_subscription_ref = COALESCE($3, billing_subscription_ref),
                        updated_at = NOW()
                    WHERE account_id = $1 AND addon_name = $2
                    RETURNING id, account_id, addon_name, addon_category, status,
                              billing_subscription_ref, activated_at, expires_at
                    "#,
                )
                .bind(account_id)
                .bind(addon_name)
                .bind(subscription_ref)
                .fetch_one(&self.pool)
                .await?
            }
            UpsertAction::Reactivate => {
                sqlx::query_as(
                    r#"
                    UPDATE addon_entitlements
                    SET status = 'active',
                        billing_subscription_ref = COALESCE($3, billing_subscription_ref),
                        activated_at = NOW(),
                        expires_at = NULL,
                        updated_at = NOW()
                    WHERE account_id = $1 AND addon_name = $2
                    RETURNING id, account_id, addon_name, addon_category, status,
                              billing_subscription_ref, activated_at, expires_at
                    "#,
                )
                .bind(account_id)
                .bind(addon_name)
                .bind(subscription_ref)
                .fetch_one(&self.pool)
                .await?
            }
            UpsertAction::Insert => {
                sqlx::query_as(
                    r#"
                    INSERT INTO addon_entitlements (
                        id, account_id, addon_name, addon_category, status,
                        billing_subscription_ref, activated_at, updated_at
                    ) VALUES ($1, $2, $3, $4, 'active', $5, NOW(), NOW())
                    RETURNING id, account_id, addon_name, addon_category, status,
                              billing_subscription_ref, activated_at, expires_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(account_id)
                .bind(addon_name)
                .bind(addon_category)
                .bind(subscription_ref)
                .fetch_one(&self.pool)
                .await?
            }
        };

        tracing::info!(
            account_id = %account_id,
            addon_name = %addon_name,
            action = ?action,
            "Add-on entitlement upserted"
        );

        Ok(entitlement)
    }

    /// Cancel whatever entitlement the given provider subscription backs.
    /// Used on `subscription_deleted` for add-on subscriptions; the
    /// entitlement expires immediately.
    pub async fn cancel_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            UPDATE addon_entitlements
            SET status = 'canceled', expires_at = NOW(), updated_at = NOW()
            WHERE billing_subscription_ref = $1 AND status = 'active'
            RETURNING account_id, addon_name
            "#,
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((account_id, addon_name)) = &row {
            tracing::info!(
                account_id = %account_id,
                addon_name = %addon_name,
                subscription_ref = %subscription_ref,
                "Add-on entitlement canceled"
            );
        }

        Ok(row.map(|(account_id, _)| account_id))
    }

    /// Reflect a provider-side status change into the entitlement.
    /// Only cancellation-like states mutate the row; anything else is a
    /// reference refresh at most.
    pub async fn reflect_provider_status(
        &self,
        subscription_ref: &str,
        status: ProviderStatus,
    ) -> BillingResult<Option<Uuid>> {
        match status {
            ProviderStatus::Canceled | ProviderStatus::Unpaid => {
                self.cancel_by_subscription(subscription_ref).await
            }
            _ => {
                let row: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT account_id FROM addon_entitlements WHERE billing_subscription_ref = $1",
                )
                .bind(subscription_ref)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|(id,)| id))
            }
        }
    }

    /// Find the account behind an add-on-backing provider subscription
    pub async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<(Uuid, String)>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT account_id, addon_name
            FROM addon_entitlements
            WHERE billing_subscription_ref = $1
            "#,
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_action_three_way_branch() {
        assert_eq!(
            upsert_action(Some(AddonStatus::Active)),
            UpsertAction::RefreshReference
        );
        assert_eq!(
            upsert_action(Some(AddonStatus::Canceled)),
            UpsertAction::Reactivate
        );
        assert_eq!(
            upsert_action(Some(AddonStatus::Expired)),
            UpsertAction::Reactivate
        );
        assert_eq!(upsert_action(None), UpsertAction::Insert);
    }

    #[test]
    fn addon_status_round_trips() {
        for status in [AddonStatus::Active, AddonStatus::Canceled, AddonStatus::Expired] {
            assert_eq!(AddonStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AddonStatus::parse("paused"), None);
    }
}
