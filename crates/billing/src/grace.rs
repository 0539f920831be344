//! Grace-period handling
//!
//! A downgrade or cancellation never strips entitlements synchronously:
//! the customer paid through `current_period_end`, and losing already-built
//! dashboards mid-period is a worse failure than temporarily over-granting.
//! This handler only records the frozen state and its deadline; the actual
//! demotion is performed by an external periodic reconciliation sweep that
//! reads `entitlement_freezes`.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::pricing::Tier;

/// What the account will become once the freeze elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    /// Downgrade to a lower paid tier
    Downgrade(Tier),
    /// Full cancellation (tier drops to none)
    Cancel,
}

impl PendingChange {
    pub fn pending_tier(self) -> Tier {
        match self {
            PendingChange::Downgrade(tier) => tier,
            PendingChange::Cancel => Tier::None,
        }
    }
}

/// Row from the freeze table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntitlementFreeze {
    pub account_id: Uuid,
    pub frozen_tier: String,
    pub pending_tier: Option<String>,
    pub frozen_until: OffsetDateTime,
}

/// Writes and resolves entitlement freezes
pub struct GracePeriodService {
    pool: PgPool,
}

impl GracePeriodService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record that entitlements stay at `old_tier` until `period_end`.
    ///
    /// One freeze per account: a second downgrade before the first deadline
    /// elapses replaces the pending target but keeps the original frozen
    /// tier, since that is what the customer is still paying for.
    pub async fn freeze(
        &self,
        account_id: Uuid,
        old_tier: Tier,
        change: PendingChange,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlement_freezes (account_id, frozen_tier, pending_tier, frozen_until, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (account_id) DO UPDATE SET
                pending_tier = EXCLUDED.pending_tier,
                frozen_until = EXCLUDED.frozen_until
            "#,
        )
        .bind(account_id)
        .bind(old_tier.as_str())
        .bind(change.pending_tier().as_str())
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            frozen_tier = %old_tier,
            pending_tier = %change.pending_tier(),
            frozen_until = %period_end,
            "Entitlements frozen until period end"
        );

        Ok(())
    }

    /// The tier an account currently grants: an unexpired freeze wins over
    /// the committed `accounts.tier`.
    pub async fn effective_tier(&self, account_id: Uuid) -> BillingResult<Option<Tier>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT COALESCE(f.frozen_tier, a.tier)
            FROM accounts a
            LEFT JOIN entitlement_freezes f
                   ON f.account_id = a.id AND f.frozen_until > NOW()
            WHERE a.id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(tier,)| Tier::parse(&tier)))
    }

    /// Current freeze record for an account, if any is still active
    pub async fn active_freeze(&self, account_id: Uuid) -> BillingResult<Option<EntitlementFreeze>> {
        let freeze: Option<EntitlementFreeze> = sqlx::query_as(
            r#"
            SELECT account_id, frozen_tier, pending_tier, frozen_until
            FROM entitlement_freezes
            WHERE account_id = $1 AND frozen_until > NOW()
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(freeze)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_pends_to_none() {
        assert_eq!(PendingChange::Cancel.pending_tier(), Tier::None);
    }

    #[test]
    fn downgrade_pends_to_target_tier() {
        assert_eq!(
            PendingChange::Downgrade(Tier::Starter).pending_tier(),
            Tier::Starter
        );
    }
}
