//! Base-plan subscription state machine
//!
//! Owns every mutation of `accounts.tier` and `accounts.status` driven by
//! billing events. Transitions commit to the database first; audit history
//! is appended best-effort afterwards so an observability failure can never
//! roll back a paid-for entitlement change.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    provider_timestamp, CheckoutData, EventType, InvoiceData, ProviderStatus, SubscriptionData,
};
use crate::grace::{GracePeriodService, PendingChange};
use crate::history::{HistoryRecord, HistoryService, LifecycleEvent};
use crate::pricing::{compare_tier, Tier, TierChange};

/// Account standing as committed in our own database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Inactive,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Inactive => "inactive",
            AccountStatus::Trialing => "trialing",
            AccountStatus::Active => "active",
            AccountStatus::PastDue => "past_due",
            AccountStatus::Canceled => "canceled",
            AccountStatus::Unpaid => "unpaid",
        }
    }

    pub fn parse(s: &str) -> Option<AccountStatus> {
        match s {
            "inactive" => Some(AccountStatus::Inactive),
            "trialing" => Some(AccountStatus::Trialing),
            "active" => Some(AccountStatus::Active),
            "past_due" => Some(AccountStatus::PastDue),
            "canceled" => Some(AccountStatus::Canceled),
            "unpaid" => Some(AccountStatus::Unpaid),
            _ => None,
        }
    }

    /// Map the provider's subscription status onto our account standing.
    /// `incomplete` means the initial payment never went through, so the
    /// account stays inactive rather than getting a tier it never paid for.
    pub fn from_provider(status: ProviderStatus) -> AccountStatus {
        match status {
            ProviderStatus::Trialing => AccountStatus::Trialing,
            ProviderStatus::Active => AccountStatus::Active,
            ProviderStatus::PastDue => AccountStatus::PastDue,
            ProviderStatus::Canceled => AccountStatus::Canceled,
            ProviderStatus::Unpaid => AccountStatus::Unpaid,
            ProviderStatus::Incomplete => AccountStatus::Inactive,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An account as seen by the billing pipeline
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub tier: Tier,
    pub status: AccountStatus,
    pub billing_customer_ref: Option<String>,
    pub billing_subscription_ref: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    tier: String,
    status: String,
    billing_customer_ref: Option<String>,
    billing_subscription_ref: Option<String>,
    current_period_end: Option<OffsetDateTime>,
}

impl TryFrom<AccountRow> for Account {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let tier = Tier::parse(&row.tier)
            .ok_or_else(|| BillingError::Internal(format!("unknown tier '{}'", row.tier)))?;
        let status = AccountStatus::parse(&row.status)
            .ok_or_else(|| BillingError::Internal(format!("unknown status '{}'", row.status)))?;

        Ok(Account {
            id: row.id,
            tier,
            status,
            billing_customer_ref: row.billing_customer_ref,
            billing_subscription_ref: row.billing_subscription_ref,
            current_period_end: row.current_period_end,
        })
    }
}

/// The committed result of a base-plan transition, handed to the
/// entitlement sync.
#[derive(Debug, Clone, Copy)]
pub struct BaseTransition {
    pub account_id: Uuid,
    pub tier: Tier,
    pub status: AccountStatus,
}

/// Lifecycle label for a `subscription_updated` tier change. Same-tier
/// updates (status/period refreshes) carry no lifecycle label.
pub fn lifecycle_for_update(change: TierChange) -> Option<LifecycleEvent> {
    match change {
        TierChange::Upgrade => Some(LifecycleEvent::Upgrade),
        TierChange::Downgrade => Some(LifecycleEvent::Downgrade),
        TierChange::Same => None,
    }
}

/// Lifecycle label for a paid invoice, decided by the account's prior
/// standing: payment after delinquency is a recovery, payment while in
/// good standing is a renewal, and payment against a canceled account is
/// recorded without a label.
pub fn lifecycle_for_invoice_paid(prior: AccountStatus) -> Option<LifecycleEvent> {
    match prior {
        AccountStatus::PastDue | AccountStatus::Unpaid | AccountStatus::Inactive => {
            Some(LifecycleEvent::Recover)
        }
        AccountStatus::Active | AccountStatus::Trialing => Some(LifecycleEvent::Renew),
        AccountStatus::Canceled => None,
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, tier, status, billing_customer_ref, billing_subscription_ref, current_period_end";

/// State machine over the `accounts` table
pub struct SubscriptionService {
    pool: PgPool,
    history: HistoryService,
    grace: GracePeriodService,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            history: HistoryService::new(pool.clone()),
            grace: GracePeriodService::new(pool.clone()),
            pool,
        }
    }

    pub async fn find_by_id(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    pub async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE billing_customer_ref = $1"
        ))
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    pub async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE billing_subscription_ref = $1"
        ))
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    /// Resolve the account a checkout belongs to. The account id carried in
    /// checkout metadata is authoritative; the customer reference is the
    /// fallback for sessions created without metadata.
    pub async fn locate_for_checkout(&self, data: &CheckoutData) -> BillingResult<Account> {
        if let Some(account_id) = data.account_id {
            if let Some(account) = self.find_by_id(account_id).await? {
                return Ok(account);
            }
            tracing::warn!(
                account_id = %account_id,
                customer_ref = %data.customer_ref,
                "Checkout metadata names an unknown account, falling back to customer ref"
            );
        }

        self.find_by_customer_ref(&data.customer_ref)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(data.customer_ref.clone()))
    }

    /// Activate a base plan from a completed checkout.
    pub async fn activate_from_checkout(
        &self,
        data: &CheckoutData,
        tier: Tier,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        let account = self.locate_for_checkout(data).await?;
        let new_status = data
            .status
            .map(AccountStatus::from_provider)
            .unwrap_or(AccountStatus::Active);

        let period_start = data.current_period_start.map(provider_timestamp).transpose()?;
        let period_end = data.current_period_end.map(provider_timestamp).transpose()?;
        let trial_start = data.trial_start.map(provider_timestamp).transpose()?;
        let trial_end = data.trial_end.map(provider_timestamp).transpose()?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET tier = $2,
                status = $3,
                billing_customer_ref = $4,
                billing_subscription_ref = COALESCE($5, billing_subscription_ref),
                current_period_start = COALESCE($6, current_period_start),
                current_period_end = COALESCE($7, current_period_end),
                trial_start = COALESCE($8, trial_start),
                trial_end = COALESCE($9, trial_end),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(tier.as_str())
        .bind(new_status.as_str())
        .bind(&data.customer_ref)
        .bind(data.subscription_ref.as_deref())
        .bind(period_start)
        .bind(period_end)
        .bind(trial_start)
        .bind(trial_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account.id,
            tier = %tier,
            status = %new_status,
            "Base plan activated from checkout"
        );

        self.record_history(
            HistoryRecord::new(external_id, EventType::CheckoutCompleted)
                .account(account.id)
                .tiers(account.tier, tier)
                .statuses(account.status, new_status),
        )
        .await;

        Ok(BaseTransition {
            account_id: account.id,
            tier,
            status: new_status,
        })
    }

    /// Apply `subscription_created` for a base-plan price.
    pub async fn activate_from_subscription(
        &self,
        data: &SubscriptionData,
        tier: Tier,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        let account = self.locate_for_subscription(data).await?;
        let new_status = AccountStatus::from_provider(data.status);

        self.write_base_state(account.id, tier, new_status, data).await?;

        tracing::info!(
            account_id = %account.id,
            tier = %tier,
            status = %new_status,
            "Base plan activated from subscription"
        );

        self.record_history(
            HistoryRecord::new(external_id, EventType::SubscriptionCreated)
                .account(account.id)
                .tiers(account.tier, tier)
                .statuses(account.status, new_status),
        )
        .await;

        Ok(BaseTransition {
            account_id: account.id,
            tier,
            status: new_status,
        })
    }

    /// Apply `subscription_updated` for a base-plan price.
    ///
    /// Upgrades take effect immediately. Downgrades commit the new tier but
    /// freeze effective entitlements at the old tier until the already-paid
    /// period ends. The freeze is written before the account row so a crash
    /// between the two never strips a paid-for entitlement early.
    pub async fn apply_update(
        &self,
        data: &SubscriptionData,
        new_tier: Tier,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        let account = self.locate_for_subscription(data).await?;
        let new_status = AccountStatus::from_provider(data.status);
        let change = compare_tier(account.tier, new_tier);

        if change == TierChange::Downgrade {
            let period_end = provider_timestamp(data.current_period_end)?;
            self.grace
                .freeze(
                    account.id,
                    account.tier,
                    PendingChange::Downgrade(new_tier),
                    period_end,
                )
                .await?;
        }

        self.write_base_state(account.id, new_tier, new_status, data).await?;

        tracing::info!(
            account_id = %account.id,
            previous_tier = %account.tier,
            new_tier = %new_tier,
            change = ?change,
            "Subscription update applied"
        );

        let mut record = HistoryRecord::new(external_id, EventType::SubscriptionUpdated)
            .account(account.id)
            .tiers(account.tier, new_tier)
            .statuses(account.status, new_status);
        if let Some(lifecycle) = lifecycle_for_update(change) {
            record = record.lifecycle(lifecycle);
        }
        self.record_history(record).await;

        Ok(BaseTransition {
            account_id: account.id,
            tier: new_tier,
            status: new_status,
        })
    }

    /// Apply `subscription_deleted` for a base-plan subscription.
    ///
    /// The account's tier stays where it is; only the status flips to
    /// canceled, and a freeze keeps entitlements alive until the period the
    /// customer already paid for runs out.
    pub async fn cancel(
        &self,
        data: &SubscriptionData,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        let account = self.locate_for_subscription(data).await?;
        let period_end = provider_timestamp(data.current_period_end)?;

        self.grace
            .freeze(account.id, account.tier, PendingChange::Cancel, period_end)
            .await?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'canceled',
                current_period_end = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account.id,
            tier = %account.tier,
            frozen_until = %period_end,
            "Subscription canceled, entitlements frozen until period end"
        );

        self.record_history(
            HistoryRecord::new(external_id, EventType::SubscriptionDeleted)
                .account(account.id)
                .lifecycle(LifecycleEvent::Cancel)
                .tiers(account.tier, account.tier)
                .statuses(account.status, AccountStatus::Canceled),
        )
        .await;

        Ok(BaseTransition {
            account_id: account.id,
            tier: account.tier,
            status: AccountStatus::Canceled,
        })
    }

    /// Apply `invoice_payment_failed`: the account goes delinquent but
    /// keeps its tier. Dunning and final cancellation arrive as their own
    /// provider events.
    pub async fn mark_past_due(
        &self,
        account: &Account,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        sqlx::query(
            "UPDATE accounts SET status = 'past_due', updated_at = NOW() WHERE id = $1",
        )
        .bind(account.id)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            account_id = %account.id,
            previous_status = %account.status,
            "Invoice payment failed, account marked past due"
        );

        self.record_history(
            HistoryRecord::new(external_id, EventType::InvoicePaymentFailed)
                .account(account.id)
                .statuses(account.status, AccountStatus::PastDue),
        )
        .await;

        Ok(BaseTransition {
            account_id: account.id,
            tier: account.tier,
            status: AccountStatus::PastDue,
        })
    }

    /// Apply `invoice_paid`: refresh the paid-through window and, when the
    /// account was delinquent, restore it to active.
    pub async fn apply_invoice_paid(
        &self,
        account: &Account,
        data: &InvoiceData,
        external_id: &str,
    ) -> BillingResult<BaseTransition> {
        let lifecycle = lifecycle_for_invoice_paid(account.status);
        let new_status = match lifecycle {
            Some(LifecycleEvent::Recover) => AccountStatus::Active,
            _ => account.status,
        };

        let period_start = data.period_start.map(provider_timestamp).transpose()?;
        let period_end = data.period_end.map(provider_timestamp).transpose()?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET status = $2,
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(new_status.as_str())
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account.id,
            lifecycle = ?lifecycle,
            "Invoice payment applied"
        );

        if let Some(lifecycle) = lifecycle {
            self.record_history(
                HistoryRecord::new(external_id, EventType::InvoicePaid)
                    .account(account.id)
                    .lifecycle(lifecycle)
                    .statuses(account.status, new_status),
            )
            .await;
        }

        Ok(BaseTransition {
            account_id: account.id,
            tier: account.tier,
            status: new_status,
        })
    }

    /// Resolve the account behind a subscription event: the subscription
    /// reference is primary, the customer reference is the fallback for the
    /// first event about a subscription we have not stored yet.
    async fn locate_for_subscription(&self, data: &SubscriptionData) -> BillingResult<Account> {
        if let Some(account) = self.find_by_subscription_ref(&data.subscription_ref).await? {
            return Ok(account);
        }

        self.find_by_customer_ref(&data.customer_ref)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(data.customer_ref.clone()))
    }

    async fn write_base_state(
        &self,
        account_id: Uuid,
        tier: Tier,
        status: AccountStatus,
        data: &SubscriptionData,
    ) -> BillingResult<()> {
        let period_start = provider_timestamp(data.current_period_start)?;
        let period_end = provider_timestamp(data.current_period_end)?;
        let trial_start = data.trial_start.map(provider_timestamp).transpose()?;
        let trial_end = data.trial_end.map(provider_timestamp).transpose()?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET tier = $2,
                status = $3,
                billing_subscription_ref = $4,
                current_period_start = $5,
                current_period_end = $6,
                trial_start = $7,
                trial_end = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(tier.as_str())
        .bind(status.as_str())
        .bind(&data.subscription_ref)
        .bind(period_start)
        .bind(period_end)
        .bind(trial_start)
        .bind(trial_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// History is observability, not state: a failed append is logged and
    /// swallowed so it cannot mask the transition that already committed.
    async fn record_history(&self, record: HistoryRecord) {
        if let Err(e) = self.history.record(record).await {
            tracing::warn!(error = %e, "Failed to append subscription history entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_lifecycle_matches_rank_comparison() {
        assert_eq!(
            lifecycle_for_update(TierChange::Upgrade),
            Some(LifecycleEvent::Upgrade)
        );
        assert_eq!(
            lifecycle_for_update(TierChange::Downgrade),
            Some(LifecycleEvent::Downgrade)
        );
        assert_eq!(lifecycle_for_update(TierChange::Same), None);
    }

    #[test]
    fn invoice_paid_lifecycle_by_prior_status() {
        assert_eq!(
            lifecycle_for_invoice_paid(AccountStatus::PastDue),
            Some(LifecycleEvent::Recover)
        );
        assert_eq!(
            lifecycle_for_invoice_paid(AccountStatus::Unpaid),
            Some(LifecycleEvent::Recover)
        );
        assert_eq!(
            lifecycle_for_invoice_paid(AccountStatus::Active),
            Some(LifecycleEvent::Renew)
        );
        assert_eq!(
            lifecycle_for_invoice_paid(AccountStatus::Trialing),
            Some(LifecycleEvent::Renew)
        );
        assert_eq!(lifecycle_for_invoice_paid(AccountStatus::Canceled), None);
    }

    #[test]
    fn provider_status_maps_onto_account_status() {
        assert_eq!(
            AccountStatus::from_provider(ProviderStatus::Trialing),
            AccountStatus::Trialing
        );
        assert_eq!(
            AccountStatus::from_provider(ProviderStatus::PastDue),
            AccountStatus::PastDue
        );
        // Incomplete initial payment never grants a tier.
        assert_eq!(
            AccountStatus::from_provider(ProviderStatus::Incomplete),
            AccountStatus::Inactive
        );
    }

    #[test]
    fn account_status_round_trips() {
        for status in [
            AccountStatus::Inactive,
            AccountStatus::Trialing,
            AccountStatus::Active,
            AccountStatus::PastDue,
            AccountStatus::Canceled,
            AccountStatus::Unpaid,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AccountStatus::parse("suspended"), None);
    }

    #[test]
    fn account_row_rejects_unknown_tier() {
        let row = AccountRow {
            id: Uuid::new_v4(),
            tier: "platinum".to_string(),
            status: "active".to_string(),
            billing_customer_ref: None,
            billing_subscription_ref: None,
            current_period_end: None,
        };

        assert!(matches!(
            Account::try_from(row),
            Err(BillingError::Internal(_))
        ));
    }
}
