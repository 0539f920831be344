//! Subscription audit history
//!
//! Append-only record of every transition attempt, written whether or not
//! the primary account mutation succeeded. History answers "why is this
//! account on this tier?" without replaying provider events. Writes are
//! best-effort observability: callers log failures and never let them roll
//! back or mask a primary state transition.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::EventType;
use crate::pricing::Tier;
use crate::subscriptions::AccountStatus;

/// Classification label attached to a transition for audit purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Upgrade,
    Downgrade,
    Cancel,
    Renew,
    Recover,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Upgrade => "upgrade",
            LifecycleEvent::Downgrade => "downgrade",
            LifecycleEvent::Cancel => "cancel",
            LifecycleEvent::Renew => "renew",
            LifecycleEvent::Recover => "recover",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builder for one history row
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    external_event_id: String,
    event_type: EventType,
    account_id: Option<Uuid>,
    lifecycle_event: Option<LifecycleEvent>,
    previous_tier: Option<Tier>,
    new_tier: Option<Tier>,
    previous_status: Option<AccountStatus>,
    new_status: Option<AccountStatus>,
}

impl HistoryRecord {
    pub fn new(external_event_id: &str, event_type: EventType) -> Self {
        Self {
            external_event_id: external_event_id.to_string(),
            event_type,
            account_id: None,
            lifecycle_event: None,
            previous_tier: None,
            new_tier: None,
            previous_status: None,
            new_status: None,
        }
    }

    pub fn account(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn lifecycle(mut self, lifecycle_event: LifecycleEvent) -> Self {
        self.lifecycle_event = Some(lifecycle_event);
        self
    }

    pub fn tiers(mut self, previous: Tier, new: Tier) -> Self {
        self.previous_tier = Some(previous);
        self.new_tier = Some(new);
        self
    }

    pub fn statuses(mut self, previous: AccountStatus, new: AccountStatus) -> Self {
        self.previous_status = Some(previous);
        self.new_status = Some(new);
        self
    }
}

/// Append-only writer for the subscription history table
pub struct HistoryService {
    pool: PgPool,
}

impl HistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one history row. Never updates or deletes.
    pub async fn record(&self, record: HistoryRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history (
                id, account_id, external_event_id, event_type, lifecycle_event,
                previous_tier, new_tier, previous_status, new_status, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.account_id)
        .bind(&record.external_event_id)
        .bind(record.event_type.as_str())
        .bind(record.lifecycle_event.map(LifecycleEvent::as_str))
        .bind(record.previous_tier.map(Tier::as_str))
        .bind(record.new_tier.map(Tier::as_str))
        .bind(record.previous_status.map(AccountStatus::as_str))
        .bind(record.new_status.map(AccountStatus::as_str))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            external_event_id = %record.external_event_id,
            account_id = ?record.account_id,
            lifecycle_event = ?record.lifecycle_event,
            "Appended subscription history entry"
        );

        Ok(())
    }
}
