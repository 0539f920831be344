//! End-to-end pipeline tests against a real database.
//!
//! Each case runs on a fresh schema provisioned by sqlx's test harness,
//! with migrations applied from the workspace root. These cover the
//! behaviors that only hold with storage in the loop: idempotent
//! redelivery, the grace-period freeze, the add-on partition, and the
//! account-not-found fail-safe.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use chartflow_billing::addons::AddonService;
use chartflow_billing::dispatch::{EventDispatcher, Outcome};
use chartflow_billing::entitlements::HttpEntitlementSync;
use chartflow_billing::events::BillingEvent;
use chartflow_billing::grace::GracePeriodService;
use chartflow_billing::history::HistoryService;
use chartflow_billing::ledger::{ProcessingLedger, ProcessingStatus};
use chartflow_billing::pricing::{PriceBook, Tier};
use chartflow_billing::subscriptions::SubscriptionService;

fn dispatcher(pool: &PgPool) -> EventDispatcher<HttpEntitlementSync> {
    let mut book = PriceBook::new();
    book.add_base("price_starter", Tier::Starter)
        .add_base("price_pro", Tier::Professional)
        .add_addon("price_data_export", "data_export", "analytics");

    EventDispatcher::new(
        ProcessingLedger::new(pool.clone()),
        SubscriptionService::new(pool.clone()),
        AddonService::new(pool.clone()),
        HistoryService::new(pool.clone()),
        book,
        HttpEntitlementSync::new(None),
    )
}

async fn seed_account(pool: &PgPool, tier: &str, status: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO accounts (id, tier, status, billing_customer_ref, billing_subscription_ref)
        VALUES ($1, $2, $3, 'cus_1', 'sub_1')
        "#,
    )
    .bind(id)
    .bind(tier)
    .bind(status)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn account_state(pool: &PgPool, id: Uuid) -> (String, String) {
    sqlx::query_as("SELECT tier, status FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn ledger_status(pool: &PgPool, external_id: &str) -> String {
    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM billing_event_records WHERE external_event_id = $1")
            .bind(external_id)
            .fetch_one(pool)
            .await
            .unwrap();
    status
}

fn future_period_end() -> i64 {
    (OffsetDateTime::now_utc() + Duration::days(30)).unix_timestamp()
}

fn subscription_event(id: &str, event_type: &str, price_ref: &str, period_end: i64) -> BillingEvent {
    let body = serde_json::json!({
        "id": id,
        "type": event_type,
        "created": 1_724_000_000,
        "data": {
            "customer_ref": "cus_1",
            "subscription_ref": "sub_1",
            "price_ref": price_ref,
            "status": "active",
            "current_period_start": 1_724_000_000,
            "current_period_end": period_end
        }
    })
    .to_string();
    BillingEvent::from_slice(body.as_bytes()).unwrap()
}

fn addon_checkout_event(id: &str, subscription_ref: &str) -> BillingEvent {
    let body = serde_json::json!({
        "id": id,
        "type": "checkout_completed",
        "created": 1_724_000_000,
        "data": {
            "customer_ref": "cus_1",
            "subscription_ref": subscription_ref,
            "price_ref": "price_data_export"
        }
    })
    .to_string();
    BillingEvent::from_slice(body.as_bytes()).unwrap()
}

fn invoice_event(id: &str, event_type: &str, subscription_ref: Option<&str>) -> BillingEvent {
    let body = serde_json::json!({
        "id": id,
        "type": event_type,
        "created": 1_724_000_000,
        "data": {
            "customer_ref": "cus_1",
            "subscription_ref": subscription_ref
        }
    })
    .to_string();
    BillingEvent::from_slice(body.as_bytes()).unwrap()
}

#[sqlx::test(migrations = "../../migrations")]
async fn redelivered_event_runs_side_effects_once(pool: PgPool) {
    let account_id = seed_account(&pool, "starter", "active").await;
    let dispatcher = dispatcher(&pool);
    let event = subscription_event("evt_up_1", "subscription_updated", "price_pro", future_period_end());

    let first = dispatcher.dispatch(&event).await.unwrap();
    assert!(matches!(first, Outcome::Processed { .. }));

    let second = dispatcher.dispatch(&event).await.unwrap();
    assert!(matches!(
        second,
        Outcome::AlreadyProcessed {
            prior_status: ProcessingStatus::Success
        }
    ));

    let (tier, _) = account_state(&pool, account_id).await;
    assert_eq!(tier, "professional");

    let (upgrades,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subscription_history WHERE account_id = $1 AND lifecycle_event = 'upgrade'",
    )
    .bind(account_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(upgrades, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn downgrade_freezes_entitlements_at_the_old_tier(pool: PgPool) {
    let account_id = seed_account(&pool, "professional", "active").await;
    let dispatcher = dispatcher(&pool);
    let period_end = future_period_end();
    let event = subscription_event("evt_down_1", "subscription_updated", "price_starter", period_end);

    let outcome = dispatcher.dispatch(&event).await.unwrap();
    assert!(matches!(outcome, Outcome::Processed { .. }));

    // The committed tier moves immediately...
    let (tier, _) = account_state(&pool, account_id).await;
    assert_eq!(tier, "starter");

    // ...but the freeze pins what the account effectively grants.
    let grace = GracePeriodService::new(pool.clone());
    let freeze = grace.active_freeze(account_id).await.unwrap().unwrap();
    assert_eq!(freeze.frozen_tier, "professional");
    assert_eq!(freeze.pending_tier.as_deref(), Some("starter"));
    assert_eq!(freeze.frozen_until.unix_timestamp(), period_end);

    let effective = grace.effective_tier(account_id).await.unwrap();
    assert_eq!(effective, Some(Tier::Professional));
}

#[sqlx::test(migrations = "../../migrations")]
async fn addon_checkout_never_touches_the_base_plan(pool: PgPool) {
    let account_id = seed_account(&pool, "professional", "active").await;
    let dispatcher = dispatcher(&pool);

    let outcome = dispatcher
        .dispatch(&addon_checkout_event("evt_addon_1", "sub_addon_1"))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Processed { .. }));

    let (tier, status) = account_state(&pool, account_id).await;
    assert_eq!(tier, "professional");
    assert_eq!(status, "active");

    let (rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM addon_entitlements WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn repurchased_addon_reactivates_the_original_row(pool: PgPool) {
    let account_id = seed_account(&pool, "professional", "active").await;
    let dispatcher = dispatcher(&pool);

    dispatcher
        .dispatch(&addon_checkout_event("evt_addon_buy", "sub_addon_1"))
        .await
        .unwrap();

    // Provider cancels the add-on subscription.
    let body = serde_json::json!({
        "id": "evt_addon_del",
        "type": "subscription_deleted",
        "data": {
            "customer_ref": "cus_1",
            "subscription_ref": "sub_addon_1",
            "price_ref": "price_data_export",
            "status": "canceled",
            "current_period_start": 1_724_000_000,
            "current_period_end": 1_726_592_000
        }
    })
    .to_string();
    dispatcher
        .dispatch(&BillingEvent::from_slice(body.as_bytes()).unwrap())
        .await
        .unwrap();

    // Repurchase under a fresh provider subscription.
    dispatcher
        .dispatch(&addon_checkout_event("evt_addon_rebuy", "sub_addon_2"))
        .await
        .unwrap();

    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT status, billing_subscription_ref FROM addon_entitlements WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(rows.len(), 1, "repurchase must converge to one row");
    assert_eq!(rows[0].0, "active");
    assert_eq!(rows[0].1.as_deref(), Some("sub_addon_2"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn unresolvable_account_fails_without_mutation(pool: PgPool) {
    let dispatcher = dispatcher(&pool);
    let event = subscription_event("evt_ghost_1", "subscription_created", "price_pro", future_period_end());

    let outcome = dispatcher.dispatch(&event).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed { .. }));

    assert_eq!(ledger_status(&pool, "evt_ghost_1").await, "failed");

    let (accounts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
        .fetch_one(&pool)
        .await
        .unwrap();
    let (addons,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM addon_entitlements")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!((accounts, addons), (0, 0));

    // The failure still leaves an audit row, with no account resolved.
    let (history,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subscription_history WHERE external_event_id = 'evt_ghost_1' AND account_id IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(history, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn addon_invoice_is_acknowledged_as_skipped(pool: PgPool) {
    let account_id = seed_account(&pool, "professional", "active").await;
    let dispatcher = dispatcher(&pool);

    dispatcher
        .dispatch(&addon_checkout_event("evt_addon_buy", "sub_addon_1"))
        .await
        .unwrap();

    let outcome = dispatcher
        .dispatch(&invoice_event("evt_addon_inv", "invoice_paid", Some("sub_addon_1")))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Skipped { .. }));

    assert_eq!(ledger_status(&pool, "evt_addon_inv").await, "skipped");

    let (_, status) = account_state(&pool, account_id).await;
    assert_eq!(status, "active");
}

#[sqlx::test(migrations = "../../migrations")]
async fn invoice_for_unknown_subscription_never_falls_back_to_the_base_plan(pool: PgPool) {
    let account_id = seed_account(&pool, "professional", "active").await;
    let dispatcher = dispatcher(&pool);

    // An invoice for a subscription delivered ahead of its checkout: the
    // customer ref would match, but applying it could wrongly mark the
    // base plan past due.
    let outcome = dispatcher
        .dispatch(&invoice_event(
            "evt_orphan_inv",
            "invoice_payment_failed",
            Some("sub_unseen"),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Failed { .. }));

    assert_eq!(ledger_status(&pool, "evt_orphan_inv").await, "failed");

    let (tier, status) = account_state(&pool, account_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("professional", "active"));
}
