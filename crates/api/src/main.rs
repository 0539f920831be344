//! Chartflow API Server
//!
//! Hosts the billing webhook endpoint and wires the event processing
//! pipeline to the database.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod routes;
mod state;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chartflow_billing::addons::AddonService;
use chartflow_billing::dispatch::EventDispatcher;
use chartflow_billing::entitlements::HttpEntitlementSync;
use chartflow_billing::history::HistoryService;
use chartflow_billing::ledger::ProcessingLedger;
use chartflow_billing::pricing::PriceBook;
use chartflow_billing::subscriptions::SubscriptionService;
use chartflow_billing::verifier::SharedSecretVerifier;

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chartflow_api=debug,chartflow_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Chartflow API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations complete");

    let price_book = PriceBook::from_env();
    let dispatcher = EventDispatcher::new(
        ProcessingLedger::new(pool.clone()),
        SubscriptionService::new(pool.clone()),
        AddonService::new(pool.clone()),
        HistoryService::new(pool.clone()),
        price_book,
        HttpEntitlementSync::from_env(),
    );

    let state = AppState {
        pool: pool.clone(),
        dispatcher: Arc::new(dispatcher),
        verifier: Arc::new(SharedSecretVerifier::new(config.webhook_secret.clone())),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Listening for billing webhooks");

    axum::serve(listener, app).await?;

    Ok(())
}
