//! Server configuration

use anyhow::Context;

/// Runtime configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let webhook_secret =
            std::env::var("BILLING_WEBHOOK_SECRET").context("BILLING_WEBHOOK_SECRET must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Self {
            database_url,
            bind_address,
            webhook_secret,
        })
    }
}
