//! Billing event processing for Chartflow
//!
//! Turns webhook notifications from the billing provider into durable
//! subscription and entitlement state. The pipeline is:
//!
//! 1. [`verifier`] — authenticate the raw delivery and parse it into a
//!    typed [`events::BillingEvent`]
//! 2. [`ledger`] — claim exclusive processing rights per external event id
//! 3. [`dispatch`] — route the event by type and price classification
//! 4. [`subscriptions`] / [`addons`] — commit the state transition
//! 5. [`history`] / [`entitlements`] — best-effort audit and propagation
//!
//! Base plans and add-ons are strictly partitioned: base-plan handlers are
//! the only writers of `accounts.tier`/`accounts.status`, and add-on
//! handlers only touch `addon_entitlements`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod addons;
pub mod dispatch;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod grace;
pub mod history;
pub mod ledger;
pub mod pricing;
pub mod subscriptions;
pub mod verifier;


pub use addons::{AddonEntitlement, AddonService, AddonStatus};
pub use dispatch::{EventDispatcher, Outcome};
pub use entitlements::{EntitlementSync, HttpEntitlementSync};
pub use error::{BillingError, BillingResult};
pub use events::{BillingEvent, EventPayload, EventType, ProviderStatus};
pub use grace::{GracePeriodService, PendingChange};
pub use history::{HistoryService, LifecycleEvent};
pub use ledger::{ProcessingLedger, ProcessingStatus};
pub use pricing::{Classification, PriceBook, Tier, TierChange};
pub use subscriptions::{Account, AccountStatus, SubscriptionService};
pub use verifier::{EventVerifier, SharedSecretVerifier};
