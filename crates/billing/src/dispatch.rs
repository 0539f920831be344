//! Event dispatcher
//!
//! The pipeline spine: every verified event passes through `admit` on the
//! idempotency ledger, gets routed to the handler its type and price
//! classification select, and has its outcome finalized back into the
//! ledger. Side effects only ever run between a successful claim and its
//! finalization.

use uuid::Uuid;

use crate::addons::AddonService;
use crate::entitlements::EntitlementSync;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    BillingEvent, EventPayload, EventType, InvoiceData, SubscriptionData,
};
use crate::history::{HistoryRecord, HistoryService};
use crate::ledger::{ProcessingLedger, ProcessingStatus};
use crate::pricing::{Classification, PriceBook};
use crate::subscriptions::{BaseTransition, SubscriptionService};

/// What happened to a dispatched event. The HTTP boundary maps this onto
/// response codes; everything except `Failed` acknowledges the delivery.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Side effects ran and committed
    Processed { account_id: Option<Uuid> },
    /// Recognized but deliberately not applied (e.g. unknown price ref)
    Skipped { reason: String },
    /// The ledger refused the claim; a prior delivery owns this event
    AlreadyProcessed { prior_status: ProcessingStatus },
    /// The handler ran and could not apply the event
    Failed { reason: String },
}

enum Applied {
    Base(BaseTransition),
    Addon { account_id: Option<Uuid> },
    Skip { reason: String, account_id: Option<Uuid> },
}

/// Routes verified events through the ledger to their handlers
pub struct EventDispatcher<S: EntitlementSync> {
    ledger: ProcessingLedger,
    subscriptions: SubscriptionService,
    addons: AddonService,
    history: HistoryService,
    price_book: PriceBook,
    sync: S,
}

impl<S: EntitlementSync> EventDispatcher<S> {
    pub fn new(
        ledger: ProcessingLedger,
        subscriptions: SubscriptionService,
        addons: AddonService,
        history: HistoryService,
        price_book: PriceBook,
        sync: S,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            addons,
            history,
            price_book,
            sync,
        }
    }

    /// Process one verified event end to end.
    ///
    /// A ledger error here propagates untouched: without a durable claim
    /// the pipeline must refuse the delivery rather than risk running side
    /// effects twice.
    pub async fn dispatch(&self, event: &BillingEvent) -> BillingResult<Outcome> {
        let admission = self
            .ledger
            .admit(&event.external_id, event.event_type)
            .await?;

        if !admission.admitted {
            return Ok(Outcome::AlreadyProcessed {
                prior_status: admission.prior_status.unwrap_or(ProcessingStatus::Processing),
            });
        }

        tracing::info!(
            external_id = %event.external_id,
            event_type = %event.event_type,
            "Processing billing event"
        );

        match self.route(event).await {
            Ok(Applied::Base(transition)) => {
                self.ledger
                    .finalize(
                        &event.external_id,
                        ProcessingStatus::Success,
                        None,
                        Some(transition.account_id),
                    )
                    .await?;

                // The database already holds the truth; a failed push is
                // re-converged by the next event or the periodic sweep.
                if let Err(e) = self
                    .sync
                    .sync(transition.account_id, transition.tier, transition.status)
                    .await
                {
                    tracing::warn!(
                        account_id = %transition.account_id,
                        error = %e,
                        "Entitlement sync failed after committed transition"
                    );
                }

                Ok(Outcome::Processed {
                    account_id: Some(transition.account_id),
                })
            }
            Ok(Applied::Addon { account_id }) => {
                self.ledger
                    .finalize(
                        &event.external_id,
                        ProcessingStatus::Success,
                        None,
                        account_id,
                    )
                    .await?;

                Ok(Outcome::Processed { account_id })
            }
            Ok(Applied::Skip { reason, account_id }) => {
                tracing::info!(
                    external_id = %event.external_id,
                    reason = %reason,
                    "Event skipped"
                );

                self.ledger
                    .finalize(
                        &event.external_id,
                        ProcessingStatus::Skipped,
                        Some(&reason),
                        account_id,
                    )
                    .await?;

                Ok(Outcome::Skipped { reason })
            }
            Err(e) => {
                let reason = e.to_string();
                if e.is_lookup_failure() {
                    tracing::warn!(
                        external_id = %event.external_id,
                        event_type = %event.event_type,
                        error = %reason,
                        "Event references an account that could not be resolved"
                    );
                } else {
                    tracing::error!(
                        external_id = %event.external_id,
                        event_type = %event.event_type,
                        error = %reason,
                        "Event handler failed"
                    );
                }

                self.ledger
                    .finalize(
                        &event.external_id,
                        ProcessingStatus::Failed,
                        Some(&reason),
                        None,
                    )
                    .await?;

                // The failure still shows up in the audit trail, even with
                // no account resolved.
                if let Err(history_err) = self
                    .history
                    .record(HistoryRecord::new(&event.external_id, event.event_type))
                    .await
                {
                    tracing::warn!(
                        external_id = %event.external_id,
                        error = %history_err,
                        "Failed to record history entry for failed event"
                    );
                }

                Ok(Outcome::Failed { reason })
            }
        }
    }

    async fn route(&self, event: &BillingEvent) -> BillingResult<Applied> {
        match (&event.payload, event.event_type) {
            (EventPayload::Checkout(data), EventType::CheckoutCompleted) => {
                match self.price_book.classify(&data.price_ref) {
                    Classification::Base { tier } => {
                        let transition = self
                            .subscriptions
                            .activate_from_checkout(data, tier, &event.external_id)
                            .await?;
                        Ok(Applied::Base(transition))
                    }
                    Classification::Addon { name, category } => {
                        let account = self.subscriptions.locate_for_checkout(data).await?;
                        let entitlement = self
                            .addons
                            .upsert(account.id, &name, &category, data.subscription_ref.as_deref())
                            .await?;
                        Ok(Applied::Addon {
                            account_id: Some(entitlement.account_id),
                        })
                    }
                    Classification::Unknown => Ok(Applied::Skip {
                        reason: format!("unrecognized price reference: {}", data.price_ref),
                        account_id: None,
                    }),
                }
            }
            (EventPayload::Subscription(data), event_type) => {
                self.route_subscription(data, event_type, &event.external_id)
                    .await
            }
            (EventPayload::Invoice(data), event_type) => {
                self.route_invoice(data, event_type, &event.external_id).await
            }
            (payload, event_type) => Err(BillingError::Internal(format!(
                "payload/type mismatch for {event_type}: {payload:?}"
            ))),
        }
    }

    async fn route_subscription(
        &self,
        data: &SubscriptionData,
        event_type: EventType,
        external_id: &str,
    ) -> BillingResult<Applied> {
        let classification = self.price_book.classify(&data.price_ref);

        if classification == Classification::Unknown {
            return Ok(Applied::Skip {
                reason: format!("unrecognized price reference: {}", data.price_ref),
                account_id: None,
            });
        }

        match (event_type, classification) {
            (EventType::SubscriptionCreated, Classification::Base { tier }) => {
                let transition = self
                    .subscriptions
                    .activate_from_subscription(data, tier, external_id)
                    .await?;
                Ok(Applied::Base(transition))
            }
            (EventType::SubscriptionUpdated, Classification::Base { tier }) => {
                let transition = self
                    .subscriptions
                    .apply_update(data, tier, external_id)
                    .await?;
                Ok(Applied::Base(transition))
            }
            (EventType::SubscriptionDeleted, Classification::Base { .. }) => {
                let transition = self.subscriptions.cancel(data, external_id).await?;
                Ok(Applied::Base(transition))
            }
            (EventType::SubscriptionCreated, Classification::Addon { name, category }) => {
                let account = self
                    .subscriptions
                    .find_by_customer_ref(&data.customer_ref)
                    .await?
                    .ok_or_else(|| BillingError::AccountNotFound(data.customer_ref.clone()))?;
                let entitlement = self
                    .addons
                    .upsert(account.id, &name, &category, Some(&data.subscription_ref))
                    .await?;
                Ok(Applied::Addon {
                    account_id: Some(entitlement.account_id),
                })
            }
            (EventType::SubscriptionUpdated, Classification::Addon { .. }) => {
                let account_id = self
                    .addons
                    .reflect_provider_status(&data.subscription_ref, data.status)
                    .await?;
                Ok(Applied::Addon { account_id })
            }
            (EventType::SubscriptionDeleted, Classification::Addon { .. }) => {
                let account_id = self
                    .addons
                    .cancel_by_subscription(&data.subscription_ref)
                    .await?;
                Ok(Applied::Addon { account_id })
            }
            (event_type, _) => Err(BillingError::Internal(format!(
                "subscription payload routed for {event_type}"
            ))),
        }
    }

    /// Invoice events carry no price reference; the subscription reference
    /// decides whether the invoice belongs to the base plan or an add-on.
    /// The customer-ref fallback only applies when the payload names no
    /// subscription at all.
    async fn route_invoice(
        &self,
        data: &InvoiceData,
        event_type: EventType,
        external_id: &str,
    ) -> BillingResult<Applied> {
        if let Some(subscription_ref) = &data.subscription_ref {
            if let Some(account) = self
                .subscriptions
                .find_by_subscription_ref(subscription_ref)
                .await?
            {
                return self
                    .apply_base_invoice(&account, data, event_type, external_id)
                    .await;
            }

            // Invoices against add-on subscriptions carry no entitlement
            // change of their own; delinquency arrives as a subscription
            // status event.
            if let Some((account_id, addon_name)) = self
                .addons
                .find_by_subscription_ref(subscription_ref)
                .await?
            {
                return Ok(Applied::Skip {
                    reason: format!("invoice for add-on subscription ({addon_name})"),
                    account_id: Some(account_id),
                });
            }

            // A subscription we have never stored. Guessing via the
            // customer ref could let an out-of-order add-on invoice dent
            // the base plan, so this stays a retryable failure.
            return Err(BillingError::AccountNotFound(subscription_ref.clone()));
        }

        let account = self
            .subscriptions
            .find_by_customer_ref(&data.customer_ref)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(data.customer_ref.clone()))?;

        self.apply_base_invoice(&account, data, event_type, external_id)
            .await
    }

    async fn apply_base_invoice(
        &self,
        account: &crate::subscriptions::Account,
        data: &InvoiceData,
        event_type: EventType,
        external_id: &str,
    ) -> BillingResult<Applied> {
        let transition = match event_type {
            EventType::InvoicePaid => {
                self.subscriptions
                    .apply_invoice_paid(account, data, external_id)
                    .await?
            }
            EventType::InvoicePaymentFailed => {
                self.subscriptions.mark_past_due(account, external_id).await?
            }
            other => {
                return Err(BillingError::Internal(format!(
                    "invoice payload routed for {other}"
                )))
            }
        };

        Ok(Applied::Base(transition))
    }
}
