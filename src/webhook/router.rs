//! Webhook event routing.
//!
//! Delivery is at-least-once, so every path through here must be safe to
//! replay: processed event ids are remembered, and the handlers underneath
//! use conditional writes. An event id is marked processed only after its
//! handler commits, so a crash mid-handler leads to a retried delivery, not
//! a lost event.

use std::collections::HashMap;

use crate::config::SiteSettings;
use crate::error::{PaymentError, Result};
use crate::metadata::{PurchaseType, SessionMetadata};
use crate::notify::NotificationDispatcher;
use crate::pledges::PledgeCharger;
use crate::processor::{ProcessorClient, SessionDetails};
use crate::registrar::PurchaseRegistrar;
use crate::storage::{CatalogStore, PaymentStore};
use crate::subscriptions::{InvoiceEvent, SubscriptionLifecycle};

use super::signature::SignatureVerifier;

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    /// Event id, the idempotency key for delivery.
    pub id: String,
    /// Event type (e.g. "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// The connected account the event originated from, when it did.
    #[serde(default)]
    pub account: Option<String>,
    /// Event payload.
    pub data: WebhookEventData,
}

/// Webhook event payload wrapper.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was processed.
    Processed,
    /// Event was not relevant to the engine.
    Ignored,
    /// Event id was seen before (idempotent replay).
    AlreadyProcessed,
}

/// Verifies, deduplicates, and routes processor webhook events.
pub struct WebhookHandler<S, P, N> {
    store: S,
    verifier: SignatureVerifier,
    registrar: PurchaseRegistrar<S, P, N>,
    subscriptions: SubscriptionLifecycle<S, P, N>,
    pledges: PledgeCharger<S, P, N>,
}

impl<S, P, N> WebhookHandler<S, P, N>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    pub fn new(store: S, processor: P, notifier: N, settings: SiteSettings) -> Self {
        let verifier = SignatureVerifier::from_settings(&settings);
        let registrar =
            PurchaseRegistrar::new(store.clone(), processor.clone(), notifier.clone());
        let subscriptions = SubscriptionLifecycle::new(
            store.clone(),
            processor.clone(),
            notifier.clone(),
            settings.clone(),
        );
        let pledges = PledgeCharger::new(store.clone(), processor, notifier, settings);
        Self {
            store,
            verifier,
            registrar,
            subscriptions,
            pledges,
        }
    }

    /// Verify the signature and parse the event.
    ///
    /// # Errors
    /// Fails on signature problems or a malformed payload. The detailed
    /// parse error is logged, not returned, to avoid leaking payload
    /// contents.
    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<WebhookEvent> {
        self.verifier.verify(payload, signature_header)?;
        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "bandstand::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            PaymentError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;
        Ok(event)
    }

    /// Process a verified event: dedupe on event id, route, then mark
    /// processed.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::info!(
                target: "bandstand::webhook",
                event_id = %event.id,
                "Duplicate delivery, skipping"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(&event).await?,
            "invoice.paid" => self.handle_invoice(&event, true).await?,
            "invoice.payment_failed" => self.handle_invoice(&event, false).await?,
            "payment_intent.succeeded" => self.handle_payment_intent(&event, true).await?,
            "payment_intent.payment_failed" => self.handle_payment_intent(&event, false).await?,
            "account.updated" => self.handle_account_updated(&event).await?,
            other => {
                tracing::debug!(
                    target: "bandstand::webhook",
                    event_type = other,
                    "Ignoring unhandled event type"
                );
                WebhookOutcome::Ignored
            }
        };

        // Marked only after the handler committed: a crash before this
        // point means a redelivery, which the conditional writes absorb.
        if outcome == WebhookOutcome::Processed {
            self.store.mark_event_processed(&event.id).await?;
        }
        Ok(outcome)
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let object = &event.data.object;
        let metadata = metadata_map(object);
        if !metadata.contains_key("purchaseType") {
            // Not a session this engine opened.
            return Ok(WebhookOutcome::Ignored);
        }
        let meta = SessionMetadata::from_map(&metadata)?;
        let session = session_from_object(object)?;

        let account = if meta.connected_account_id.is_empty() {
            event
                .account
                .clone()
                .ok_or_else(|| PaymentError::InvalidWebhookPayload {
                    message: "session has no connected account".to_string(),
                })?
        } else {
            meta.connected_account_id.clone()
        };

        tracing::info!(
            target: "bandstand::webhook",
            event_id = %event.id,
            session_id = %session.id,
            purchase_type = %meta.purchase_type,
            "Checkout session completed"
        );

        match meta.purchase_type {
            PurchaseType::Track | PurchaseType::TrackGroup | PurchaseType::ArtistCatalogue => {
                self.registrar
                    .register_digital(&account, &session, &meta)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            PurchaseType::Merch => {
                self.registrar
                    .register_merch(&account, &session.id, &meta)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            PurchaseType::Tip => {
                self.registrar.register_tip(&account, &session, &meta).await?;
                Ok(WebhookOutcome::Processed)
            }
            PurchaseType::Subscription => {
                self.subscriptions
                    .activate_from_session(&session, &meta)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            PurchaseType::FundraiserPledge => {
                // Pledges are charged off-session by the charging run, never
                // through hosted checkout.
                tracing::warn!(
                    target: "bandstand::webhook",
                    event_id = %event.id,
                    "Checkout session marked as a pledge, ignoring"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_invoice(&self, event: &WebhookEvent, paid: bool) -> Result<WebhookOutcome> {
        let object = &event.data.object;
        let Some(subscription_id) = object_str(object, "subscription") else {
            // One-off invoices don't concern the engine.
            return Ok(WebhookOutcome::Ignored);
        };
        let invoice = InvoiceEvent {
            invoice_id: object_str(object, "id").unwrap_or_default().to_string(),
            subscription_id: subscription_id.to_string(),
            payment_intent_id: object_str(object, "payment_intent").map(String::from),
            amount: object
                .get(if paid { "amount_paid" } else { "amount_due" })
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0),
            currency: object_str(object, "currency").unwrap_or_default().to_string(),
        };
        let account = event.account.clone().unwrap_or_default();

        let handled = if paid {
            self.subscriptions.handle_invoice_paid(&account, &invoice).await?
        } else {
            self.subscriptions
                .handle_invoice_failed(&account, &invoice)
                .await?
        };
        Ok(if handled {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored
        })
    }

    async fn handle_payment_intent(
        &self,
        event: &WebhookEvent,
        succeeded: bool,
    ) -> Result<WebhookOutcome> {
        let object = &event.data.object;
        let metadata = metadata_map(object);
        // Only pledge charges settle through bare payment intent events;
        // checkout payments are handled on session completion.
        let Some(pledge_id) = metadata.get("pledgeId") else {
            return Ok(WebhookOutcome::Ignored);
        };
        let intent_id =
            object_str(object, "id").ok_or_else(|| PaymentError::InvalidWebhookPayload {
                message: "payment intent event without an id".to_string(),
            })?;

        let handled = if succeeded {
            self.pledges.confirm_succeeded(pledge_id, intent_id).await?
        } else {
            self.pledges.confirm_failed(pledge_id, intent_id).await?
        };
        Ok(if handled {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored
        })
    }

    async fn handle_account_updated(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let object = &event.data.object;
        let account_id =
            object_str(object, "id").ok_or_else(|| PaymentError::InvalidWebhookPayload {
                message: "account event without an id".to_string(),
            })?;
        let charges_enabled = object
            .get("charges_enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let matched = self.store.set_charges_enabled(account_id, charges_enabled).await?;
        if matched {
            tracing::info!(
                target: "bandstand::webhook",
                account_id,
                charges_enabled,
                "Synced seller payout capability"
            );
            Ok(WebhookOutcome::Processed)
        } else {
            Ok(WebhookOutcome::Ignored)
        }
    }
}

fn object_str<'a>(object: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(serde_json::Value::as_str)
}

/// Extract the string-valued metadata bag from an event object.
fn metadata_map(object: &serde_json::Value) -> HashMap<String, String> {
    object
        .get("metadata")
        .and_then(serde_json::Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Build a session view from the event object.
///
/// Completion events carry the session inline but without line items; the
/// merch path re-fetches the session with them expanded.
fn session_from_object(object: &serde_json::Value) -> Result<SessionDetails> {
    let id = object_str(object, "id")
        .ok_or_else(|| PaymentError::InvalidWebhookPayload {
            message: "session object without an id".to_string(),
        })?
        .to_string();
    let customer_email = object
        .get("customer_details")
        .and_then(|d| d.get("email"))
        .and_then(serde_json::Value::as_str)
        .or_else(|| object_str(object, "customer_email"))
        .map(String::from);

    Ok(SessionDetails {
        id,
        customer_email,
        amount_total: object
            .get("amount_total")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0),
        currency: object_str(object, "currency").unwrap_or_default().to_string(),
        payment_intent_id: object_str(object, "payment_intent").map(String::from),
        subscription_id: object_str(object, "subscription").map(String::from),
        metadata: metadata_map(object),
        ..Default::default()
    })
}
