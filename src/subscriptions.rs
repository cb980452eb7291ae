//! Subscription lifecycle management.
//!
//! Activation from a completed subscription checkout, recurring invoice
//! settlement, failed-payment handling, and cancellation. A `(user, tier)`
//! pair maps to at most one subscription row; re-subscribing after
//! cancellation revives the existing row.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::SiteSettings;
use crate::error::{PaymentError, Result};
use crate::fees::FeeCalculator;
use crate::metadata::SessionMetadata;
use crate::notify::{enqueue_or_log, templates, NotificationDispatcher};
use crate::processor::{ProcessorClient, SessionDetails};
use crate::registrar::resolve_buyer;
use crate::storage::{
    CatalogStore, LedgerTransaction, PaymentStatus, PaymentStore, Subscription,
    SubscriptionCharge, WriteOutcome,
};

/// A recurring invoice event, paid or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceEvent {
    pub invoice_id: String,
    pub subscription_id: String,
    pub payment_intent_id: Option<String>,
    /// Amount in the currency's smallest unit.
    pub amount: i64,
    pub currency: String,
}

/// Manages subscription state and recurring charge records.
#[derive(Clone)]
pub struct SubscriptionLifecycle<S, P, N> {
    store: S,
    processor: P,
    notifier: N,
    fees: FeeCalculator,
}

impl<S, P, N> SubscriptionLifecycle<S, P, N>
where
    S: PaymentStore + CatalogStore,
    P: ProcessorClient,
    N: NotificationDispatcher,
{
    pub fn new(store: S, processor: P, notifier: N, settings: SiteSettings) -> Self {
        Self {
            store,
            processor,
            notifier,
            fees: FeeCalculator::new(settings),
        }
    }

    /// Activate (or revive) a subscription from a completed checkout.
    pub async fn activate_from_session(
        &self,
        session: &SessionDetails,
        meta: &SessionMetadata,
    ) -> Result<()> {
        let tier_id =
            meta.tier_id
                .clone()
                .ok_or_else(|| PaymentError::InvalidWebhookPayload {
                    message: "subscription checkout without tierId metadata".to_string(),
                })?;
        let processor_subscription_id = session.subscription_id.clone().ok_or_else(|| {
            PaymentError::InvalidWebhookPayload {
                message: "subscription checkout without a subscription id".to_string(),
            }
        })?;
        let tier = self
            .store
            .find_tier(&tier_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "tier",
                id: tier_id.clone(),
            })?;
        let artist = self.store.find_artist(&tier.artist_id).await?;
        let (user, _) = resolve_buyer(&self.store, meta, session.customer_email.as_deref()).await?;

        let amount = if session.amount_total > 0 {
            session.amount_total
        } else {
            tier.price
        };
        let platform_cut = self.fees.app_fee(
            amount,
            &session.currency,
            artist.as_ref().and_then(|a| a.fee_override_percent),
        );

        let now = Utc::now();
        let stored = self
            .store
            .upsert_subscription(&Subscription {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                tier_id: tier_id.clone(),
                amount,
                currency: session.currency.clone(),
                platform_cut,
                processor_subscription_id,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        tracing::info!(
            target: "bandstand::subscriptions",
            subscription_id = %stored.id,
            user_id = %user.id,
            tier_id = %tier_id,
            "Subscription active"
        );

        enqueue_or_log(
            &self.notifier,
            templates::SUBSCRIPTION_RECEIPT,
            &user.email,
            json!({
                "tierId": tier_id,
                "tierName": tier.name,
                "amount": amount,
                "currency": session.currency,
            }),
        )
        .await;
        if let Some(email) = artist.as_ref().and_then(|a| a.contact_email.as_ref()) {
            enqueue_or_log(
                &self.notifier,
                templates::USER_SUBSCRIBED_TO_YOU,
                email,
                json!({
                    "tierId": tier_id,
                    "tierName": tier.name,
                    "amount": amount,
                    "currency": session.currency,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Record a settled recurring invoice. Returns `false` when the invoice
    /// belongs to no subscription the engine knows.
    pub async fn handle_invoice_paid(
        &self,
        seller_account_id: &str,
        invoice: &InvoiceEvent,
    ) -> Result<bool> {
        let Some(subscription) = self
            .store
            .find_subscription_by_processor_id(&invoice.subscription_id)
            .await?
        else {
            tracing::debug!(
                target: "bandstand::subscriptions",
                subscription_id = %invoice.subscription_id,
                "Invoice for unknown subscription, ignoring"
            );
            return Ok(false);
        };

        let reference = invoice
            .payment_intent_id
            .clone()
            .unwrap_or_else(|| invoice.invoice_id.clone());
        let (platform_cut, processor_fee) = match invoice.payment_intent_id.as_deref() {
            Some(id) => {
                let intent = self
                    .processor
                    .get_payment_intent(seller_account_id, id)
                    .await?;
                (
                    intent.application_fee_amount.unwrap_or(0),
                    intent.processor_fee.unwrap_or(0),
                )
            }
            None => (subscription.platform_cut, 0),
        };

        let ledger = LedgerTransaction {
            id: Uuid::new_v4().to_string(),
            user_id: subscription.user_id.clone(),
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            platform_cut,
            processor_fee,
            status: PaymentStatus::Completed,
            processor_reference_id: reference,
            created_at: Utc::now(),
        };
        if self.store.record_ledger_transaction(&ledger).await? == WriteOutcome::AlreadyExists {
            tracing::info!(
                target: "bandstand::subscriptions",
                invoice_id = %invoice.invoice_id,
                "Invoice already recorded, skipping"
            );
            return Ok(true);
        }

        self.store
            .create_subscription_charge(&SubscriptionCharge {
                id: Uuid::new_v4().to_string(),
                subscription_id: subscription.id.clone(),
                ledger_transaction_id: ledger.id,
                amount: invoice.amount,
                currency: invoice.currency.clone(),
                created_at: Utc::now(),
            })
            .await?;

        if let Some(user) = self.store.find_user(&subscription.user_id).await? {
            enqueue_or_log(
                &self.notifier,
                templates::SUBSCRIPTION_RECEIPT,
                &user.email,
                json!({
                    "tierId": subscription.tier_id,
                    "amount": invoice.amount,
                    "currency": invoice.currency,
                }),
            )
            .await;
        }
        Ok(true)
    }

    /// Record a failed recurring invoice and ask the buyer to retry.
    ///
    /// The retry email carries the payment intent's client secret and the
    /// seller's account id so the frontend can re-confirm the same intent.
    pub async fn handle_invoice_failed(
        &self,
        seller_account_id: &str,
        invoice: &InvoiceEvent,
    ) -> Result<bool> {
        let Some(subscription) = self
            .store
            .find_subscription_by_processor_id(&invoice.subscription_id)
            .await?
        else {
            return Ok(false);
        };

        let reference = invoice
            .payment_intent_id
            .clone()
            .unwrap_or_else(|| invoice.invoice_id.clone());
        let outcome = self
            .store
            .record_ledger_transaction(&LedgerTransaction {
                id: Uuid::new_v4().to_string(),
                user_id: subscription.user_id.clone(),
                amount: invoice.amount,
                currency: invoice.currency.clone(),
                platform_cut: 0,
                processor_fee: 0,
                status: PaymentStatus::Failed,
                processor_reference_id: reference,
                created_at: Utc::now(),
            })
            .await?;
        if outcome == WriteOutcome::AlreadyExists {
            return Ok(true);
        }

        let client_secret = match invoice.payment_intent_id.as_deref() {
            Some(id) => {
                self.processor
                    .get_payment_intent(seller_account_id, id)
                    .await?
                    .client_secret
            }
            None => None,
        };

        tracing::warn!(
            target: "bandstand::subscriptions",
            subscription_id = %subscription.id,
            invoice_id = %invoice.invoice_id,
            "Recurring payment failed"
        );

        if let Some(user) = self.store.find_user(&subscription.user_id).await? {
            enqueue_or_log(
                &self.notifier,
                templates::SUBSCRIPTION_PAYMENT_FAILED,
                &user.email,
                json!({
                    "tierId": subscription.tier_id,
                    "amount": invoice.amount,
                    "currency": invoice.currency,
                    "clientSecret": client_secret,
                    "sellerAccountId": seller_account_id,
                }),
            )
            .await;
        }
        Ok(true)
    }

    /// Cancel a subscription locally (soft delete).
    pub async fn cancel(&self, user_id: &str, tier_id: &str) -> Result<()> {
        if !self
            .store
            .cancel_subscription(user_id, tier_id, Utc::now())
            .await?
        {
            return Err(PaymentError::RecordMissing {
                kind: "subscription",
                id: format!("{}/{}", user_id, tier_id),
            }
            .into());
        }
        tracing::info!(
            target: "bandstand::subscriptions",
            user_id,
            tier_id,
            "Subscription cancelled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PurchaseType;
    use crate::notify::RecordingDispatcher;
    use crate::processor::{MockProcessorClient, PaymentIntentDetails, PaymentIntentStatus};
    use crate::storage::memory::InMemoryEngineStore;
    use crate::storage::{Artist, Tier, UserAccount};

    fn lifecycle(
        store: InMemoryEngineStore,
        processor: MockProcessorClient,
        notifier: RecordingDispatcher,
    ) -> SubscriptionLifecycle<InMemoryEngineStore, MockProcessorClient, RecordingDispatcher> {
        SubscriptionLifecycle::new(
            store,
            processor,
            notifier,
            SiteSettings::new().platform_fee_percent(7.0),
        )
    }

    fn seed_tier(store: &InMemoryEngineStore) {
        store.insert_artist(Artist {
            id: "a1".to_string(),
            name: "Artist".to_string(),
            contact_email: Some("artist@example.com".to_string()),
            connected_account_id: Some("acct_1".to_string()),
            charges_enabled: true,
            fee_override_percent: None,
        });
        store.insert_tier(Tier {
            id: "tier1".to_string(),
            artist_id: "a1".to_string(),
            name: "Backstage".to_string(),
            price: 500,
            currency: "usd".to_string(),
            upstream_product_id: None,
        });
    }

    fn subscription_session(sub_id: &str) -> SessionDetails {
        SessionDetails {
            id: "cs_1".to_string(),
            customer_email: Some("fan@example.com".to_string()),
            amount_total: 500,
            currency: "usd".to_string(),
            subscription_id: Some(sub_id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_activation_and_notifications() {
        let store = InMemoryEngineStore::new();
        seed_tier(&store);
        let notifier = RecordingDispatcher::new();
        let lifecycle = lifecycle(store.clone(), MockProcessorClient::new(), notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::Subscription, "acct_1")
            .user_email("fan@example.com".to_string())
            .tier_id("tier1");
        lifecycle
            .activate_from_session(&subscription_session("sub_1"), &meta)
            .await
            .unwrap();

        let subs = store.all_subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].platform_cut, 35);
        assert!(subs[0].is_active());
        assert_eq!(notifier.queued_for_template("subscription-receipt").len(), 1);
        assert_eq!(
            notifier.queued_for_template("user-subscribed-to-you").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_invoice_paid_records_charge_once() {
        let store = InMemoryEngineStore::new();
        seed_tier(&store);
        store.insert_user(UserAccount {
            id: "u1".to_string(),
            email: "fan@example.com".to_string(),
            name: None,
            created_at: Utc::now(),
        });
        store
            .upsert_subscription(&Subscription {
                id: "s1".to_string(),
                user_id: "u1".to_string(),
                tier_id: "tier1".to_string(),
                amount: 500,
                currency: "usd".to_string(),
                platform_cut: 35,
                processor_subscription_id: "sub_1".to_string(),
                deleted_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let processor = MockProcessorClient::new();
        processor.insert_payment_intent(PaymentIntentDetails {
            id: "pi_inv".to_string(),
            amount: 500,
            currency: "usd".to_string(),
            status: PaymentIntentStatus::Succeeded,
            application_fee_amount: Some(35),
            processor_fee: Some(32),
            client_secret: None,
        });
        let notifier = RecordingDispatcher::new();
        let lifecycle = lifecycle(store.clone(), processor, notifier.clone());

        let invoice = InvoiceEvent {
            invoice_id: "in_1".to_string(),
            subscription_id: "sub_1".to_string(),
            payment_intent_id: Some("pi_inv".to_string()),
            amount: 500,
            currency: "usd".to_string(),
        };
        assert!(lifecycle.handle_invoice_paid("acct_1", &invoice).await.unwrap());
        // Redelivery dedupes on the payment intent reference.
        assert!(lifecycle.handle_invoice_paid("acct_1", &invoice).await.unwrap());

        assert_eq!(store.all_subscription_charges().len(), 1);
        assert_eq!(store.all_ledger_transactions().len(), 1);
        assert_eq!(store.all_ledger_transactions()[0].processor_fee, 32);
        assert_eq!(notifier.queued_for_template("subscription-receipt").len(), 1);
    }

    #[tokio::test]
    async fn test_invoice_failed_sends_retry_email_with_client_secret() {
        let store = InMemoryEngineStore::new();
        seed_tier(&store);
        store.insert_user(UserAccount {
            id: "u1".to_string(),
            email: "fan@example.com".to_string(),
            name: None,
            created_at: Utc::now(),
        });
        store
            .upsert_subscription(&Subscription {
                id: "s1".to_string(),
                user_id: "u1".to_string(),
                tier_id: "tier1".to_string(),
                amount: 500,
                currency: "usd".to_string(),
                platform_cut: 35,
                processor_subscription_id: "sub_1".to_string(),
                deleted_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let processor = MockProcessorClient::new();
        processor.insert_payment_intent(PaymentIntentDetails {
            id: "pi_fail".to_string(),
            amount: 500,
            currency: "usd".to_string(),
            status: PaymentIntentStatus::RequiresAction,
            application_fee_amount: None,
            processor_fee: None,
            client_secret: Some("pi_fail_secret_xyz".to_string()),
        });
        let notifier = RecordingDispatcher::new();
        let lifecycle = lifecycle(store.clone(), processor, notifier.clone());

        let invoice = InvoiceEvent {
            invoice_id: "in_2".to_string(),
            subscription_id: "sub_1".to_string(),
            payment_intent_id: Some("pi_fail".to_string()),
            amount: 500,
            currency: "usd".to_string(),
        };
        assert!(lifecycle
            .handle_invoice_failed("acct_1", &invoice)
            .await
            .unwrap());

        let emails = notifier.queued_for_template("subscription-payment-failed");
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].locals["clientSecret"], "pi_fail_secret_xyz");
        assert_eq!(emails[0].locals["sellerAccountId"], "acct_1");

        let ledger = store.all_ledger_transactions();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_subscription_invoice_is_ignored() {
        let store = InMemoryEngineStore::new();
        let notifier = RecordingDispatcher::new();
        let lifecycle = lifecycle(store.clone(), MockProcessorClient::new(), notifier);

        let invoice = InvoiceEvent {
            invoice_id: "in_x".to_string(),
            subscription_id: "sub_unknown".to_string(),
            payment_intent_id: None,
            amount: 500,
            currency: "usd".to_string(),
        };
        assert!(!lifecycle.handle_invoice_paid("acct_1", &invoice).await.unwrap());
        assert!(store.all_ledger_transactions().is_empty());
    }
}
