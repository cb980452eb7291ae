//! Fundraiser pledge charging.
//!
//! Pledges are promises to pay for a crowdfunded release. No money moves at
//! pledge time; a charging run later bills each open pledge off-session
//! against a stored payment method. Pledgers without one are skipped
//! silently and picked up by a future run.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::SiteSettings;
use crate::error::{PaymentError, Result};
use crate::fees::FeeCalculator;
use crate::metadata::{PurchaseType, SessionMetadata};
use crate::notify::{enqueue_or_log, templates, NotificationDispatcher};
use crate::processor::{OffSessionChargeRequest, PaymentIntentStatus, ProcessorClient};
use crate::storage::{
    CatalogStore, FundraiserPledge, LedgerTransaction, PaymentStatus, PaymentStore, PledgeFilter,
    Purchase, PurchaseTarget, WriteOutcome,
};

/// Tally of one charging run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PledgeChargeReport {
    /// Charged and settled.
    pub charged: usize,
    /// Charge created; settlement will arrive via webhook.
    pub pending: usize,
    /// Skipped (no stored payment method, or seller not payable).
    pub skipped: usize,
    /// Charge attempt failed.
    pub failed: usize,
}

/// Charges open pledges and reconciles their settlement events.
#[derive(Clone)]
pub struct PledgeCharger<S, P, N> {
    store: S,
    processor: P,
    notifier: N,
    fees: FeeCalculator,
}

impl<S, P, N> PledgeCharger<S, P, N>
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

    /// Record a pledge. No payment happens here.
    pub async fn create_pledge(
        &self,
        user_id: &str,
        track_group_id: &str,
        amount: i64,
    ) -> Result<FundraiserPledge> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "user",
                id: user_id.to_string(),
            })?;
        let group = self
            .store
            .find_track_group(track_group_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "trackGroup",
                id: track_group_id.to_string(),
            })?;
        if amount < group.minimum_price {
            return Err(PaymentError::PriceBelowMinimum {
                price: amount,
                minimum: group.minimum_price,
            }
            .into());
        }

        let pledge = FundraiserPledge {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            track_group_id: group.id,
            fundraiser_id: group.fundraiser_id,
            amount,
            currency: group.currency,
            stored_payment_method_ref: None,
            paid_at: None,
            cancelled_at: None,
            created_at: Utc::now(),
        };
        self.store.create_pledge(&pledge).await?;
        tracing::info!(
            target: "bandstand::pledges",
            pledge_id = %pledge.id,
            track_group_id,
            amount,
            "Pledge recorded"
        );
        Ok(pledge)
    }

    /// Cancel an open pledge.
    pub async fn cancel_pledge(&self, pledge_id: &str) -> Result<()> {
        if !self.store.cancel_pledge(pledge_id, Utc::now()).await? {
            return Err(PaymentError::RecordMissing {
                kind: "pledge",
                id: pledge_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Charge every open pledge matching the filter.
    ///
    /// Each pledge is independent: one failure never aborts the run. The
    /// report says how far the run got.
    pub async fn charge_open_pledges(&self, filter: &PledgeFilter) -> Result<PledgeChargeReport> {
        let pledges = self.store.list_open_pledges(filter).await?;
        let mut report = PledgeChargeReport::default();

        for pledge in &pledges {
            match self.charge_one(pledge).await {
                Ok(ChargeResult::Charged) => report.charged += 1,
                Ok(ChargeResult::Pending) => report.pending += 1,
                Ok(ChargeResult::Skipped) => report.skipped += 1,
                Ok(ChargeResult::Failed) => report.failed += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "bandstand::pledges",
                        pledge_id = %pledge.id,
                        error = %err,
                        "Pledge charge errored"
                    );
                }
            }
        }

        tracing::info!(
            target: "bandstand::pledges",
            total = pledges.len(),
            charged = report.charged,
            pending = report.pending,
            skipped = report.skipped,
            failed = report.failed,
            "Pledge charging run finished"
        );
        Ok(report)
    }

    async fn charge_one(&self, pledge: &FundraiserPledge) -> Result<ChargeResult> {
        let Some(user) = self.store.find_user(&pledge.user_id).await? else {
            tracing::warn!(
                target: "bandstand::pledges",
                pledge_id = %pledge.id,
                "Pledger account no longer exists, skipping"
            );
            return Ok(ChargeResult::Skipped);
        };
        let Some(group) = self.store.find_track_group(&pledge.track_group_id).await? else {
            tracing::warn!(
                target: "bandstand::pledges",
                pledge_id = %pledge.id,
                "Pledged release no longer exists, skipping"
            );
            return Ok(ChargeResult::Skipped);
        };
        // Double-charge guard: the backer may have bought the release
        // outright while the pledge sat open.
        if self
            .store
            .find_purchase(
                &pledge.user_id,
                &PurchaseTarget::TrackGroup(pledge.track_group_id.clone()),
            )
            .await?
            .is_some()
        {
            tracing::info!(
                target: "bandstand::pledges",
                pledge_id = %pledge.id,
                "Backer already owns the release, skipping charge"
            );
            return Ok(ChargeResult::Skipped);
        }

        let artist = self.store.find_artist(&group.artist_id).await?;
        let Some(account) = artist
            .as_ref()
            .filter(|a| a.charges_enabled)
            .and_then(|a| a.connected_account_id.clone())
        else {
            tracing::warn!(
                target: "bandstand::pledges",
                pledge_id = %pledge.id,
                artist_id = %group.artist_id,
                "Seller not payable, skipping pledge"
            );
            return Ok(ChargeResult::Skipped);
        };

        // No stored method is the expected case for many pledgers; a later
        // run retries once they've bought something else on this seller.
        let Some(method) = self
            .processor
            .find_stored_payment_method(&account, &user.email)
            .await?
        else {
            tracing::debug!(
                target: "bandstand::pledges",
                pledge_id = %pledge.id,
                "No stored payment method, skipping"
            );
            return Ok(ChargeResult::Skipped);
        };

        let platform_cut = self.fees.app_fee(
            pledge.amount,
            &pledge.currency,
            artist.as_ref().and_then(|a| a.fee_override_percent),
        );
        let metadata = SessionMetadata::new(PurchaseType::FundraiserPledge, account.clone())
            .user_id(pledge.user_id.clone())
            .artist_id(group.artist_id.clone())
            .track_group_id(pledge.track_group_id.clone())
            .pledge_id(pledge.id.clone());

        let intent = match self
            .processor
            .create_off_session_charge(&OffSessionChargeRequest {
                seller_account_id: account.clone(),
                customer_id: method.customer_id.clone(),
                payment_method_id: method.id.clone(),
                amount: pledge.amount,
                currency: pledge.currency.clone(),
                application_fee_amount: platform_cut,
                metadata: metadata.to_map(),
            })
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                tracing::warn!(
                    target: "bandstand::pledges",
                    pledge_id = %pledge.id,
                    error = %err,
                    "Off-session charge failed"
                );
                enqueue_or_log(
                    &self.notifier,
                    templates::FUNDRAISER_PLEDGE_FAILED,
                    &user.email,
                    json!({
                        "trackGroupId": pledge.track_group_id,
                        "amount": pledge.amount,
                        "currency": pledge.currency,
                    }),
                )
                .await;
                return Ok(ChargeResult::Failed);
            }
        };

        match intent.status {
            PaymentIntentStatus::Succeeded => {
                self.record_pledge_ledger(pledge, &intent.id, platform_cut, PaymentStatus::Completed)
                    .await?;
                self.store
                    .mark_pledge_paid(&pledge.id, Utc::now(), Some(&method.id))
                    .await?;
                let granted = self.grant_release(pledge, platform_cut, &intent.id).await?;
                if granted {
                    enqueue_or_log(
                        &self.notifier,
                        templates::FUNDRAISER_PLEDGE_CHARGED,
                        &user.email,
                        json!({
                            "trackGroupId": pledge.track_group_id,
                            "amount": pledge.amount,
                            "currency": pledge.currency,
                            "fundraiserGoal": group.fundraiser_goal,
                        }),
                    )
                    .await;
                }
                Ok(ChargeResult::Charged)
            }
            PaymentIntentStatus::Processing | PaymentIntentStatus::RequiresAction => {
                // Mark paid now so the next run doesn't double-charge; the
                // settlement webhook finalizes or reopens it.
                self.record_pledge_ledger(pledge, &intent.id, platform_cut, PaymentStatus::Pending)
                    .await?;
                self.store
                    .mark_pledge_paid(&pledge.id, Utc::now(), Some(&method.id))
                    .await?;
                Ok(ChargeResult::Pending)
            }
            PaymentIntentStatus::Failed => {
                self.record_pledge_ledger(pledge, &intent.id, platform_cut, PaymentStatus::Failed)
                    .await?;
                enqueue_or_log(
                    &self.notifier,
                    templates::FUNDRAISER_PLEDGE_FAILED,
                    &user.email,
                    json!({
                        "trackGroupId": pledge.track_group_id,
                        "amount": pledge.amount,
                        "currency": pledge.currency,
                    }),
                )
                .await;
                Ok(ChargeResult::Failed)
            }
        }
    }

    async fn seller_account_for(&self, pledge: &FundraiserPledge) -> Result<Option<String>> {
        let Some(group) = self.store.find_track_group(&pledge.track_group_id).await? else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_artist(&group.artist_id)
            .await?
            .and_then(|a| a.connected_account_id))
    }

    async fn record_pledge_ledger(
        &self,
        pledge: &FundraiserPledge,
        reference: &str,
        platform_cut: i64,
        status: PaymentStatus,
    ) -> Result<WriteOutcome> {
        self.store
            .record_ledger_transaction(&LedgerTransaction {
                id: Uuid::new_v4().to_string(),
                user_id: pledge.user_id.clone(),
                amount: pledge.amount,
                currency: pledge.currency.clone(),
                platform_cut,
                processor_fee: 0,
                status,
                processor_reference_id: reference.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    /// Grant the pledged release. Returns whether the grant was new.
    async fn grant_release(
        &self,
        pledge: &FundraiserPledge,
        platform_cut: i64,
        reference: &str,
    ) -> Result<bool> {
        let outcome = self
            .store
            .create_purchase_if_absent(&Purchase {
                id: Uuid::new_v4().to_string(),
                user_id: pledge.user_id.clone(),
                target: PurchaseTarget::TrackGroup(pledge.track_group_id.clone()),
                price_paid: pledge.amount,
                currency_paid: pledge.currency.clone(),
                processor_reference_id: reference.to_string(),
                platform_cut,
                message: None,
                single_download_token: Some(Uuid::new_v4().to_string()),
                created_at: Utc::now(),
            })
            .await?;
        Ok(outcome == WriteOutcome::Created)
    }

    /// Settle an asynchronous pledge charge that succeeded.
    pub async fn confirm_succeeded(
        &self,
        pledge_id: &str,
        payment_intent_id: &str,
    ) -> Result<bool> {
        let Some(pledge) = self.store.find_pledge(pledge_id).await? else {
            tracing::warn!(
                target: "bandstand::pledges",
                pledge_id,
                "Settlement event for unknown pledge"
            );
            return Ok(false);
        };

        self.store
            .mark_ledger_status(payment_intent_id, PaymentStatus::Completed)
            .await?;
        self.store
            .mark_pledge_paid(&pledge.id, Utc::now(), None)
            .await?;

        let platform_cut = {
            let artist_override = match self.store.find_track_group(&pledge.track_group_id).await? {
                Some(group) => self
                    .store
                    .find_artist(&group.artist_id)
                    .await?
                    .and_then(|a| a.fee_override_percent),
                None => None,
            };
            self.fees
                .app_fee(pledge.amount, &pledge.currency, artist_override)
        };
        let granted = self
            .grant_release(&pledge, platform_cut, payment_intent_id)
            .await?;
        if granted {
            if let Some(user) = self.store.find_user(&pledge.user_id).await? {
                enqueue_or_log(
                    &self.notifier,
                    templates::FUNDRAISER_PLEDGE_CHARGED,
                    &user.email,
                    json!({
                        "trackGroupId": pledge.track_group_id,
                        "amount": pledge.amount,
                        "currency": pledge.currency,
                    }),
                )
                .await;
            }
        }
        Ok(true)
    }

    /// Settle an asynchronous pledge charge that failed: reopen the pledge
    /// so the next run retries it.
    pub async fn confirm_failed(&self, pledge_id: &str, payment_intent_id: &str) -> Result<bool> {
        let Some(pledge) = self.store.find_pledge(pledge_id).await? else {
            tracing::warn!(
                target: "bandstand::pledges",
                pledge_id,
                "Failure event for unknown pledge"
            );
            return Ok(false);
        };

        let changed = self
            .store
            .mark_ledger_status(payment_intent_id, PaymentStatus::Failed)
            .await?;
        self.store.reopen_pledge(&pledge.id).await?;

        if changed {
            // The retry email carries the intent's client secret so the
            // frontend can re-confirm the same charge.
            let client_secret = match self.seller_account_for(&pledge).await? {
                Some(account) => {
                    self.processor
                        .get_payment_intent(&account, payment_intent_id)
                        .await?
                        .client_secret
                }
                None => None,
            };
            if let Some(user) = self.store.find_user(&pledge.user_id).await? {
                enqueue_or_log(
                    &self.notifier,
                    templates::FUNDRAISER_PLEDGE_FAILED,
                    &user.email,
                    json!({
                        "trackGroupId": pledge.track_group_id,
                        "amount": pledge.amount,
                        "currency": pledge.currency,
                        "clientSecret": client_secret,
                    }),
                )
                .await;
            }
        }
        Ok(true)
    }
}

enum ChargeResult {
    Charged,
    Pending,
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingDispatcher;
    use crate::processor::{MockProcessorClient, StoredPaymentMethod};
    use crate::storage::memory::InMemoryEngineStore;
    use crate::storage::{Artist, TrackGroup, UserAccount};

    fn charger(
        store: InMemoryEngineStore,
        processor: MockProcessorClient,
        notifier: RecordingDispatcher,
    ) -> PledgeCharger<InMemoryEngineStore, MockProcessorClient, RecordingDispatcher> {
        PledgeCharger::new(
            store,
            processor,
            notifier,
            SiteSettings::new().platform_fee_percent(7.0),
        )
    }

    fn seed(store: &InMemoryEngineStore) {
        store.insert_user(UserAccount {
            id: "u1".to_string(),
            email: "fan@example.com".to_string(),
            name: None,
            created_at: Utc::now(),
        });
        store.insert_artist(Artist {
            id: "a1".to_string(),
            name: "Artist".to_string(),
            contact_email: None,
            connected_account_id: Some("acct_1".to_string()),
            charges_enabled: true,
            fee_override_percent: None,
        });
        store.insert_track_group(TrackGroup {
            id: "tg1".to_string(),
            artist_id: "a1".to_string(),
            title: "Crowdfunded LP".to_string(),
            price: 2000,
            currency: "usd".to_string(),
            minimum_price: 1000,
            upstream_product_id: None,
            purchasable: false,
            fundraiser_id: Some("fund_1".to_string()),
            fundraiser_goal: Some(500_000),
        });
    }

    #[tokio::test]
    async fn test_charges_pledge_with_stored_method() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let processor = MockProcessorClient::new();
        processor.insert_stored_payment_method(
            "acct_1",
            "fan@example.com",
            StoredPaymentMethod {
                id: "pm_1".to_string(),
                customer_id: "cus_1".to_string(),
            },
        );
        let notifier = RecordingDispatcher::new();
        let charger = charger(store.clone(), processor.clone(), notifier.clone());

        charger.create_pledge("u1", "tg1", 2000).await.unwrap();
        let report = charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        assert_eq!(report.charged, 1);
        assert_eq!(report.failed, 0);

        let charges = processor.off_session_charges();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].application_fee_amount, 140);
        assert_eq!(
            charges[0].metadata.get("purchaseType").unwrap(),
            "fundraiserPledge"
        );

        // Pledge closed, release granted, pledger notified.
        assert!(store.list_open_pledges(&PledgeFilter::All).await.unwrap().is_empty());
        assert_eq!(store.all_purchases().len(), 1);
        assert_eq!(
            notifier.queued_for_template("fundraiser-pledge-charged").len(),
            1
        );

        // A second run has nothing to do.
        let report = charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        assert_eq!(report, PledgeChargeReport::default());
        assert_eq!(processor.off_session_charges().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_pledger_without_stored_method() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let processor = MockProcessorClient::new();
        let notifier = RecordingDispatcher::new();
        let charger = charger(store.clone(), processor.clone(), notifier.clone());

        charger.create_pledge("u1", "tg1", 1500).await.unwrap();
        let report = charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(processor.off_session_charges().is_empty());

        // Still open for the next run; no failure email for a skip.
        assert_eq!(
            store.list_open_pledges(&PledgeFilter::All).await.unwrap().len(),
            1
        );
        assert!(notifier.queued().is_empty());
    }

    #[tokio::test]
    async fn test_skips_pledge_when_release_already_owned() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let processor = MockProcessorClient::new();
        processor.insert_stored_payment_method(
            "acct_1",
            "fan@example.com",
            StoredPaymentMethod {
                id: "pm_1".to_string(),
                customer_id: "cus_1".to_string(),
            },
        );
        let charger = charger(store.clone(), processor.clone(), RecordingDispatcher::new());

        charger.create_pledge("u1", "tg1", 2000).await.unwrap();
        // The backer bought the album outright before the charging run.
        store
            .create_purchase_if_absent(&Purchase {
                id: "p_direct".to_string(),
                user_id: "u1".to_string(),
                target: PurchaseTarget::TrackGroup("tg1".to_string()),
                price_paid: 2000,
                currency_paid: "usd".to_string(),
                processor_reference_id: "pi_direct".to_string(),
                platform_cut: 140,
                message: None,
                single_download_token: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.charged, 0);
        assert!(processor.off_session_charges().is_empty());
    }

    #[tokio::test]
    async fn test_declined_charge_keeps_pledge_open() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let processor = MockProcessorClient::new();
        processor.insert_stored_payment_method(
            "acct_1",
            "fan@example.com",
            StoredPaymentMethod {
                id: "pm_1".to_string(),
                customer_id: "cus_1".to_string(),
            },
        );
        processor.script_charge_failure(PaymentError::ProcessorApi {
            operation: "create_off_session_charge".to_string(),
            message: "card declined".to_string(),
            code: Some("card_declined".to_string()),
            http_status: Some(402),
        });
        let notifier = RecordingDispatcher::new();
        let charger = charger(store.clone(), processor, notifier.clone());

        charger.create_pledge("u1", "tg1", 1500).await.unwrap();
        let report = charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            store.list_open_pledges(&PledgeFilter::All).await.unwrap().len(),
            1
        );
        assert_eq!(
            notifier.queued_for_template("fundraiser-pledge-failed").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_pledge_below_minimum_is_rejected() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let charger = charger(
            store,
            MockProcessorClient::new(),
            RecordingDispatcher::new(),
        );
        assert!(charger.create_pledge("u1", "tg1", 500).await.is_err());
    }

    #[tokio::test]
    async fn test_confirm_failed_reopens_pledge() {
        let store = InMemoryEngineStore::new();
        seed(&store);
        let processor = MockProcessorClient::new();
        processor.insert_stored_payment_method(
            "acct_1",
            "fan@example.com",
            StoredPaymentMethod {
                id: "pm_1".to_string(),
                customer_id: "cus_1".to_string(),
            },
        );
        let notifier = RecordingDispatcher::new();
        let charger = charger(store.clone(), processor.clone(), notifier.clone());

        let pledge = charger.create_pledge("u1", "tg1", 1500).await.unwrap();
        charger.charge_open_pledges(&PledgeFilter::All).await.unwrap();
        let intent_id = store.all_ledger_transactions()[0]
            .processor_reference_id
            .clone();

        // The asynchronous settlement comes back as a failure.
        assert!(charger.confirm_failed(&pledge.id, &intent_id).await.unwrap());
        assert_eq!(
            store.list_open_pledges(&PledgeFilter::All).await.unwrap().len(),
            1
        );
    }
}
