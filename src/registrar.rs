//! Purchase registration from completed checkout sessions.
//!
//! The registrar turns a verified `checkout.session.completed` event into
//! durable records: a ledger transaction, the purchase rows themselves, and
//! notification fan-out. Every write is conditional so at-least-once webhook
//! delivery converges on exactly one of each record.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::metadata::{PurchaseType, SessionMetadata};
use crate::notify::{enqueue_or_log, templates, NotificationDispatcher};
use crate::processor::{ProcessorClient, SessionDetails, SessionLineItem};
use crate::storage::{
    Artist, CatalogStore, LedgerTransaction, MerchPurchase, PaymentStatus, PaymentStore, Purchase,
    PurchaseTarget, Tip, UserAccount, WriteOutcome,
};

/// Resolve the buyer behind a session to a user account, creating one for
/// email-only checkouts. The `bool` is whether the account was just created,
/// which decides between download and receipt emails.
pub(crate) async fn resolve_buyer<S: PaymentStore>(
    store: &S,
    meta: &SessionMetadata,
    session_email: Option<&str>,
) -> Result<(UserAccount, bool)> {
    if let Some(user_id) = &meta.user_id {
        let user =
            store
                .find_user(user_id)
                .await?
                .ok_or_else(|| PaymentError::RecordMissing {
                    kind: "user",
                    id: user_id.clone(),
                })?;
        return Ok((user, false));
    }

    let email = meta
        .user_email
        .as_deref()
        .or(session_email)
        .ok_or_else(|| PaymentError::InvalidWebhookPayload {
            message: "session carries neither a user id nor an email".to_string(),
        })?;

    if let Some(user) = store.find_user_by_email(email).await? {
        return Ok((user, false));
    }
    let user = store.create_user(email, None).await?;
    tracing::info!(
        target: "bandstand::registrar",
        user_id = %user.id,
        "Created account for email-only buyer"
    );
    Ok((user, true))
}

/// Registers purchases for completed checkout sessions.
#[derive(Clone)]
pub struct PurchaseRegistrar<S, P, N> {
    store: S,
    processor: P,
    notifier: N,
}

impl<S, P, N> PurchaseRegistrar<S, P, N>
where
    S: PaymentStore + CatalogStore,
    P: ProcessorClient,
    N: NotificationDispatcher,
{
    pub fn new(store: S, processor: P, notifier: N) -> Self {
        Self {
            store,
            processor,
            notifier,
        }
    }

    async fn resolve_buyer(
        &self,
        meta: &SessionMetadata,
        session_email: Option<&str>,
    ) -> Result<(UserAccount, bool)> {
        resolve_buyer(&self.store, meta, session_email).await
    }

    /// Fetch the real fee breakdown from the settled payment intent.
    ///
    /// Sessions don't carry the processor's own fee; the intent (with its
    /// charge expanded) does.
    async fn fee_breakdown(
        &self,
        seller_account_id: &str,
        payment_intent_id: Option<&str>,
    ) -> Result<(i64, i64)> {
        match payment_intent_id {
            Some(id) => {
                let intent = self
                    .processor
                    .get_payment_intent(seller_account_id, id)
                    .await?;
                Ok((
                    intent.application_fee_amount.unwrap_or(0),
                    intent.processor_fee.unwrap_or(0),
                ))
            }
            None => Ok((0, 0)),
        }
    }

    async fn record_ledger(
        &self,
        user_id: &str,
        amount: i64,
        currency: &str,
        platform_cut: i64,
        processor_fee: i64,
        reference: &str,
    ) -> Result<WriteOutcome> {
        self.store
            .record_ledger_transaction(&LedgerTransaction {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                amount,
                currency: currency.to_string(),
                platform_cut,
                processor_fee,
                status: PaymentStatus::Completed,
                processor_reference_id: reference.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    async fn notify_artist_sale(&self, artist: &Artist, locals: serde_json::Value) {
        if let Some(email) = &artist.contact_email {
            enqueue_or_log(&self.notifier, templates::ARTIST_NEW_SALE, email, locals).await;
        }
    }

    async fn artist_for(&self, meta: &SessionMetadata) -> Result<Option<Artist>> {
        match &meta.artist_id {
            Some(id) => self.store.find_artist(id).await,
            None => Ok(None),
        }
    }

    /// Register a digital purchase (track, release, or whole catalogue).
    pub async fn register_digital(
        &self,
        seller_account_id: &str,
        session: &SessionDetails,
        meta: &SessionMetadata,
    ) -> Result<()> {
        let (user, is_new) = self
            .resolve_buyer(meta, session.customer_email.as_deref())
            .await?;
        let reference = session
            .payment_intent_id
            .clone()
            .unwrap_or_else(|| session.id.clone());
        let (platform_cut, processor_fee) = self
            .fee_breakdown(seller_account_id, session.payment_intent_id.as_deref())
            .await?;
        self.record_ledger(
            &user.id,
            session.amount_total,
            &session.currency,
            platform_cut,
            processor_fee,
            &reference,
        )
        .await?;

        match meta.purchase_type {
            PurchaseType::Track => {
                let track_id =
                    meta.track_id
                        .clone()
                        .ok_or_else(|| PaymentError::InvalidWebhookPayload {
                            message: "track purchase without trackId metadata".to_string(),
                        })?;
                self.register_single_digital(
                    &user,
                    is_new,
                    PurchaseTarget::Track(track_id),
                    session,
                    meta,
                    platform_cut,
                    &reference,
                )
                .await
            }
            PurchaseType::TrackGroup => {
                let track_group_id = meta.track_group_id.clone().ok_or_else(|| {
                    PaymentError::InvalidWebhookPayload {
                        message: "release purchase without trackGroupId metadata".to_string(),
                    }
                })?;
                self.register_single_digital(
                    &user,
                    is_new,
                    PurchaseTarget::TrackGroup(track_group_id),
                    session,
                    meta,
                    platform_cut,
                    &reference,
                )
                .await
            }
            PurchaseType::ArtistCatalogue => {
                self.register_catalogue(&user, session, meta, platform_cut, &reference)
                    .await
            }
            other => Err(PaymentError::InvalidWebhookPayload {
                message: format!("'{}' is not a digital purchase type", other),
            }
            .into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn register_single_digital(
        &self,
        user: &UserAccount,
        is_new: bool,
        target: PurchaseTarget,
        session: &SessionDetails,
        meta: &SessionMetadata,
        platform_cut: i64,
        reference: &str,
    ) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        let outcome = self
            .store
            .create_purchase_if_absent(&Purchase {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                target: target.clone(),
                price_paid: session.amount_total,
                currency_paid: session.currency.clone(),
                processor_reference_id: reference.to_string(),
                platform_cut,
                message: None,
                single_download_token: Some(token.clone()),
                created_at: Utc::now(),
            })
            .await?;

        if outcome == WriteOutcome::AlreadyExists {
            tracing::info!(
                target: "bandstand::registrar",
                user_id = %user.id,
                target_id = target.target_id(),
                "Purchase already recorded, skipping"
            );
            return Ok(());
        }

        let template = match (&target, is_new) {
            (PurchaseTarget::Track(_), true) => templates::TRACK_DOWNLOAD,
            (PurchaseTarget::Track(_), false) => templates::TRACK_PURCHASE_RECEIPT,
            (PurchaseTarget::TrackGroup(_), true) => templates::ALBUM_DOWNLOAD,
            (PurchaseTarget::TrackGroup(_), false) => templates::ALBUM_PURCHASE_RECEIPT,
        };
        enqueue_or_log(
            &self.notifier,
            template,
            &user.email,
            json!({
                "targetId": target.target_id(),
                "token": token,
                "amount": session.amount_total,
                "currency": session.currency,
            }),
        )
        .await;

        if let Some(artist) = self.artist_for(meta).await? {
            self.notify_artist_sale(
                &artist,
                json!({
                    "kind": target.kind(),
                    "targetId": target.target_id(),
                    "amount": session.amount_total,
                    "currency": session.currency,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Fan a catalogue purchase out into one purchase per purchasable
    /// release, dividing the paid amount equally (remainder on the first).
    async fn register_catalogue(
        &self,
        user: &UserAccount,
        session: &SessionDetails,
        meta: &SessionMetadata,
        platform_cut: i64,
        reference: &str,
    ) -> Result<()> {
        let artist_id =
            meta.artist_id
                .clone()
                .ok_or_else(|| PaymentError::InvalidWebhookPayload {
                    message: "catalogue purchase without artistId metadata".to_string(),
                })?;
        let groups = self.store.list_purchasable_track_groups(&artist_id).await?;
        if groups.is_empty() {
            tracing::warn!(
                target: "bandstand::registrar",
                artist_id = %artist_id,
                "Catalogue purchase for artist with no purchasable releases"
            );
            return Ok(());
        }

        let n = groups.len() as i64;
        let share = session.amount_total / n;
        let cut_share = platform_cut / n;
        let mut granted = 0_usize;

        for (i, group) in groups.iter().enumerate() {
            let price = if i == 0 {
                share + session.amount_total % n
            } else {
                share
            };
            let cut = if i == 0 {
                cut_share + platform_cut % n
            } else {
                cut_share
            };
            let outcome = self
                .store
                .create_purchase_if_absent(&Purchase {
                    id: Uuid::new_v4().to_string(),
                    user_id: user.id.clone(),
                    target: PurchaseTarget::TrackGroup(group.id.clone()),
                    price_paid: price,
                    currency_paid: session.currency.clone(),
                    processor_reference_id: reference.to_string(),
                    platform_cut: cut,
                    message: None,
                    single_download_token: Some(Uuid::new_v4().to_string()),
                    created_at: Utc::now(),
                })
                .await?;
            if outcome == WriteOutcome::Created {
                granted += 1;
            }
        }

        tracing::info!(
            target: "bandstand::registrar",
            user_id = %user.id,
            artist_id = %artist_id,
            releases = groups.len(),
            granted,
            "Registered catalogue purchase"
        );

        if granted > 0 {
            enqueue_or_log(
                &self.notifier,
                templates::CATALOGUE_PURCHASE_RECEIPT,
                &user.email,
                json!({
                    "artistId": artist_id,
                    "releases": groups.len(),
                    "amount": session.amount_total,
                    "currency": session.currency,
                }),
            )
            .await;
            if let Some(artist) = self.artist_for(meta).await? {
                self.notify_artist_sale(
                    &artist,
                    json!({
                        "kind": "artistCatalogue",
                        "amount": session.amount_total,
                        "currency": session.currency,
                    }),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Register a merch purchase.
    ///
    /// The completion event doesn't carry line items, so the session is
    /// re-fetched with them expanded. Each line is handled independently:
    /// one unrecognized product must not lose the rest of the order.
    pub async fn register_merch(
        &self,
        seller_account_id: &str,
        session_id: &str,
        meta: &SessionMetadata,
    ) -> Result<()> {
        let session = self
            .processor
            .get_session(seller_account_id, session_id, true)
            .await?;
        let (user, _) = self
            .resolve_buyer(meta, session.customer_email.as_deref())
            .await?;
        let reference = session
            .payment_intent_id
            .clone()
            .unwrap_or_else(|| session.id.clone());
        let (platform_cut, processor_fee) = self
            .fee_breakdown(seller_account_id, session.payment_intent_id.as_deref())
            .await?;
        let ledger_outcome = self
            .record_ledger(
                &user.id,
                session.amount_total,
                &session.currency,
                platform_cut,
                processor_fee,
                &reference,
            )
            .await?;
        if ledger_outcome == WriteOutcome::AlreadyExists {
            tracing::info!(
                target: "bandstand::registrar",
                session_id,
                "Merch order already recorded, skipping"
            );
            return Ok(());
        }

        let mut recorded = 0_usize;
        for item in &session.line_items {
            // Proportional share of the platform cut per line.
            let cut = if session.amount_total > 0 {
                platform_cut.saturating_mul(item.amount_total) / session.amount_total
            } else {
                0
            };
            match self
                .record_merch_line(&user, &session, item, cut, &reference)
                .await
            {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "bandstand::registrar",
                        session_id,
                        product_id = %item.product_id,
                        error = %err,
                        "Failed to record merch line item"
                    );
                }
            }
        }

        if recorded > 0 {
            enqueue_or_log(
                &self.notifier,
                templates::MERCH_PURCHASE_RECEIPT,
                &user.email,
                json!({
                    "sessionId": session_id,
                    "items": recorded,
                    "amount": session.amount_total,
                    "currency": session.currency,
                }),
            )
            .await;
            if let Some(artist) = self.artist_for(meta).await? {
                self.notify_artist_sale(
                    &artist,
                    json!({
                        "kind": "merch",
                        "amount": session.amount_total,
                        "currency": session.currency,
                    }),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Record one merch line item. Returns whether a purchase was recorded.
    async fn record_merch_line(
        &self,
        user: &UserAccount,
        session: &SessionDetails,
        item: &SessionLineItem,
        platform_cut: i64,
        reference: &str,
    ) -> Result<bool> {
        let Some(resolution) = self.store.resolve_upstream_product(&item.product_id).await? else {
            tracing::warn!(
                target: "bandstand::registrar",
                product_id = %item.product_id,
                "Line item product does not map to any merch, skipping"
            );
            return Ok(false);
        };
        let variant_id = resolution.variant.as_ref().map(|v| v.id.clone());

        // The buyer already paid; a floor hit is an oversell to flag, not a
        // reason to drop the record.
        let decremented = self
            .store
            .decrement_inventory(&resolution.merch.id, variant_id.as_deref(), item.quantity)
            .await?;
        if !decremented {
            tracing::warn!(
                target: "bandstand::registrar",
                merch_id = %resolution.merch.id,
                variant_id = variant_id.as_deref().unwrap_or("-"),
                quantity = item.quantity,
                "Inventory floor reached, recording oversold purchase"
            );
        }

        self.store
            .create_merch_purchase(&MerchPurchase {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                merch_id: resolution.merch.id.clone(),
                variant_id,
                quantity: item.quantity,
                price_paid: item.amount_total,
                currency_paid: item.currency.clone(),
                processor_reference_id: reference.to_string(),
                platform_cut,
                shipping_address: session.shipping_address.clone(),
                billing_address: session.billing_address.clone(),
                created_at: Utc::now(),
            })
            .await?;

        // Grant any bundled digital release. The buyer may own it already;
        // that's a no-op, not a failure.
        if let Some(track_group_id) = &resolution.merch.includes_track_group_id {
            self.store
                .create_purchase_if_absent(&Purchase {
                    id: Uuid::new_v4().to_string(),
                    user_id: user.id.clone(),
                    target: PurchaseTarget::TrackGroup(track_group_id.clone()),
                    price_paid: 0,
                    currency_paid: item.currency.clone(),
                    processor_reference_id: reference.to_string(),
                    platform_cut: 0,
                    message: None,
                    single_download_token: Some(Uuid::new_v4().to_string()),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(true)
    }

    /// Register a tip.
    pub async fn register_tip(
        &self,
        seller_account_id: &str,
        session: &SessionDetails,
        meta: &SessionMetadata,
    ) -> Result<()> {
        let artist_id =
            meta.artist_id
                .clone()
                .ok_or_else(|| PaymentError::InvalidWebhookPayload {
                    message: "tip without artistId metadata".to_string(),
                })?;
        let (user, _) = self
            .resolve_buyer(meta, session.customer_email.as_deref())
            .await?;
        let reference = session
            .payment_intent_id
            .clone()
            .unwrap_or_else(|| session.id.clone());
        let (platform_cut, processor_fee) = self
            .fee_breakdown(seller_account_id, session.payment_intent_id.as_deref())
            .await?;
        let ledger_outcome = self
            .record_ledger(
                &user.id,
                session.amount_total,
                &session.currency,
                platform_cut,
                processor_fee,
                &reference,
            )
            .await?;
        if ledger_outcome == WriteOutcome::AlreadyExists {
            tracing::info!(
                target: "bandstand::registrar",
                session_id = %session.id,
                "Tip already recorded, skipping"
            );
            return Ok(());
        }

        self.store
            .create_tip(&Tip {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                artist_id: artist_id.clone(),
                amount: session.amount_total,
                currency: session.currency.clone(),
                platform_cut,
                message: None,
                processor_reference_id: reference,
                created_at: Utc::now(),
            })
            .await?;

        enqueue_or_log(
            &self.notifier,
            templates::TIP_RECEIPT,
            &user.email,
            json!({
                "artistId": artist_id,
                "amount": session.amount_total,
                "currency": session.currency,
            }),
        )
        .await;
        if let Some(artist) = self.store.find_artist(&artist_id).await? {
            if let Some(email) = &artist.contact_email {
                enqueue_or_log(
                    &self.notifier,
                    templates::TIP_RECEIVED,
                    email,
                    json!({
                        "amount": session.amount_total,
                        "currency": session.currency,
                    }),
                )
                .await;
            }
        }
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
    use crate::storage::{MerchItem, TrackGroup};

    fn registrar(
        store: InMemoryEngineStore,
        processor: MockProcessorClient,
        notifier: RecordingDispatcher,
    ) -> PurchaseRegistrar<InMemoryEngineStore, MockProcessorClient, RecordingDispatcher> {
        PurchaseRegistrar::new(store, processor, notifier)
    }

    fn completed_session(id: &str, amount: i64, intent: &str) -> SessionDetails {
        SessionDetails {
            id: id.to_string(),
            customer_email: Some("fan@example.com".to_string()),
            amount_total: amount,
            currency: "usd".to_string(),
            payment_intent_id: Some(intent.to_string()),
            ..Default::default()
        }
    }

    fn seeded_intent(processor: &MockProcessorClient, id: &str, amount: i64, fee: i64) {
        processor.insert_payment_intent(PaymentIntentDetails {
            id: id.to_string(),
            amount,
            currency: "usd".to_string(),
            status: PaymentIntentStatus::Succeeded,
            application_fee_amount: Some(fee),
            processor_fee: Some(59),
            client_secret: None,
        });
    }

    #[tokio::test]
    async fn test_digital_purchase_creates_records_and_download_email() {
        let store = InMemoryEngineStore::new();
        let processor = MockProcessorClient::new();
        let notifier = RecordingDispatcher::new();
        seeded_intent(&processor, "pi_1", 1000, 70);
        let registrar = registrar(store.clone(), processor, notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::Track, "acct_1")
            .user_email("fan@example.com".to_string())
            .track_id("t1");
        registrar
            .register_digital("acct_1", &completed_session("cs_1", 1000, "pi_1"), &meta)
            .await
            .unwrap();

        let purchases = store.all_purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].platform_cut, 70);
        assert!(purchases[0].single_download_token.is_some());

        let ledger = store.all_ledger_transactions();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].processor_fee, 59);
        assert_eq!(ledger[0].status, PaymentStatus::Completed);

        // Email-only buyer got an account and a download email.
        assert_eq!(store.all_users().len(), 1);
        assert_eq!(notifier.queued_for_template("track-download").len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_registration_is_a_noop() {
        let store = InMemoryEngineStore::new();
        let processor = MockProcessorClient::new();
        let notifier = RecordingDispatcher::new();
        seeded_intent(&processor, "pi_1", 1000, 70);
        let registrar = registrar(store.clone(), processor, notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::TrackGroup, "acct_1")
            .user_email("fan@example.com".to_string())
            .track_group_id("tg1");
        let session = completed_session("cs_1", 1000, "pi_1");
        registrar
            .register_digital("acct_1", &session, &meta)
            .await
            .unwrap();
        registrar
            .register_digital("acct_1", &session, &meta)
            .await
            .unwrap();

        assert_eq!(store.all_purchases().len(), 1);
        assert_eq!(store.all_ledger_transactions().len(), 1);
        // No duplicate email on replay.
        assert_eq!(notifier.queued_for_template("album-download").len(), 1);
    }

    #[tokio::test]
    async fn test_catalogue_fan_out_divides_amount() {
        let store = InMemoryEngineStore::new();
        for id in ["tg1", "tg2", "tg3"] {
            store.insert_track_group(TrackGroup {
                id: id.to_string(),
                artist_id: "a1".to_string(),
                title: id.to_string(),
                price: 1000,
                currency: "usd".to_string(),
                minimum_price: 1000,
                upstream_product_id: None,
                purchasable: true,
                fundraiser_id: None,
                fundraiser_goal: None,
            });
        }
        let processor = MockProcessorClient::new();
        seeded_intent(&processor, "pi_1", 1000, 70);
        let notifier = RecordingDispatcher::new();
        let registrar = registrar(store.clone(), processor, notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::ArtistCatalogue, "acct_1")
            .user_email("fan@example.com".to_string())
            .artist_id("a1");
        registrar
            .register_digital("acct_1", &completed_session("cs_1", 1000, "pi_1"), &meta)
            .await
            .unwrap();

        let purchases = store.all_purchases();
        assert_eq!(purchases.len(), 3);
        // Equal division, remainder on one release; totals reconcile.
        let total: i64 = purchases.iter().map(|p| p.price_paid).sum();
        assert_eq!(total, 1000);
        let cuts: i64 = purchases.iter().map(|p| p.platform_cut).sum();
        assert_eq!(cuts, 70);
        assert_eq!(
            notifier.queued_for_template("catalogue-purchase-receipt").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_free_album_grants_download_to_new_email_buyer() {
        let store = InMemoryEngineStore::new();
        let notifier = RecordingDispatcher::new();
        let registrar = registrar(store.clone(), MockProcessorClient::new(), notifier.clone());

        // Name-your-price at zero: no payment intent exists to read fees from.
        let session = SessionDetails {
            id: "cs_free".to_string(),
            customer_email: Some("new-fan@example.com".to_string()),
            amount_total: 0,
            currency: "usd".to_string(),
            payment_intent_id: None,
            ..Default::default()
        };
        let meta = SessionMetadata::new(PurchaseType::TrackGroup, "acct_1")
            .user_email("new-fan@example.com".to_string())
            .track_group_id("tg1");
        registrar
            .register_digital("acct_1", &session, &meta)
            .await
            .unwrap();

        // An account was created for the unknown email.
        let users = store.all_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "new-fan@example.com");

        let purchases = store.all_purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].price_paid, 0);
        assert_eq!(purchases[0].platform_cut, 0);
        assert!(purchases[0].single_download_token.is_some());

        // The ledger references the session since no intent was created.
        let ledger = store.all_ledger_transactions();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, 0);
        assert_eq!(ledger[0].processor_reference_id, "cs_free");

        // New account gets the download template, not the receipt.
        assert_eq!(notifier.queued_for_template("album-download").len(), 1);
        assert!(notifier
            .queued_for_template("album-purchase-receipt")
            .is_empty());
    }

    #[tokio::test]
    async fn test_merch_line_without_product_mapping_is_skipped() {
        let store = InMemoryEngineStore::new();
        store.insert_merch_item(MerchItem {
            id: "m_1".to_string(),
            artist_id: "a1".to_string(),
            title: "Tour Shirt".to_string(),
            price: 2500,
            currency: "usd".to_string(),
            minimum_price: 2500,
            upstream_product_id: Some("prod_shirt".to_string()),
            quantity_remaining: 10,
            includes_track_group_id: None,
        });

        let processor = MockProcessorClient::new();
        seeded_intent(&processor, "pi_m", 3500, 245);
        // One line maps to the shirt; the other references a product the
        // catalog has never heard of.
        processor.insert_session(SessionDetails {
            id: "cs_m".to_string(),
            customer_email: Some("fan@example.com".to_string()),
            amount_total: 3500,
            currency: "usd".to_string(),
            payment_intent_id: Some("pi_m".to_string()),
            line_items: vec![
                SessionLineItem {
                    product_id: "prod_shirt".to_string(),
                    quantity: 1,
                    amount_total: 2500,
                    currency: "usd".to_string(),
                },
                SessionLineItem {
                    product_id: "prod_ghost".to_string(),
                    quantity: 1,
                    amount_total: 1000,
                    currency: "usd".to_string(),
                },
            ],
            ..Default::default()
        });
        let notifier = RecordingDispatcher::new();
        let registrar = registrar(store.clone(), processor, notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::Merch, "acct_1")
            .user_email("fan@example.com".to_string());
        registrar
            .register_merch("acct_1", "cs_m", &meta)
            .await
            .unwrap();

        // The unmapped line is dropped; the rest of the order survives.
        let merch = store.all_merch_purchases();
        assert_eq!(merch.len(), 1);
        assert_eq!(merch[0].merch_id, "m_1");
        assert_eq!(merch[0].price_paid, 2500);

        let receipts = notifier.queued_for_template("merch-purchase-receipt");
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].locals["items"], 1);

        // The full order still settles one ledger row.
        assert_eq!(store.all_ledger_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_tip_registration() {
        let store = InMemoryEngineStore::new();
        store.insert_artist(Artist {
            id: "a1".to_string(),
            name: "Artist".to_string(),
            contact_email: Some("artist@example.com".to_string()),
            connected_account_id: Some("acct_1".to_string()),
            charges_enabled: true,
            fee_override_percent: None,
        });
        let processor = MockProcessorClient::new();
        seeded_intent(&processor, "pi_1", 1500, 105);
        let notifier = RecordingDispatcher::new();
        let registrar = registrar(store.clone(), processor, notifier.clone());

        let meta = SessionMetadata::new(PurchaseType::Tip, "acct_1")
            .user_email("fan@example.com".to_string())
            .artist_id("a1");
        registrar
            .register_tip("acct_1", &completed_session("cs_1", 1500, "pi_1"), &meta)
            .await
            .unwrap();

        let tips = store.all_tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].amount, 1500);
        assert_eq!(notifier.queued_for_template("tip-receipt").len(), 1);
        assert_eq!(notifier.queued_for_template("tip-received").len(), 1);
    }
}
