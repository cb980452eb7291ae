//! Product sync and checkout session building.
//!
//! Every sale starts here: the [`CheckoutManager`] validates the seller and
//! price, makes sure a matching product exists on the seller's connected
//! account, and opens a checkout session stamped with reconciliation
//! metadata. The webhook side never trusts a price that didn't go through
//! this path.

use crate::config::SiteSettings;
use crate::error::{EngineError, PaymentError, Result};
use crate::fees::FeeCalculator;
use crate::metadata::{PurchaseType, SessionMetadata};
use crate::processor::{
    CheckoutSession, CreateProductRequest, CreateSessionRequest, ProcessorClient,
    SessionLineItemSpec, SessionMode,
};
use crate::storage::{variant_search_key, Artist, CatalogStore, Sellable};

/// Redirect targets for hosted checkout.
#[derive(Debug, Clone)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    #[must_use]
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }
}

/// Who is buying.
///
/// Checkout works for logged-in users and for email-only guests; the
/// webhook handler resolves guests to accounts after payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buyer {
    User { id: String },
    Email(String),
}

impl Buyer {
    fn stamp(&self, metadata: SessionMetadata) -> SessionMetadata {
        match self {
            Self::User { id } => metadata.user_id(id.clone()),
            Self::Email(email) => metadata.user_email(email.clone()),
        }
    }

    fn email(&self) -> Option<String> {
        match self {
            Self::Email(email) => Some(email.clone()),
            Self::User { .. } => None,
        }
    }
}

/// Builds checkout sessions against a seller's connected account.
#[derive(Clone)]
pub struct CheckoutManager<S, P> {
    store: S,
    processor: P,
    fees: FeeCalculator,
    settings: SiteSettings,
    urls: CheckoutUrls,
}

impl<S, P> CheckoutManager<S, P>
where
    S: CatalogStore,
    P: ProcessorClient,
{
    pub fn new(store: S, processor: P, settings: SiteSettings, urls: CheckoutUrls) -> Self {
        Self {
            store,
            processor,
            fees: FeeCalculator::new(settings.clone()),
            settings,
            urls,
        }
    }

    /// Look up an artist and require a payable connected account.
    async fn payable_artist(&self, artist_id: &str) -> Result<(Artist, String)> {
        let artist = self
            .store
            .find_artist(artist_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "artist",
                id: artist_id.to_string(),
            })?;
        let account = artist
            .connected_account_id
            .clone()
            .filter(|_| artist.charges_enabled)
            .ok_or_else(|| PaymentError::SellerNotPayable {
                artist_id: artist_id.to_string(),
            })?;
        Ok((artist, account))
    }

    /// Validate a pay-what-you-want price against the configured floor.
    fn check_price(offered: Option<i64>, listed: i64, minimum: i64) -> Result<i64> {
        let price = offered.unwrap_or(listed);
        if price < minimum {
            return Err(PaymentError::PriceBelowMinimum { price, minimum }.into());
        }
        Ok(price)
    }

    fn currency_or_default(&self, currency: &str) -> String {
        if currency.is_empty() {
            self.settings.default_currency.clone()
        } else {
            currency.to_lowercase()
        }
    }

    /// Find or create the upstream product for a search key.
    ///
    /// The search key lives in product metadata on the processor side, so
    /// repeated checkouts converge on one product per sellable. When
    /// `cache_on` is given, the resolved product id is also written back to
    /// the local record.
    async fn ensure_product_by_key(
        &self,
        seller_account_id: &str,
        search_key: &str,
        name: &str,
        description: Option<String>,
        cache_on: Option<Sellable>,
    ) -> Result<String> {
        let product = match self
            .processor
            .find_product(seller_account_id, search_key)
            .await?
        {
            Some(existing) => existing,
            None => {
                tracing::debug!(
                    target: "bandstand::catalog",
                    search_key,
                    "Creating upstream product"
                );
                self.processor
                    .create_product(
                        seller_account_id,
                        &CreateProductRequest {
                            name: name.to_string(),
                            description,
                            search_key: search_key.to_string(),
                        },
                    )
                    .await?
            }
        };

        if let Some(sellable) = cache_on {
            self.store.set_upstream_product(&sellable, &product.id).await?;
        }
        Ok(product.id)
    }

    /// Find or create the upstream product for a sellable entity.
    pub async fn ensure_product(
        &self,
        seller_account_id: &str,
        sellable: &Sellable,
    ) -> Result<String> {
        let (search_key, name, description, cached) = match sellable {
            Sellable::Track(id) => {
                let track =
                    self.store
                        .find_track(id)
                        .await?
                        .ok_or_else(|| PaymentError::RecordMissing {
                            kind: "track",
                            id: id.clone(),
                        })?;
                (
                    format!("track:{}", id),
                    track.title,
                    None,
                    track.upstream_product_id,
                )
            }
            Sellable::TrackGroup(id) => {
                let group = self.store.find_track_group(id).await?.ok_or_else(|| {
                    PaymentError::RecordMissing {
                        kind: "trackGroup",
                        id: id.clone(),
                    }
                })?;
                (
                    format!("trackGroup:{}", id),
                    group.title,
                    None,
                    group.upstream_product_id,
                )
            }
            Sellable::Tier(id) => {
                let tier =
                    self.store
                        .find_tier(id)
                        .await?
                        .ok_or_else(|| PaymentError::RecordMissing {
                            kind: "tier",
                            id: id.clone(),
                        })?;
                (
                    format!("tier:{}", id),
                    tier.name,
                    None,
                    tier.upstream_product_id,
                )
            }
            Sellable::Merch(id) => {
                let merch = self.store.find_merch_item(id).await?.ok_or_else(|| {
                    PaymentError::RecordMissing {
                        kind: "merch",
                        id: id.clone(),
                    }
                })?;
                (
                    format!("merch:{}", id),
                    merch.title,
                    None,
                    merch.upstream_product_id,
                )
            }
            Sellable::MerchVariant(id) => {
                let variant = self.store.find_merch_variant(id).await?.ok_or_else(|| {
                    PaymentError::RecordMissing {
                        kind: "merchVariant",
                        id: id.clone(),
                    }
                })?;
                let merch = self
                    .store
                    .find_merch_item(&variant.merch_id)
                    .await?
                    .ok_or_else(|| PaymentError::RecordMissing {
                        kind: "merch",
                        id: variant.merch_id.clone(),
                    })?;
                (
                    variant_search_key(&variant.merch_id, &variant.option_ids),
                    format!("{} ({})", merch.title, variant.option_ids.join(", ")),
                    None,
                    variant.upstream_product_id,
                )
            }
        };

        if let Some(product_id) = cached {
            return Ok(product_id);
        }
        self.ensure_product_by_key(
            seller_account_id,
            &search_key,
            &name,
            description,
            Some(sellable.clone()),
        )
        .await
    }

    async fn open_session(
        &self,
        seller_account_id: &str,
        mode: SessionMode,
        line_items: Vec<SessionLineItemSpec>,
        fee_amount: Option<i64>,
        fee_percent: Option<f64>,
        collect_shipping_address: bool,
        buyer: &Buyer,
        metadata: SessionMetadata,
    ) -> Result<CheckoutSession> {
        let metadata = buyer.stamp(metadata);
        let session = self
            .processor
            .create_checkout_session(&CreateSessionRequest {
                seller_account_id: seller_account_id.to_string(),
                mode,
                line_items,
                application_fee_amount: fee_amount,
                application_fee_percent: fee_percent,
                customer_email: buyer.email(),
                collect_shipping_address,
                metadata: metadata.to_map(),
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
            })
            .await?;

        tracing::info!(
            target: "bandstand::catalog",
            session_id = %session.id,
            purchase_type = %metadata.purchase_type,
            seller_account = seller_account_id,
            "Opened checkout session"
        );
        Ok(session)
    }

    /// Open a checkout session for a single track.
    pub async fn track_checkout(
        &self,
        buyer: Buyer,
        track_id: &str,
        offered_price: Option<i64>,
    ) -> Result<CheckoutSession> {
        let track = self
            .store
            .find_track(track_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "track",
                id: track_id.to_string(),
            })?;
        if !track.purchasable {
            return Err(EngineError::bad_request(format!(
                "track '{}' is not purchasable",
                track_id
            )));
        }
        let (artist, account) = self.payable_artist(&track.artist_id).await?;
        let price = Self::check_price(offered_price, track.price, track.minimum_price)?;
        let currency = self.currency_or_default(&track.currency);
        let fee = self.fees.app_fee(price, &currency, artist.fee_override_percent);
        let product_id = self
            .ensure_product(&account, &Sellable::Track(track_id.to_string()))
            .await?;

        let metadata = SessionMetadata::new(PurchaseType::Track, account.clone())
            .artist_id(artist.id.clone())
            .track_id(track_id.to_string());
        self.open_session(
            &account,
            SessionMode::Payment,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: price,
                currency,
                quantity: 1,
            }],
            Some(fee),
            None,
            false,
            &buyer,
            metadata,
        )
        .await
    }

    /// Open a checkout session for a release.
    pub async fn track_group_checkout(
        &self,
        buyer: Buyer,
        track_group_id: &str,
        offered_price: Option<i64>,
    ) -> Result<CheckoutSession> {
        let group = self
            .store
            .find_track_group(track_group_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "trackGroup",
                id: track_group_id.to_string(),
            })?;
        if !group.purchasable {
            return Err(EngineError::bad_request(format!(
                "release '{}' is not purchasable",
                track_group_id
            )));
        }
        let (artist, account) = self.payable_artist(&group.artist_id).await?;
        let price = Self::check_price(offered_price, group.price, group.minimum_price)?;
        let currency = self.currency_or_default(&group.currency);
        let fee = self.fees.app_fee(price, &currency, artist.fee_override_percent);
        let product_id = self
            .ensure_product(&account, &Sellable::TrackGroup(track_group_id.to_string()))
            .await?;

        let metadata = SessionMetadata::new(PurchaseType::TrackGroup, account.clone())
            .artist_id(artist.id.clone())
            .track_group_id(track_group_id.to_string());
        self.open_session(
            &account,
            SessionMode::Payment,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: price,
                currency,
                quantity: 1,
            }],
            Some(fee),
            None,
            false,
            &buyer,
            metadata,
        )
        .await
    }

    /// Open a checkout session for an artist's whole purchasable catalogue.
    pub async fn catalogue_checkout(&self, buyer: Buyer, artist_id: &str) -> Result<CheckoutSession> {
        let (artist, account) = self.payable_artist(artist_id).await?;
        let groups = self.store.list_purchasable_track_groups(artist_id).await?;
        if groups.is_empty() {
            return Err(EngineError::bad_request(format!(
                "artist '{}' has no purchasable releases",
                artist_id
            )));
        }

        let total: i64 = groups.iter().map(|g| g.price).sum();
        let currency = self.currency_or_default(&groups[0].currency);
        let fee = self.fees.app_fee(total, &currency, artist.fee_override_percent);
        let product_id = self
            .ensure_product_by_key(
                &account,
                &format!("artistCatalogue:{}", artist_id),
                &format!("{} - full catalogue", artist.name),
                Some(format!("All {} releases by {}", groups.len(), artist.name)),
                None,
            )
            .await?;

        let metadata = SessionMetadata::new(PurchaseType::ArtistCatalogue, account.clone())
            .artist_id(artist_id.to_string());
        self.open_session(
            &account,
            SessionMode::Payment,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: total,
                currency,
                quantity: 1,
            }],
            Some(fee),
            None,
            false,
            &buyer,
            metadata,
        )
        .await
    }

    /// Open a checkout session for merch, with a shipping address collected.
    pub async fn merch_checkout(
        &self,
        buyer: Buyer,
        merch_id: &str,
        option_ids: &[String],
        quantity: u32,
        offered_price: Option<i64>,
    ) -> Result<CheckoutSession> {
        if quantity == 0 {
            return Err(EngineError::bad_request("quantity must be at least 1"));
        }
        let merch = self
            .store
            .find_merch_item(merch_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "merch",
                id: merch_id.to_string(),
            })?;
        let (artist, account) = self.payable_artist(&merch.artist_id).await?;

        // Resolve to a variant when options were picked; check inventory on
        // whichever level carries it. The webhook side re-checks atomically.
        let (sellable, remaining) = if option_ids.is_empty() {
            (Sellable::Merch(merch_id.to_string()), merch.quantity_remaining)
        } else {
            let variant = self
                .store
                .find_merch_variant_by_options(merch_id, option_ids)
                .await?
                .ok_or_else(|| PaymentError::RecordMissing {
                    kind: "merchVariant",
                    id: variant_search_key(merch_id, option_ids),
                })?;
            (
                Sellable::MerchVariant(variant.id.clone()),
                variant.quantity_remaining,
            )
        };
        if remaining < i64::from(quantity) {
            return Err(EngineError::bad_request(format!(
                "only {} of '{}' left in stock",
                remaining, merch_id
            )));
        }

        let unit_price = Self::check_price(offered_price, merch.price, merch.minimum_price)?;
        let currency = self.currency_or_default(&merch.currency);
        let total = unit_price.saturating_mul(i64::from(quantity));
        let fee = self.fees.app_fee(total, &currency, artist.fee_override_percent);
        let product_id = self.ensure_product(&account, &sellable).await?;

        let metadata = SessionMetadata::new(PurchaseType::Merch, account.clone())
            .artist_id(artist.id.clone())
            .merch_id(merch_id.to_string());
        self.open_session(
            &account,
            SessionMode::Payment,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: unit_price,
                currency,
                quantity,
            }],
            Some(fee),
            None,
            true,
            &buyer,
            metadata,
        )
        .await
    }

    /// Open a recurring checkout session for a support tier.
    ///
    /// Subscription mode takes the platform cut as a percent of each
    /// invoice instead of a fixed amount.
    pub async fn subscription_checkout(
        &self,
        buyer: Buyer,
        tier_id: &str,
    ) -> Result<CheckoutSession> {
        let tier = self
            .store
            .find_tier(tier_id)
            .await?
            .ok_or_else(|| PaymentError::RecordMissing {
                kind: "tier",
                id: tier_id.to_string(),
            })?;
        let (artist, account) = self.payable_artist(&tier.artist_id).await?;
        let currency = self.currency_or_default(&tier.currency);
        let fee_percent = if self.settings.is_zero_fee_currency(&currency) {
            0.0
        } else {
            self.fees.effective_percent(artist.fee_override_percent)
        };
        let product_id = self
            .ensure_product(&account, &Sellable::Tier(tier_id.to_string()))
            .await?;

        let metadata = SessionMetadata::new(PurchaseType::Subscription, account.clone())
            .artist_id(artist.id.clone())
            .tier_id(tier_id.to_string());
        self.open_session(
            &account,
            SessionMode::Subscription,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: tier.price,
                currency,
                quantity: 1,
            }],
            None,
            (fee_percent > 0.0).then_some(fee_percent),
            false,
            &buyer,
            metadata,
        )
        .await
    }

    /// Open a checkout session for a one-off tip to an artist.
    pub async fn tip_checkout(
        &self,
        buyer: Buyer,
        artist_id: &str,
        amount: i64,
        currency: Option<&str>,
    ) -> Result<CheckoutSession> {
        if amount <= 0 {
            return Err(EngineError::bad_request("tip amount must be positive"));
        }
        let (artist, account) = self.payable_artist(artist_id).await?;
        let currency = self.currency_or_default(currency.unwrap_or_default());
        let fee = self.fees.app_fee(amount, &currency, artist.fee_override_percent);
        let product_id = self
            .ensure_product_by_key(
                &account,
                &format!("tip:{}", artist_id),
                &format!("Tip for {}", artist.name),
                None,
                None,
            )
            .await?;

        let metadata = SessionMetadata::new(PurchaseType::Tip, account.clone())
            .artist_id(artist_id.to_string());
        self.open_session(
            &account,
            SessionMode::Payment,
            vec![SessionLineItemSpec {
                product_id,
                unit_amount: amount,
                currency,
                quantity: 1,
            }],
            Some(fee),
            None,
            false,
            &buyer,
            metadata,
        )
        .await
    }
}
