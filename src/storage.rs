//! Storage traits for the reconciliation engine.
//!
//! The engine owns these records through a persistence boundary expressed as
//! traits; the binding contract is the invariants (purchase uniqueness,
//! ledger dedupe, subscription upsert), not column names. Conditional writes
//! are store operations so backends can implement them atomically.
//!
//! An in-memory implementation lives in [`memory`] for development and
//! testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::processor::Address;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was created.
    Created,
    /// A record with the same natural key already existed; nothing changed.
    AlreadyExists,
}

/// Status of money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// What a digital purchase grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurchaseTarget {
    Track(String),
    TrackGroup(String),
}

impl PurchaseTarget {
    /// The target entity's id.
    #[must_use]
    pub fn target_id(&self) -> &str {
        match self {
            Self::Track(id) | Self::TrackGroup(id) => id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Track(_) => "track",
            Self::TrackGroup(_) => "trackGroup",
        }
    }
}

/// Durable record of money movement, independent of what was purchased.
///
/// Immutable once `COMPLETED` or `FAILED`; pledge retries create a new
/// transaction rather than mutating an old one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: String,
    pub user_id: String,
    /// Amount in the currency's smallest unit.
    pub amount: i64,
    pub currency: String,
    pub platform_cut: i64,
    pub processor_fee: i64,
    pub status: PaymentStatus,
    /// Payment intent or session id on the processor side.
    pub processor_reference_id: String,
    pub created_at: DateTime<Utc>,
}

/// A digital purchase (track or release).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purchase {
    pub id: String,
    pub user_id: String,
    pub target: PurchaseTarget,
    pub price_paid: i64,
    pub currency_paid: String,
    pub processor_reference_id: String,
    pub platform_cut: i64,
    pub message: Option<String>,
    /// One-time token for download links in notifications.
    pub single_download_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A physical goods purchase, one per processor line item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerchPurchase {
    pub id: String,
    pub user_id: String,
    pub merch_id: String,
    pub variant_id: Option<String>,
    pub quantity: u32,
    pub price_paid: i64,
    pub currency_paid: String,
    pub processor_reference_id: String,
    pub platform_cut: i64,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub created_at: DateTime<Utc>,
}

/// A tip/gift from a listener to an artist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tip {
    pub id: String,
    pub user_id: String,
    pub artist_id: String,
    pub amount: i64,
    pub currency: String,
    pub platform_cut: i64,
    pub message: Option<String>,
    pub processor_reference_id: String,
    pub created_at: DateTime<Utc>,
}

/// Recurring support for an artist tier.
///
/// Unique per `(user_id, tier_id)`; re-subscribing after cancellation
/// un-deletes rather than duplicating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub tier_id: String,
    pub amount: i64,
    pub currency: String,
    pub platform_cut: i64,
    pub processor_subscription_id: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active means not soft-deleted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// One recurring charge (or failure) against a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionCharge {
    pub id: String,
    pub subscription_id: String,
    pub ledger_transaction_id: String,
    pub amount: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// A promise to pay for a crowdfunded release, charged later off-session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundraiserPledge {
    pub id: String,
    pub user_id: String,
    pub track_group_id: String,
    pub fundraiser_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    /// Set once a stored payment method has been resolved and charged.
    pub stored_payment_method_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FundraiserPledge {
    /// Open pledges are neither paid nor cancelled.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.paid_at.is_none() && self.cancelled_at.is_none()
    }
}

/// Filter for batch pledge charging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PledgeFilter {
    /// Every outstanding pledge.
    All,
    /// Pledges for one fundraiser.
    Fundraiser(String),
    /// Pledges for one release.
    TrackGroup(String),
}

/// A listener account, only the fields the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Catalog records
// =============================================================================

/// An artist/seller, only the fields the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub contact_email: Option<String>,
    /// The artist's connected payment-processor account.
    pub connected_account_id: Option<String>,
    /// Synced from `account.updated` events.
    pub charges_enabled: bool,
    /// Artist-level platform fee override, replaces the site default.
    pub fee_override_percent: Option<f64>,
}

impl Artist {
    /// A seller is payable when a connected account exists with charges on.
    #[must_use]
    pub fn is_payable(&self) -> bool {
        self.charges_enabled && self.connected_account_id.is_some()
    }
}

/// A single sellable track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub artist_id: String,
    pub title: String,
    pub price: i64,
    pub currency: String,
    /// Pay-what-you-want floor.
    pub minimum_price: i64,
    pub upstream_product_id: Option<String>,
    pub purchasable: bool,
}

/// A release (album/EP), possibly crowdfunded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackGroup {
    pub id: String,
    pub artist_id: String,
    pub title: String,
    pub price: i64,
    pub currency: String,
    pub minimum_price: i64,
    pub upstream_product_id: Option<String>,
    pub purchasable: bool,
    pub fundraiser_id: Option<String>,
    /// Funding goal in smallest currency unit, for pledge emails.
    pub fundraiser_goal: Option<i64>,
}

/// A recurring-support tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tier {
    pub id: String,
    pub artist_id: String,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub upstream_product_id: Option<String>,
}

/// A physical goods item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerchItem {
    pub id: String,
    pub artist_id: String,
    pub title: String,
    pub price: i64,
    pub currency: String,
    pub minimum_price: i64,
    pub upstream_product_id: Option<String>,
    /// Item-level inventory, used when the item has no option variants.
    pub quantity_remaining: i64,
    /// A digital release bundled with the merch, granted on purchase.
    pub includes_track_group_id: Option<String>,
}

/// One option combination of a merch item (e.g. size + color).
///
/// Each combination maps to its own upstream product and carries its own
/// inventory counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerchVariant {
    pub id: String,
    pub merch_id: String,
    pub option_ids: Vec<String>,
    pub upstream_product_id: Option<String>,
    pub quantity_remaining: i64,
}

/// Deterministic search key for a merch option combination.
///
/// The combination of option identifiers is the cache key: sorted so the
/// same options in any order find the same upstream product.
#[must_use]
pub fn variant_search_key(merch_id: &str, option_ids: &[String]) -> String {
    let mut ids: Vec<&str> = option_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    format!("merch:{}:{}", merch_id, ids.join("+"))
}

/// Reference to a sellable entity for upstream product caching.
///
/// Search keys are derived in the checkout layer; variants key on their
/// option combination via [`variant_search_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sellable {
    Track(String),
    TrackGroup(String),
    Tier(String),
    Merch(String),
    MerchVariant(String),
}

/// Result of resolving an upstream product id back to internal merch.
#[derive(Debug, Clone)]
pub struct MerchResolution {
    pub merch: MerchItem,
    pub variant: Option<MerchVariant>,
}

// =============================================================================
// Traits
// =============================================================================

/// Storage for the engine's durable payment records.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    // Accounts

    async fn find_user(&self, user_id: &str) -> Result<Option<UserAccount>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>>;

    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<UserAccount>;

    // Purchases

    async fn find_purchase(
        &self,
        user_id: &str,
        target: &PurchaseTarget,
    ) -> Result<Option<Purchase>>;

    /// Create a purchase unless one already exists for `(user_id, target)`.
    ///
    /// At most one non-deleted purchase per pair may exist; a duplicate is a
    /// no-op, not an error.
    async fn create_purchase_if_absent(&self, purchase: &Purchase) -> Result<WriteOutcome>;

    async fn create_merch_purchase(&self, purchase: &MerchPurchase) -> Result<()>;

    async fn create_tip(&self, tip: &Tip) -> Result<()>;

    // Ledger

    /// Record a transaction, deduplicated on
    /// `(processor_reference_id, status)` so duplicate deliveries of the
    /// same processor event yield exactly one row.
    async fn record_ledger_transaction(&self, tx: &LedgerTransaction) -> Result<WriteOutcome>;

    async fn find_ledger_transactions(
        &self,
        processor_reference_id: &str,
    ) -> Result<Vec<LedgerTransaction>>;

    /// Move any `PENDING` transactions for the reference to `status`.
    ///
    /// Returns whether a row changed. Used when an off-session charge
    /// settles asynchronously.
    async fn mark_ledger_status(
        &self,
        processor_reference_id: &str,
        status: PaymentStatus,
    ) -> Result<bool>;

    // Subscriptions

    /// Insert-or-update keyed by `(user_id, tier_id)` as one atomic
    /// conditional write. Clears `deleted_at` on re-subscribe and preserves
    /// the existing row's id. Returns the stored row.
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<Subscription>;

    async fn find_subscription(
        &self,
        user_id: &str,
        tier_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn find_subscription_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Soft-delete. Returns whether an active row was found.
    async fn cancel_subscription(
        &self,
        user_id: &str,
        tier_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn create_subscription_charge(&self, charge: &SubscriptionCharge) -> Result<()>;

    // Pledges

    async fn create_pledge(&self, pledge: &FundraiserPledge) -> Result<()>;

    async fn find_pledge(&self, pledge_id: &str) -> Result<Option<FundraiserPledge>>;

    /// Pledges with `paid_at = null, cancelled_at = null` matching the filter.
    async fn list_open_pledges(&self, filter: &PledgeFilter) -> Result<Vec<FundraiserPledge>>;

    /// Mark a pledge charged. Returns whether the pledge was still open.
    async fn mark_pledge_paid(
        &self,
        pledge_id: &str,
        paid_at: DateTime<Utc>,
        payment_method_ref: Option<&str>,
    ) -> Result<bool>;

    /// Cancel a pledge. Only open pledges can be cancelled; returns whether
    /// the state changed.
    async fn cancel_pledge(&self, pledge_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Reopen a charged pledge whose payment later failed, so the next
    /// charging run retries it. Cancelled pledges stay cancelled.
    async fn reopen_pledge(&self, pledge_id: &str) -> Result<bool>;

    // Webhook idempotency

    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;
}

/// Read/write access to the sellable catalog the engine reconciles against.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_artist(&self, artist_id: &str) -> Result<Option<Artist>>;

    /// Sync the payable flag from an `account.updated` event.
    ///
    /// Keyed by connected account id; returns whether an artist matched.
    async fn set_charges_enabled(
        &self,
        connected_account_id: &str,
        enabled: bool,
    ) -> Result<bool>;

    async fn find_track(&self, track_id: &str) -> Result<Option<Track>>;

    async fn find_track_group(&self, track_group_id: &str) -> Result<Option<TrackGroup>>;

    async fn find_tier(&self, tier_id: &str) -> Result<Option<Tier>>;

    async fn find_merch_item(&self, merch_id: &str) -> Result<Option<MerchItem>>;

    async fn find_merch_variant(&self, variant_id: &str) -> Result<Option<MerchVariant>>;

    /// Find the variant for an exact option combination.
    async fn find_merch_variant_by_options(
        &self,
        merch_id: &str,
        option_ids: &[String],
    ) -> Result<Option<MerchVariant>>;

    /// Currently purchasable releases by an artist, for catalogue fan-out.
    async fn list_purchasable_track_groups(&self, artist_id: &str) -> Result<Vec<TrackGroup>>;

    /// Resolve an upstream product id back to a merch item or variant.
    async fn resolve_upstream_product(&self, product_id: &str)
        -> Result<Option<MerchResolution>>;

    /// Cache the upstream product reference on the entity.
    async fn set_upstream_product(&self, sellable: &Sellable, product_id: &str) -> Result<()>;

    /// Atomically decrement inventory with a floor check.
    ///
    /// Decrements the variant counter when `variant_id` is set, otherwise
    /// the item-level counter. Returns `false` (and changes nothing) when
    /// fewer than `quantity` units remain.
    async fn decrement_inventory(
        &self,
        merch_id: &str,
        variant_id: Option<&str>,
        quantity: u32,
    ) -> Result<bool>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory implementation of both store traits.
#[cfg(any(test, feature = "test-payments"))]
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// In-memory engine store for development and testing.
    ///
    /// Wraps data in `Arc` for cheap cloning; every conditional write holds
    /// the relevant write lock for the whole check-then-write, so the
    /// uniqueness invariants hold under concurrent use.
    #[derive(Default, Clone)]
    pub struct InMemoryEngineStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        users: RwLock<HashMap<String, UserAccount>>,
        purchases: RwLock<HashMap<String, Purchase>>,
        merch_purchases: RwLock<Vec<MerchPurchase>>,
        tips: RwLock<Vec<Tip>>,
        ledger: RwLock<LedgerState>,
        subscriptions: RwLock<HashMap<String, Subscription>>,
        subscription_charges: RwLock<Vec<SubscriptionCharge>>,
        pledges: RwLock<HashMap<String, FundraiserPledge>>,
        processed_events: RwLock<HashSet<String>>,
        artists: RwLock<HashMap<String, Artist>>,
        tracks: RwLock<HashMap<String, Track>>,
        track_groups: RwLock<HashMap<String, TrackGroup>>,
        tiers: RwLock<HashMap<String, Tier>>,
        merch_items: RwLock<HashMap<String, MerchItem>>,
        merch_variants: RwLock<HashMap<String, MerchVariant>>,
    }

    #[derive(Default)]
    struct LedgerState {
        rows: Vec<LedgerTransaction>,
        dedupe_keys: HashSet<String>,
    }

    fn purchase_key(user_id: &str, target: &PurchaseTarget) -> String {
        format!("{}|{}|{}", user_id, target.kind(), target.target_id())
    }

    fn ledger_key(reference: &str, status: PaymentStatus) -> String {
        format!("{}|{}", reference, status.as_str())
    }

    fn subscription_key(user_id: &str, tier_id: &str) -> String {
        format!("{}|{}", user_id, tier_id)
    }

    impl InMemoryEngineStore {
        /// Create a new empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        // Seeding helpers

        pub fn insert_user(&self, user: UserAccount) {
            self.inner.users.write().unwrap().insert(user.id.clone(), user);
        }

        pub fn insert_artist(&self, artist: Artist) {
            self.inner.artists.write().unwrap().insert(artist.id.clone(), artist);
        }

        pub fn insert_track(&self, track: Track) {
            self.inner.tracks.write().unwrap().insert(track.id.clone(), track);
        }

        pub fn insert_track_group(&self, track_group: TrackGroup) {
            self.inner
                .track_groups
                .write()
                .unwrap()
                .insert(track_group.id.clone(), track_group);
        }

        pub fn insert_tier(&self, tier: Tier) {
            self.inner.tiers.write().unwrap().insert(tier.id.clone(), tier);
        }

        pub fn insert_merch_item(&self, item: MerchItem) {
            self.inner
                .merch_items
                .write()
                .unwrap()
                .insert(item.id.clone(), item);
        }

        pub fn insert_merch_variant(&self, variant: MerchVariant) {
            self.inner
                .merch_variants
                .write()
                .unwrap()
                .insert(variant.id.clone(), variant);
        }

        // Inspection helpers

        pub fn all_purchases(&self) -> Vec<Purchase> {
            self.inner.purchases.read().unwrap().values().cloned().collect()
        }

        pub fn all_merch_purchases(&self) -> Vec<MerchPurchase> {
            self.inner.merch_purchases.read().unwrap().clone()
        }

        pub fn all_tips(&self) -> Vec<Tip> {
            self.inner.tips.read().unwrap().clone()
        }

        pub fn all_ledger_transactions(&self) -> Vec<LedgerTransaction> {
            self.inner.ledger.read().unwrap().rows.clone()
        }

        pub fn all_subscriptions(&self) -> Vec<Subscription> {
            self.inner.subscriptions.read().unwrap().values().cloned().collect()
        }

        pub fn all_subscription_charges(&self) -> Vec<SubscriptionCharge> {
            self.inner.subscription_charges.read().unwrap().clone()
        }

        pub fn all_users(&self) -> Vec<UserAccount> {
            self.inner.users.read().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl PaymentStore for InMemoryEngineStore {
        async fn find_user(&self, user_id: &str) -> Result<Option<UserAccount>> {
            Ok(self.inner.users.read().unwrap().get(user_id).cloned())
        }

        async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>> {
            Ok(self
                .inner
                .users
                .read()
                .unwrap()
                .values()
                .find(|u| u.email.eq_ignore_ascii_case(email))
                .cloned())
        }

        async fn create_user(&self, email: &str, name: Option<&str>) -> Result<UserAccount> {
            let user = UserAccount {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.to_string(),
                name: name.map(String::from),
                created_at: Utc::now(),
            };
            self.inner
                .users
                .write()
                .unwrap()
                .insert(user.id.clone(), user.clone());
            Ok(user)
        }

        async fn find_purchase(
            &self,
            user_id: &str,
            target: &PurchaseTarget,
        ) -> Result<Option<Purchase>> {
            Ok(self
                .inner
                .purchases
                .read()
                .unwrap()
                .get(&purchase_key(user_id, target))
                .cloned())
        }

        async fn create_purchase_if_absent(&self, purchase: &Purchase) -> Result<WriteOutcome> {
            let key = purchase_key(&purchase.user_id, &purchase.target);
            let mut purchases = self.inner.purchases.write().unwrap();
            if purchases.contains_key(&key) {
                return Ok(WriteOutcome::AlreadyExists);
            }
            purchases.insert(key, purchase.clone());
            Ok(WriteOutcome::Created)
        }

        async fn create_merch_purchase(&self, purchase: &MerchPurchase) -> Result<()> {
            self.inner
                .merch_purchases
                .write()
                .unwrap()
                .push(purchase.clone());
            Ok(())
        }

        async fn create_tip(&self, tip: &Tip) -> Result<()> {
            self.inner.tips.write().unwrap().push(tip.clone());
            Ok(())
        }

        async fn record_ledger_transaction(
            &self,
            tx: &LedgerTransaction,
        ) -> Result<WriteOutcome> {
            let key = ledger_key(&tx.processor_reference_id, tx.status);
            let mut ledger = self.inner.ledger.write().unwrap();
            if ledger.dedupe_keys.contains(&key) {
                return Ok(WriteOutcome::AlreadyExists);
            }
            ledger.dedupe_keys.insert(key);
            ledger.rows.push(tx.clone());
            Ok(WriteOutcome::Created)
        }

        async fn find_ledger_transactions(
            &self,
            processor_reference_id: &str,
        ) -> Result<Vec<LedgerTransaction>> {
            Ok(self
                .inner
                .ledger
                .read()
                .unwrap()
                .rows
                .iter()
                .filter(|t| t.processor_reference_id == processor_reference_id)
                .cloned()
                .collect())
        }

        async fn mark_ledger_status(
            &self,
            processor_reference_id: &str,
            status: PaymentStatus,
        ) -> Result<bool> {
            let mut ledger = self.inner.ledger.write().unwrap();
            let mut changed = false;
            for row in ledger.rows.iter_mut() {
                if row.processor_reference_id == processor_reference_id
                    && row.status == PaymentStatus::Pending
                {
                    row.status = status;
                    changed = true;
                }
            }
            if changed {
                let key = ledger_key(processor_reference_id, status);
                ledger.dedupe_keys.insert(key);
            }
            Ok(changed)
        }

        async fn upsert_subscription(&self, subscription: &Subscription) -> Result<Subscription> {
            let key = subscription_key(&subscription.user_id, &subscription.tier_id);
            let mut subs = self.inner.subscriptions.write().unwrap();
            let stored = match subs.get(&key) {
                Some(existing) => Subscription {
                    id: existing.id.clone(),
                    created_at: existing.created_at,
                    deleted_at: None,
                    updated_at: Utc::now(),
                    ..subscription.clone()
                },
                None => Subscription {
                    deleted_at: None,
                    ..subscription.clone()
                },
            };
            subs.insert(key, stored.clone());
            Ok(stored)
        }

        async fn find_subscription(
            &self,
            user_id: &str,
            tier_id: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .get(&subscription_key(user_id, tier_id))
                .cloned())
        }

        async fn find_subscription_by_processor_id(
            &self,
            processor_subscription_id: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .find(|s| s.processor_subscription_id == processor_subscription_id)
                .cloned())
        }

        async fn cancel_subscription(
            &self,
            user_id: &str,
            tier_id: &str,
            at: DateTime<Utc>,
        ) -> Result<bool> {
            let mut subs = self.inner.subscriptions.write().unwrap();
            match subs.get_mut(&subscription_key(user_id, tier_id)) {
                Some(sub) if sub.deleted_at.is_none() => {
                    sub.deleted_at = Some(at);
                    sub.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn create_subscription_charge(&self, charge: &SubscriptionCharge) -> Result<()> {
            self.inner
                .subscription_charges
                .write()
                .unwrap()
                .push(charge.clone());
            Ok(())
        }

        async fn create_pledge(&self, pledge: &FundraiserPledge) -> Result<()> {
            self.inner
                .pledges
                .write()
                .unwrap()
                .insert(pledge.id.clone(), pledge.clone());
            Ok(())
        }

        async fn find_pledge(&self, pledge_id: &str) -> Result<Option<FundraiserPledge>> {
            Ok(self.inner.pledges.read().unwrap().get(pledge_id).cloned())
        }

        async fn list_open_pledges(
            &self,
            filter: &PledgeFilter,
        ) -> Result<Vec<FundraiserPledge>> {
            let pledges = self.inner.pledges.read().unwrap();
            Ok(pledges
                .values()
                .filter(|p| p.is_open())
                .filter(|p| match filter {
                    PledgeFilter::All => true,
                    PledgeFilter::Fundraiser(id) => p.fundraiser_id.as_deref() == Some(id),
                    PledgeFilter::TrackGroup(id) => p.track_group_id == *id,
                })
                .cloned()
                .collect())
        }

        async fn mark_pledge_paid(
            &self,
            pledge_id: &str,
            paid_at: DateTime<Utc>,
            payment_method_ref: Option<&str>,
        ) -> Result<bool> {
            let mut pledges = self.inner.pledges.write().unwrap();
            match pledges.get_mut(pledge_id) {
                Some(pledge) if pledge.is_open() => {
                    pledge.paid_at = Some(paid_at);
                    if let Some(method) = payment_method_ref {
                        pledge.stored_payment_method_ref = Some(method.to_string());
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn cancel_pledge(&self, pledge_id: &str, at: DateTime<Utc>) -> Result<bool> {
            let mut pledges = self.inner.pledges.write().unwrap();
            match pledges.get_mut(pledge_id) {
                Some(pledge) if pledge.is_open() => {
                    pledge.cancelled_at = Some(at);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn reopen_pledge(&self, pledge_id: &str) -> Result<bool> {
            let mut pledges = self.inner.pledges.write().unwrap();
            match pledges.get_mut(pledge_id) {
                Some(pledge) if pledge.paid_at.is_some() && pledge.cancelled_at.is_none() => {
                    pledge.paid_at = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl CatalogStore for InMemoryEngineStore {
        async fn find_artist(&self, artist_id: &str) -> Result<Option<Artist>> {
            Ok(self.inner.artists.read().unwrap().get(artist_id).cloned())
        }

        async fn set_charges_enabled(
            &self,
            connected_account_id: &str,
            enabled: bool,
        ) -> Result<bool> {
            let mut artists = self.inner.artists.write().unwrap();
            let mut matched = false;
            for artist in artists.values_mut() {
                if artist.connected_account_id.as_deref() == Some(connected_account_id) {
                    artist.charges_enabled = enabled;
                    matched = true;
                }
            }
            Ok(matched)
        }

        async fn find_track(&self, track_id: &str) -> Result<Option<Track>> {
            Ok(self.inner.tracks.read().unwrap().get(track_id).cloned())
        }

        async fn find_track_group(&self, track_group_id: &str) -> Result<Option<TrackGroup>> {
            Ok(self
                .inner
                .track_groups
                .read()
                .unwrap()
                .get(track_group_id)
                .cloned())
        }

        async fn find_tier(&self, tier_id: &str) -> Result<Option<Tier>> {
            Ok(self.inner.tiers.read().unwrap().get(tier_id).cloned())
        }

        async fn find_merch_item(&self, merch_id: &str) -> Result<Option<MerchItem>> {
            Ok(self.inner.merch_items.read().unwrap().get(merch_id).cloned())
        }

        async fn find_merch_variant(&self, variant_id: &str) -> Result<Option<MerchVariant>> {
            Ok(self
                .inner
                .merch_variants
                .read()
                .unwrap()
                .get(variant_id)
                .cloned())
        }

        async fn find_merch_variant_by_options(
            &self,
            merch_id: &str,
            option_ids: &[String],
        ) -> Result<Option<MerchVariant>> {
            let wanted = variant_search_key(merch_id, option_ids);
            Ok(self
                .inner
                .merch_variants
                .read()
                .unwrap()
                .values()
                .find(|v| v.merch_id == merch_id && variant_search_key(merch_id, &v.option_ids) == wanted)
                .cloned())
        }

        async fn list_purchasable_track_groups(
            &self,
            artist_id: &str,
        ) -> Result<Vec<TrackGroup>> {
            let mut groups: Vec<TrackGroup> = self
                .inner
                .track_groups
                .read()
                .unwrap()
                .values()
                .filter(|tg| tg.artist_id == artist_id && tg.purchasable)
                .cloned()
                .collect();
            groups.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(groups)
        }

        async fn resolve_upstream_product(
            &self,
            product_id: &str,
        ) -> Result<Option<MerchResolution>> {
            // Variants first: an option combination is more specific than
            // the base item.
            let variant = self
                .inner
                .merch_variants
                .read()
                .unwrap()
                .values()
                .find(|v| v.upstream_product_id.as_deref() == Some(product_id))
                .cloned();

            if let Some(variant) = variant {
                let merch = self
                    .inner
                    .merch_items
                    .read()
                    .unwrap()
                    .get(&variant.merch_id)
                    .cloned();
                return Ok(merch.map(|merch| MerchResolution {
                    merch,
                    variant: Some(variant),
                }));
            }

            let merch = self
                .inner
                .merch_items
                .read()
                .unwrap()
                .values()
                .find(|m| m.upstream_product_id.as_deref() == Some(product_id))
                .cloned();
            Ok(merch.map(|merch| MerchResolution {
                merch,
                variant: None,
            }))
        }

        async fn set_upstream_product(
            &self,
            sellable: &Sellable,
            product_id: &str,
        ) -> Result<()> {
            match sellable {
                Sellable::Track(id) => {
                    if let Some(track) = self.inner.tracks.write().unwrap().get_mut(id) {
                        track.upstream_product_id = Some(product_id.to_string());
                    }
                }
                Sellable::TrackGroup(id) => {
                    if let Some(tg) = self.inner.track_groups.write().unwrap().get_mut(id) {
                        tg.upstream_product_id = Some(product_id.to_string());
                    }
                }
                Sellable::Tier(id) => {
                    if let Some(tier) = self.inner.tiers.write().unwrap().get_mut(id) {
                        tier.upstream_product_id = Some(product_id.to_string());
                    }
                }
                Sellable::Merch(id) => {
                    if let Some(item) = self.inner.merch_items.write().unwrap().get_mut(id) {
                        item.upstream_product_id = Some(product_id.to_string());
                    }
                }
                Sellable::MerchVariant(id) => {
                    if let Some(variant) = self.inner.merch_variants.write().unwrap().get_mut(id) {
                        variant.upstream_product_id = Some(product_id.to_string());
                    }
                }
            }
            Ok(())
        }

        async fn decrement_inventory(
            &self,
            merch_id: &str,
            variant_id: Option<&str>,
            quantity: u32,
        ) -> Result<bool> {
            let quantity = i64::from(quantity);
            match variant_id {
                Some(variant_id) => {
                    let mut variants = self.inner.merch_variants.write().unwrap();
                    match variants.get_mut(variant_id) {
                        Some(variant) if variant.quantity_remaining >= quantity => {
                            variant.quantity_remaining -= quantity;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                }
                None => {
                    let mut items = self.inner.merch_items.write().unwrap();
                    match items.get_mut(merch_id) {
                        Some(item) if item.quantity_remaining >= quantity => {
                            item.quantity_remaining -= quantity;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                }
            }
        }
    }
}
