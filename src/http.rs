//! Inbound HTTP boundary.
//!
//! Two surfaces: webhook ingestion (raw body plus signature header, verified
//! before parsing) and checkout-session creation for the storefront. Webhook
//! endpoints return 200 for both processed and ignored events so the
//! processor stops redelivering; transient failures surface as 5xx to force
//! a retry.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, post},
};
use serde::{Deserialize, Serialize};

use crate::catalog::{Buyer, CheckoutManager, CheckoutUrls};
use crate::config::SiteSettings;
use crate::error::{EngineError, Result};
use crate::notify::NotificationDispatcher;
use crate::pledges::{PledgeChargeReport, PledgeCharger};
use crate::processor::{CheckoutSession, ProcessorClient};
use crate::storage::{CatalogStore, PaymentStore, PledgeFilter};
use crate::subscriptions::SubscriptionLifecycle;
use crate::webhook::{WebhookHandler, WebhookOutcome};

/// Header carrying the webhook payload signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Shared state for the payment routes.
pub struct PaymentContext<S, P, N> {
    checkout: Arc<CheckoutManager<S, P>>,
    subscriptions: Arc<SubscriptionLifecycle<S, P, N>>,
    pledges: Arc<PledgeCharger<S, P, N>>,
    webhooks: Arc<WebhookHandler<S, P, N>>,
}

// Derived Clone would bound S, P, and N; the Arc fields clone regardless.
impl<S, P, N> Clone for PaymentContext<S, P, N> {
    fn clone(&self) -> Self {
        Self {
            checkout: Arc::clone(&self.checkout),
            subscriptions: Arc::clone(&self.subscriptions),
            pledges: Arc::clone(&self.pledges),
            webhooks: Arc::clone(&self.webhooks),
        }
    }
}

impl<S, P, N> PaymentContext<S, P, N>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    pub fn new(
        store: S,
        processor: P,
        notifier: N,
        settings: SiteSettings,
        urls: CheckoutUrls,
    ) -> Self {
        Self {
            checkout: Arc::new(CheckoutManager::new(
                store.clone(),
                processor.clone(),
                settings.clone(),
                urls,
            )),
            subscriptions: Arc::new(SubscriptionLifecycle::new(
                store.clone(),
                processor.clone(),
                notifier.clone(),
                settings.clone(),
            )),
            pledges: Arc::new(PledgeCharger::new(
                store.clone(),
                processor.clone(),
                notifier.clone(),
                settings.clone(),
            )),
            webhooks: Arc::new(WebhookHandler::new(store, processor, notifier, settings)),
        }
    }
}

/// Build the payment router with state applied.
pub fn router<S, P, N>(context: PaymentContext<S, P, N>) -> Router
where
    S: PaymentStore + CatalogStore + Clone + 'static,
    P: ProcessorClient + Clone + 'static,
    N: NotificationDispatcher + Clone + 'static,
{
    Router::new()
        .route("/webhooks/payments", post(platform_webhook))
        .route("/webhooks/payments/{account_id}", post(account_webhook))
        .route("/checkout/track", post(track_checkout))
        .route("/checkout/track-group", post(track_group_checkout))
        .route("/checkout/catalogue", post(catalogue_checkout))
        .route("/checkout/merch", post(merch_checkout))
        .route("/checkout/subscription", post(subscription_checkout))
        .route("/checkout/tip", post(tip_checkout))
        .route(
            "/subscriptions/{user_id}/{tier_id}",
            delete(cancel_subscription),
        )
        .route("/pledges", post(create_pledge))
        .route("/pledges/{pledge_id}", delete(cancel_pledge))
        .route("/pledges/charge", post(charge_pledges))
        .with_state(context)
}

// Webhook ingestion

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    outcome: &'static str,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome: match outcome {
                WebhookOutcome::Processed => "processed",
                WebhookOutcome::Ignored => "ignored",
                WebhookOutcome::AlreadyProcessed => "already_processed",
            },
        }
    }
}

async fn platform_webhook<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    ingest_webhook(&context, None, &headers, &body).await
}

/// Connected-account event stream.
///
/// Deliveries on this endpoint may omit the account field in the payload, so
/// the path segment fills it in when absent.
async fn account_webhook<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    ingest_webhook(&context, Some(account_id), &headers, &body).await
}

async fn ingest_webhook<S, P, N>(
    context: &PaymentContext<S, P, N>,
    account_id: Option<String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<WebhookAck>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let mut event = context.webhooks.verify_and_parse(body, signature)?;
    if event.account.is_none() {
        event.account = account_id;
    }
    let outcome = context.webhooks.handle_event(event).await?;
    Ok(Json(outcome.into()))
}

// Checkout-session creation

/// Buyer identification carried on every checkout request.
///
/// Either an account id or a bare email (guest checkout).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuyerRequest {
    user_id: Option<String>,
    email: Option<String>,
}

impl BuyerRequest {
    fn into_buyer(self) -> Result<Buyer> {
        match (self.user_id, self.email) {
            (Some(id), _) => Ok(Buyer::User { id }),
            (None, Some(email)) => Ok(Buyer::Email(email)),
            (None, None) => Err(EngineError::bad_request(
                "request needs a userId or an email",
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
    /// Hosted payment page to redirect the buyer to.
    url: Option<String>,
}

impl From<CheckoutSession> for SessionResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            session_id: session.id,
            url: session.url,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    track_id: String,
    /// Name-your-price offer in minor units.
    price: Option<i64>,
}

async fn track_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<TrackCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .track_checkout(request.buyer.into_buyer()?, &request.track_id, request.price)
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackGroupCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    track_group_id: String,
    price: Option<i64>,
}

async fn track_group_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<TrackGroupCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .track_group_checkout(
            request.buyer.into_buyer()?,
            &request.track_group_id,
            request.price,
        )
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogueCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    artist_id: String,
}

async fn catalogue_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<CatalogueCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .catalogue_checkout(request.buyer.into_buyer()?, &request.artist_id)
        .await?;
    Ok(Json(session.into()))
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MerchCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    merch_id: String,
    /// Selected option ids (size, colour), order-insensitive.
    #[serde(default)]
    option_ids: Vec<String>,
    #[serde(default = "default_quantity")]
    quantity: u32,
    price: Option<i64>,
}

async fn merch_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<MerchCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .merch_checkout(
            request.buyer.into_buyer()?,
            &request.merch_id,
            &request.option_ids,
            request.quantity,
            request.price,
        )
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    tier_id: String,
}

async fn subscription_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<SubscriptionCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .subscription_checkout(request.buyer.into_buyer()?, &request.tier_id)
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TipCheckoutRequest {
    #[serde(flatten)]
    buyer: BuyerRequest,
    artist_id: String,
    /// Tip amount in minor units.
    amount: i64,
    currency: Option<String>,
}

async fn tip_checkout<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<TipCheckoutRequest>,
) -> Result<Json<SessionResponse>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let session = context
        .checkout
        .tip_checkout(
            request.buyer.into_buyer()?,
            &request.artist_id,
            request.amount,
            request.currency.as_deref(),
        )
        .await?;
    Ok(Json(session.into()))
}

// Subscription and pledge management

async fn cancel_subscription<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Path((user_id, tier_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    context.subscriptions.cancel(&user_id, &tier_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePledgeRequest {
    user_id: String,
    track_group_id: String,
    /// Pledged amount in minor units.
    amount: i64,
}

async fn create_pledge<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<CreatePledgeRequest>,
) -> Result<Json<serde_json::Value>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let pledge = context
        .pledges
        .create_pledge(&request.user_id, &request.track_group_id, request.amount)
        .await?;
    Ok(Json(serde_json::json!({
        "pledgeId": pledge.id,
        "amount": pledge.amount,
        "currency": pledge.currency,
    })))
}

async fn cancel_pledge<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Path(pledge_id): Path<String>,
) -> Result<Json<serde_json::Value>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    context.pledges.cancel_pledge(&pledge_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

/// Scope for a pledge-charging run.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargePledgesRequest {
    fundraiser_id: Option<String>,
    track_group_id: Option<String>,
}

impl ChargePledgesRequest {
    fn into_filter(self) -> Result<PledgeFilter> {
        match (self.fundraiser_id, self.track_group_id) {
            (Some(_), Some(_)) => Err(EngineError::bad_request(
                "scope the run by fundraiserId or trackGroupId, not both",
            )),
            (Some(id), None) => Ok(PledgeFilter::Fundraiser(id)),
            (None, Some(id)) => Ok(PledgeFilter::TrackGroup(id)),
            (None, None) => Ok(PledgeFilter::All),
        }
    }
}

/// Trigger a pledge-charging run.
///
/// Wired to the scheduler in production; also callable by operators to
/// re-run a fundraiser after fixing seller configuration.
async fn charge_pledges<S, P, N>(
    State(context): State<PaymentContext<S, P, N>>,
    Json(request): Json<ChargePledgesRequest>,
) -> Result<Json<PledgeChargeReport>>
where
    S: PaymentStore + CatalogStore + Clone,
    P: ProcessorClient + Clone,
    N: NotificationDispatcher + Clone,
{
    let filter = request.into_filter()?;
    let report = context.pledges.charge_open_pledges(&filter).await?;
    Ok(Json(report))
}
