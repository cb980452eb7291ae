//! Views over processor API objects.
//!
//! These are the engine's own types, holding only the fields reconciliation
//! reads. The live client maps the processor's wire format into them; the
//! rest of the crate never sees raw API payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A postal address from checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// A product on the processor side, cached per sellable entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProduct {
    pub id: String,
    pub name: String,
}

/// Request to create a product on a seller's connected account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateProductRequest {
    pub name: String,
    pub description: Option<String>,
    /// Deterministic key stored in product metadata so later checkouts find
    /// the same product instead of creating duplicates.
    pub search_key: String,
}

/// Checkout session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One-time payment.
    Payment,
    /// Recurring subscription.
    Subscription,
}

impl SessionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Subscription => "subscription",
        }
    }
}

/// One line item in a session being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLineItemSpec {
    pub product_id: String,
    /// Unit price in the currency's smallest unit.
    pub unit_amount: i64,
    pub currency: String,
    pub quantity: u32,
}

/// Request to open a checkout session on a seller's connected account.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    pub seller_account_id: String,
    pub mode: SessionMode,
    pub line_items: Vec<SessionLineItemSpec>,
    /// Platform cut in the smallest unit. Payment mode only.
    pub application_fee_amount: Option<i64>,
    /// Platform cut as a percent of each invoice. Subscription mode only.
    pub application_fee_percent: Option<f64>,
    pub customer_email: Option<String>,
    /// Collect a shipping address from the buyer (merch).
    pub collect_shipping_address: bool,
    /// Reconciliation metadata; the webhook handler reads this back.
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// A newly created checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    /// Hosted payment page the buyer is redirected to.
    pub url: Option<String>,
}

/// One purchased line item on a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLineItem {
    pub product_id: String,
    pub quantity: u32,
    /// Line total in the smallest unit.
    pub amount_total: i64,
    pub currency: String,
}

/// A completed checkout session as fetched from the processor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDetails {
    pub id: String,
    pub customer_email: Option<String>,
    pub amount_total: i64,
    pub currency: String,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    /// Populated only when the session was fetched with line items expanded.
    pub line_items: Vec<SessionLineItem>,
}

/// Settlement state of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentIntentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    Failed,
}

impl PaymentIntentStatus {
    /// Parse from the processor's status string. Anything that is not a
    /// terminal success or an in-flight state counts as failed.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => Self::Succeeded,
            "processing" => Self::Processing,
            "requires_action" | "requires_confirmation" => Self::RequiresAction,
            _ => Self::Failed,
        }
    }
}

/// A payment intent as fetched from the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentDetails {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentIntentStatus,
    /// The platform cut actually taken, in the smallest unit.
    pub application_fee_amount: Option<i64>,
    /// The processor's own fee, when the charge is expanded far enough to
    /// know it.
    pub processor_fee: Option<i64>,
    /// Present when the intent needs buyer action to complete.
    pub client_secret: Option<String>,
}

/// A reusable payment method stored against a processor customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaymentMethod {
    pub id: String,
    pub customer_id: String,
}

/// Request for an off-session charge against a stored payment method.
#[derive(Debug, Clone, PartialEq)]
pub struct OffSessionChargeRequest {
    pub seller_account_id: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount: i64,
    pub currency: String,
    pub application_fee_amount: i64,
    pub metadata: HashMap<String, String>,
}
