//! The processor client trait.

use async_trait::async_trait;

use crate::error::PaymentError;

use super::types::{
    CheckoutSession, CreateProductRequest, CreateSessionRequest, OffSessionChargeRequest,
    PaymentIntentDetails, SessionDetails, StoredPaymentMethod, UpstreamProduct,
};

/// Result type for processor operations.
///
/// Kept as [`PaymentError`] rather than the HTTP-level error so callers can
/// classify failures (`is_retryable`) before deciding how to acknowledge a
/// webhook.
pub type ProcessorResult<T> = std::result::Result<T, PaymentError>;

/// Client for the payment processor's API.
///
/// All operations that touch a seller's data take the seller's connected
/// account id; the engine acts on the seller's behalf.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Find a product on the seller's account by its search key, if one was
    /// created before.
    async fn find_product(
        &self,
        seller_account_id: &str,
        search_key: &str,
    ) -> ProcessorResult<Option<UpstreamProduct>>;

    /// Create a product on the seller's account.
    async fn create_product(
        &self,
        seller_account_id: &str,
        request: &CreateProductRequest,
    ) -> ProcessorResult<UpstreamProduct>;

    /// Open a checkout session on the seller's account.
    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> ProcessorResult<CheckoutSession>;

    /// Fetch a session, optionally with its line items expanded.
    async fn get_session(
        &self,
        seller_account_id: &str,
        session_id: &str,
        expand_line_items: bool,
    ) -> ProcessorResult<SessionDetails>;

    /// Fetch a payment intent with its fee breakdown.
    async fn get_payment_intent(
        &self,
        seller_account_id: &str,
        payment_intent_id: &str,
    ) -> ProcessorResult<PaymentIntentDetails>;

    /// Look up a stored payment method for a buyer on the seller's account.
    ///
    /// Returns `None` when the buyer has no reusable payment method there.
    async fn find_stored_payment_method(
        &self,
        seller_account_id: &str,
        customer_email: &str,
    ) -> ProcessorResult<Option<StoredPaymentMethod>>;

    /// Charge a stored payment method without the buyer present.
    ///
    /// The returned intent may be `Processing`; settlement arrives later via
    /// webhook.
    async fn create_off_session_charge(
        &self,
        request: &OffSessionChargeRequest,
    ) -> ProcessorResult<PaymentIntentDetails>;
}
