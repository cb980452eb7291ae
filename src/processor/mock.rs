//! Scriptable processor mock for development and testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::PaymentError;

use super::client::{ProcessorClient, ProcessorResult};
use super::types::{
    CheckoutSession, CreateProductRequest, CreateSessionRequest, OffSessionChargeRequest,
    PaymentIntentDetails, PaymentIntentStatus, SessionDetails, StoredPaymentMethod,
    UpstreamProduct,
};

/// In-memory [`ProcessorClient`] that records calls and serves seeded data.
///
/// Cheap to clone; clones share state so a test can seed through one handle
/// and assert through another.
#[derive(Default, Clone)]
pub struct MockProcessorClient {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    products: HashMap<String, UpstreamProduct>,
    sessions: HashMap<String, SessionDetails>,
    payment_intents: HashMap<String, PaymentIntentDetails>,
    stored_methods: HashMap<String, StoredPaymentMethod>,
    created_products: Vec<CreateProductRequest>,
    created_sessions: Vec<CreateSessionRequest>,
    off_session_charges: Vec<OffSessionChargeRequest>,
    scripted_charge_errors: VecDeque<PaymentError>,
    counter: u64,
}

fn product_key(account: &str, search_key: &str) -> String {
    format!("{}|{}", account, search_key)
}

fn method_key(account: &str, email: &str) -> String {
    format!("{}|{}", account, email.to_lowercase())
}

impl MockProcessorClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding

    pub fn insert_product(&self, account: &str, search_key: &str, product: UpstreamProduct) {
        self.inner
            .lock()
            .unwrap()
            .products
            .insert(product_key(account, search_key), product);
    }

    pub fn insert_session(&self, session: SessionDetails) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session);
    }

    pub fn insert_payment_intent(&self, intent: PaymentIntentDetails) {
        self.inner
            .lock()
            .unwrap()
            .payment_intents
            .insert(intent.id.clone(), intent);
    }

    pub fn insert_stored_payment_method(
        &self,
        account: &str,
        email: &str,
        method: StoredPaymentMethod,
    ) {
        self.inner
            .lock()
            .unwrap()
            .stored_methods
            .insert(method_key(account, email), method);
    }

    /// Make the next off-session charge fail with the given error. Scripted
    /// failures are consumed in order.
    pub fn script_charge_failure(&self, error: PaymentError) {
        self.inner
            .lock()
            .unwrap()
            .scripted_charge_errors
            .push_back(error);
    }

    // Inspection

    pub fn created_products(&self) -> Vec<CreateProductRequest> {
        self.inner.lock().unwrap().created_products.clone()
    }

    pub fn created_sessions(&self) -> Vec<CreateSessionRequest> {
        self.inner.lock().unwrap().created_sessions.clone()
    }

    pub fn off_session_charges(&self) -> Vec<OffSessionChargeRequest> {
        self.inner.lock().unwrap().off_session_charges.clone()
    }
}

#[async_trait]
impl ProcessorClient for MockProcessorClient {
    async fn find_product(
        &self,
        seller_account_id: &str,
        search_key: &str,
    ) -> ProcessorResult<Option<UpstreamProduct>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .products
            .get(&product_key(seller_account_id, search_key))
            .cloned())
    }

    async fn create_product(
        &self,
        seller_account_id: &str,
        request: &CreateProductRequest,
    ) -> ProcessorResult<UpstreamProduct> {
        let mut state = self.inner.lock().unwrap();
        state.counter += 1;
        let product = UpstreamProduct {
            id: format!("prod_mock_{}", state.counter),
            name: request.name.clone(),
        };
        state.products.insert(
            product_key(seller_account_id, &request.search_key),
            product.clone(),
        );
        state.created_products.push(request.clone());
        Ok(product)
    }

    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> ProcessorResult<CheckoutSession> {
        let mut state = self.inner.lock().unwrap();
        state.counter += 1;
        let id = format!("cs_mock_{}", state.counter);
        state.created_sessions.push(request.clone());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.test/{}", id)),
            id,
        })
    }

    async fn get_session(
        &self,
        _seller_account_id: &str,
        session_id: &str,
        expand_line_items: bool,
    ) -> ProcessorResult<SessionDetails> {
        let state = self.inner.lock().unwrap();
        let session =
            state
                .sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| PaymentError::ProcessorApi {
                    operation: "get_session".to_string(),
                    message: format!("no such session: {}", session_id),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })?;
        if expand_line_items {
            Ok(session)
        } else {
            Ok(SessionDetails {
                line_items: Vec::new(),
                ..session
            })
        }
    }

    async fn get_payment_intent(
        &self,
        _seller_account_id: &str,
        payment_intent_id: &str,
    ) -> ProcessorResult<PaymentIntentDetails> {
        self.inner
            .lock()
            .unwrap()
            .payment_intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| PaymentError::ProcessorApi {
                operation: "get_payment_intent".to_string(),
                message: format!("no such payment intent: {}", payment_intent_id),
                code: Some("resource_missing".to_string()),
                http_status: Some(404),
            })
    }

    async fn find_stored_payment_method(
        &self,
        seller_account_id: &str,
        customer_email: &str,
    ) -> ProcessorResult<Option<StoredPaymentMethod>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .stored_methods
            .get(&method_key(seller_account_id, customer_email))
            .cloned())
    }

    async fn create_off_session_charge(
        &self,
        request: &OffSessionChargeRequest,
    ) -> ProcessorResult<PaymentIntentDetails> {
        let mut state = self.inner.lock().unwrap();
        state.off_session_charges.push(request.clone());
        if let Some(error) = state.scripted_charge_errors.pop_front() {
            return Err(error);
        }
        state.counter += 1;
        let intent = PaymentIntentDetails {
            id: format!("pi_mock_{}", state.counter),
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentIntentStatus::Succeeded,
            application_fee_amount: Some(request.application_fee_amount),
            processor_fee: None,
            client_secret: None,
        };
        state.payment_intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_product_find_after_create() {
        let client = MockProcessorClient::new();
        assert!(client
            .find_product("acct_1", "track:t1")
            .await
            .unwrap()
            .is_none());

        let created = client
            .create_product(
                "acct_1",
                &CreateProductRequest {
                    name: "Song".to_string(),
                    description: None,
                    search_key: "track:t1".to_string(),
                },
            )
            .await
            .unwrap();

        let found = client
            .find_product("acct_1", "track:t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        // Products are scoped per seller account.
        assert!(client
            .find_product("acct_2", "track:t1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_scripted_charge_failure_is_consumed() {
        let client = MockProcessorClient::new();
        client.script_charge_failure(PaymentError::ProcessorApi {
            operation: "create_off_session_charge".to_string(),
            message: "card declined".to_string(),
            code: Some("card_declined".to_string()),
            http_status: Some(402),
        });

        let request = OffSessionChargeRequest {
            seller_account_id: "acct_1".to_string(),
            customer_id: "cus_1".to_string(),
            payment_method_id: "pm_1".to_string(),
            amount: 1000,
            currency: "usd".to_string(),
            application_fee_amount: 70,
            metadata: Default::default(),
        };

        assert!(client.create_off_session_charge(&request).await.is_err());
        // Next charge succeeds.
        let intent = client.create_off_session_charge(&request).await.unwrap();
        assert_eq!(intent.status, PaymentIntentStatus::Succeeded);
        assert_eq!(client.off_session_charges().len(), 2);
    }
}
