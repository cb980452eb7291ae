//! Live processor client over HTTPS.
//!
//! Production client with retry logic, secure API key handling, and error
//! mapping into [`PaymentError`]. All requests are made on behalf of the
//! seller's connected account via the account header.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::PaymentError;

use super::client::{ProcessorClient, ProcessorResult};
use super::types::{
    Address, CheckoutSession, CreateProductRequest, CreateSessionRequest, OffSessionChargeRequest,
    PaymentIntentDetails, PaymentIntentStatus, SessionDetails, SessionLineItem, SessionMode,
    StoredPaymentMethod, UpstreamProduct,
};

/// Metadata key holding the deterministic product search key.
const META_SEARCH_KEY: &str = "searchKey";

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Countries merch can ship to. Checkout collects a shipping address only
/// for these.
const SHIPPABLE_COUNTRIES: &[&str] = &[
    "US", "CA", "GB", "IE", "FR", "DE", "NL", "BE", "ES", "PT", "IT", "AT", "CH", "DK", "SE",
    "NO", "FI", "PL", "CZ", "AU", "NZ", "JP", "BR", "MX",
];

/// Configuration for the live processor client.
#[derive(Debug, Clone)]
pub struct LiveProcessorConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl LiveProcessorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay for exponential backoff.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set request timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Error returned when client construction fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfigError {
    pub reason: String,
}

impl std::fmt::Display for ProcessorConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid processor client configuration: {}", self.reason)
    }
}

impl std::error::Error for ProcessorConfigError {}

/// Validate an API key format.
///
/// Valid formats: `sk_test_*`, `sk_live_*`, `rk_test_*`, `rk_live_*`.
fn validate_api_key(key: &str) -> std::result::Result<(), ProcessorConfigError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(ProcessorConfigError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(ProcessorConfigError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(ProcessorConfigError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

/// Live processor client.
///
/// The API key is held as a `SecretString` and never appears in debug
/// output. Transient failures (HTTP 429, 5xx, timeouts) are retried with
/// exponential backoff before surfacing as retryable [`PaymentError`]s.
#[derive(Clone)]
pub struct LiveProcessorClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
    config: LiveProcessorConfig,
}

impl LiveProcessorClient {
    /// Create a new live client.
    ///
    /// # Errors
    /// Fails when the API key format is invalid or the HTTP client cannot
    /// be built.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveProcessorConfig,
    ) -> std::result::Result<Self, ProcessorConfigError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let base_url = Url::parse(DEFAULT_API_BASE).map_err(|e| ProcessorConfigError {
            reason: format!("invalid API base URL: {}", e),
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProcessorConfigError {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            config,
        })
    }

    /// Create a client with default configuration.
    ///
    /// # Errors
    /// Fails when the API key format is invalid.
    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, ProcessorConfigError> {
        Self::new(api_key, LiveProcessorConfig::default())
    }

    /// Point the client at a different API base (test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Check if the client is using a test mode API key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    /// Execute one API call with timeout and retry.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        seller_account_id: Option<&str>,
        query: Option<&[(String, String)]>,
        form: Option<&[(String, String)]>,
        operation: &'static str,
    ) -> ProcessorResult<T> {
        let url = self.base_url.join(path).map_err(|e| PaymentError::Internal {
            message: format!("invalid API path '{}': {}", path, e),
        })?;

        let mut attempts = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(self.api_key.expose_secret());
            if let Some(account) = seller_account_id {
                request = request.header("Stripe-Account", account);
            }
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(form) = form {
                request = request.form(form);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    if retryable && attempts < self.config.max_retries {
                        attempts += 1;
                        self.backoff(attempts, operation).await;
                        continue;
                    }
                    return Err(PaymentError::ProcessorApi {
                        operation: operation.to_string(),
                        message: e.to_string(),
                        code: None,
                        http_status: None,
                    });
                }
            };

            let status = response.status();
            if status.is_success() {
                return response.json::<T>().await.map_err(|e| {
                    PaymentError::InvalidWebhookPayload {
                        message: format!("malformed {} response: {}", operation, e),
                    }
                });
            }

            let error = parse_api_error(operation, status.as_u16(), response).await;
            if error.is_retryable() && attempts < self.config.max_retries {
                attempts += 1;
                self.backoff(attempts, operation).await;
                continue;
            }
            return Err(error);
        }
    }

    async fn backoff(&self, attempt: u32, operation: &str) {
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(1_u64 << attempt.min(16))
            .min(self.config.max_delay_ms);
        tracing::debug!(
            target: "bandstand::processor",
            operation,
            attempt,
            delay_ms = delay,
            "Retrying processor request"
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

// Debug implementation that doesn't expose the API key.
impl std::fmt::Debug for LiveProcessorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveProcessorClient")
            .field("base_url", &self.base_url.as_str())
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Turn a non-2xx API response into a `PaymentError`.
async fn parse_api_error(
    operation: &'static str,
    http_status: u16,
    response: reqwest::Response,
) -> PaymentError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
        code: Option<String>,
    }

    let (message, code) = match response.json::<ErrorBody>().await {
        Ok(body) => (
            body.error
                .message
                .unwrap_or_else(|| format!("HTTP {}", http_status)),
            body.error.code,
        ),
        Err(_) => (format!("HTTP {}", http_status), None),
    };

    PaymentError::ProcessorApi {
        operation: operation.to_string(),
        message,
        code,
        http_status: Some(http_status),
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Deserialize)]
struct ProductObject {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ListObject<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct AddressObject {
    line1: Option<String>,
    line2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl From<AddressObject> for Address {
    fn from(a: AddressObject) -> Self {
        Address {
            line1: a.line1,
            line2: a.line2,
            city: a.city,
            state: a.state,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

#[derive(Deserialize)]
struct CustomerDetailsObject {
    email: Option<String>,
    address: Option<AddressObject>,
}

#[derive(Deserialize)]
struct ShippingDetailsObject {
    address: Option<AddressObject>,
}

#[derive(Deserialize)]
struct PriceObject {
    product: String,
}

#[derive(Deserialize)]
struct LineItemObject {
    quantity: Option<u32>,
    amount_total: i64,
    currency: String,
    price: Option<PriceObject>,
}

#[derive(Deserialize)]
struct SessionObject {
    id: String,
    url: Option<String>,
    customer_details: Option<CustomerDetailsObject>,
    amount_total: Option<i64>,
    currency: Option<String>,
    payment_intent: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    shipping_details: Option<ShippingDetailsObject>,
    line_items: Option<ListObject<LineItemObject>>,
}

impl From<SessionObject> for SessionDetails {
    fn from(s: SessionObject) -> Self {
        let (customer_email, billing_address) = match s.customer_details {
            Some(details) => (details.email, details.address.map(Address::from)),
            None => (None, None),
        };
        SessionDetails {
            id: s.id,
            customer_email,
            amount_total: s.amount_total.unwrap_or(0),
            currency: s.currency.unwrap_or_default(),
            payment_intent_id: s.payment_intent,
            subscription_id: s.subscription,
            metadata: s.metadata,
            shipping_address: s
                .shipping_details
                .and_then(|d| d.address)
                .map(Address::from),
            billing_address,
            line_items: s
                .line_items
                .map(|list| {
                    list.data
                        .into_iter()
                        .map(|item| SessionLineItem {
                            product_id: item.price.map(|p| p.product).unwrap_or_default(),
                            quantity: item.quantity.unwrap_or(1),
                            amount_total: item.amount_total,
                            currency: item.currency,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct BalanceTransactionObject {
    fee: i64,
}

#[derive(Deserialize)]
struct ChargeObject {
    balance_transaction: Option<BalanceTransactionObject>,
}

#[derive(Deserialize)]
struct PaymentIntentObject {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    application_fee_amount: Option<i64>,
    client_secret: Option<String>,
    latest_charge: Option<ChargeObject>,
}

impl From<PaymentIntentObject> for PaymentIntentDetails {
    fn from(pi: PaymentIntentObject) -> Self {
        PaymentIntentDetails {
            id: pi.id,
            amount: pi.amount,
            currency: pi.currency,
            status: PaymentIntentStatus::parse(&pi.status),
            application_fee_amount: pi.application_fee_amount,
            processor_fee: pi
                .latest_charge
                .and_then(|c| c.balance_transaction)
                .map(|bt| bt.fee),
            client_secret: pi.client_secret,
        }
    }
}

#[derive(Deserialize)]
struct CustomerObject {
    id: String,
}

#[derive(Deserialize)]
struct PaymentMethodObject {
    id: String,
}

fn encode_metadata(form: &mut Vec<(String, String)>, metadata: &HashMap<String, String>) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
impl ProcessorClient for LiveProcessorClient {
    async fn find_product(
        &self,
        seller_account_id: &str,
        search_key: &str,
    ) -> ProcessorResult<Option<UpstreamProduct>> {
        let query = vec![
            (
                "query".to_string(),
                format!("metadata['{}']:'{}'", META_SEARCH_KEY, search_key),
            ),
            ("limit".to_string(), "1".to_string()),
        ];
        let list: ListObject<ProductObject> = self
            .execute(
                Method::GET,
                "/v1/products/search",
                Some(seller_account_id),
                Some(&query),
                None,
                "find_product",
            )
            .await?;
        Ok(list.data.into_iter().next().map(|p| UpstreamProduct {
            id: p.id,
            name: p.name,
        }))
    }

    async fn create_product(
        &self,
        seller_account_id: &str,
        request: &CreateProductRequest,
    ) -> ProcessorResult<UpstreamProduct> {
        let mut form = vec![
            ("name".to_string(), request.name.clone()),
            (
                format!("metadata[{}]", META_SEARCH_KEY),
                request.search_key.clone(),
            ),
        ];
        if let Some(description) = &request.description {
            form.push(("description".to_string(), description.clone()));
        }

        let product: ProductObject = self
            .execute(
                Method::POST,
                "/v1/products",
                Some(seller_account_id),
                None,
                Some(&form),
                "create_product",
            )
            .await?;
        Ok(UpstreamProduct {
            id: product.id,
            name: product.name,
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> ProcessorResult<CheckoutSession> {
        let mut form = vec![
            ("mode".to_string(), request.mode.as_str().to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
        ];

        for (i, item) in request.line_items.iter().enumerate() {
            form.push((
                format!("line_items[{}][price_data][product]", i),
                item.product_id.clone(),
            ));
            form.push((
                format!("line_items[{}][price_data][currency]", i),
                item.currency.clone(),
            ));
            form.push((
                format!("line_items[{}][price_data][unit_amount]", i),
                item.unit_amount.to_string(),
            ));
            if request.mode == SessionMode::Subscription {
                form.push((
                    format!("line_items[{}][price_data][recurring][interval]", i),
                    "month".to_string(),
                ));
            }
            form.push((format!("line_items[{}][quantity]", i), item.quantity.to_string()));
        }

        match request.mode {
            SessionMode::Payment => {
                if let Some(fee) = request.application_fee_amount {
                    if fee > 0 {
                        form.push((
                            "payment_intent_data[application_fee_amount]".to_string(),
                            fee.to_string(),
                        ));
                    }
                }
            }
            SessionMode::Subscription => {
                if let Some(percent) = request.application_fee_percent {
                    if percent > 0.0 {
                        form.push((
                            "subscription_data[application_fee_percent]".to_string(),
                            percent.to_string(),
                        ));
                    }
                }
            }
        }

        if let Some(email) = &request.customer_email {
            form.push(("customer_email".to_string(), email.clone()));
        }
        if request.collect_shipping_address {
            for (i, country) in SHIPPABLE_COUNTRIES.iter().enumerate() {
                form.push((
                    format!("shipping_address_collection[allowed_countries][{}]", i),
                    (*country).to_string(),
                ));
            }
        }
        encode_metadata(&mut form, &request.metadata);

        let session: SessionObject = self
            .execute(
                Method::POST,
                "/v1/checkout/sessions",
                Some(&request.seller_account_id),
                None,
                Some(&form),
                "create_checkout_session",
            )
            .await?;
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }

    async fn get_session(
        &self,
        seller_account_id: &str,
        session_id: &str,
        expand_line_items: bool,
    ) -> ProcessorResult<SessionDetails> {
        let mut query = Vec::new();
        if expand_line_items {
            query.push(("expand[]".to_string(), "line_items".to_string()));
        }
        let session: SessionObject = self
            .execute(
                Method::GET,
                &format!("/v1/checkout/sessions/{}", session_id),
                Some(seller_account_id),
                Some(&query),
                None,
                "get_session",
            )
            .await?;
        Ok(session.into())
    }

    async fn get_payment_intent(
        &self,
        seller_account_id: &str,
        payment_intent_id: &str,
    ) -> ProcessorResult<PaymentIntentDetails> {
        let query = vec![(
            "expand[]".to_string(),
            "latest_charge.balance_transaction".to_string(),
        )];
        let intent: PaymentIntentObject = self
            .execute(
                Method::GET,
                &format!("/v1/payment_intents/{}", payment_intent_id),
                Some(seller_account_id),
                Some(&query),
                None,
                "get_payment_intent",
            )
            .await?;
        Ok(intent.into())
    }

    async fn find_stored_payment_method(
        &self,
        seller_account_id: &str,
        customer_email: &str,
    ) -> ProcessorResult<Option<StoredPaymentMethod>> {
        let query = vec![
            ("email".to_string(), customer_email.to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let customers: ListObject<CustomerObject> = self
            .execute(
                Method::GET,
                "/v1/customers",
                Some(seller_account_id),
                Some(&query),
                None,
                "find_stored_payment_method",
            )
            .await?;
        let Some(customer) = customers.data.into_iter().next() else {
            return Ok(None);
        };

        let query = vec![
            ("customer".to_string(), customer.id.clone()),
            ("type".to_string(), "card".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let methods: ListObject<PaymentMethodObject> = self
            .execute(
                Method::GET,
                "/v1/payment_methods",
                Some(seller_account_id),
                Some(&query),
                None,
                "find_stored_payment_method",
            )
            .await?;
        Ok(methods.data.into_iter().next().map(|m| StoredPaymentMethod {
            id: m.id,
            customer_id: customer.id,
        }))
    }

    async fn create_off_session_charge(
        &self,
        request: &OffSessionChargeRequest,
    ) -> ProcessorResult<PaymentIntentDetails> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("customer".to_string(), request.customer_id.clone()),
            ("payment_method".to_string(), request.payment_method_id.clone()),
            ("off_session".to_string(), "true".to_string()),
            ("confirm".to_string(), "true".to_string()),
        ];
        if request.application_fee_amount > 0 {
            form.push((
                "application_fee_amount".to_string(),
                request.application_fee_amount.to_string(),
            ));
        }
        encode_metadata(&mut form, &request.metadata);

        let intent: PaymentIntentObject = self
            .execute(
                Method::POST,
                "/v1/payment_intents",
                Some(&request.seller_account_id),
                None,
                Some(&form),
                "create_off_session_charge",
            )
            .await?;
        Ok(intent.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_validation() {
        assert!(validate_api_key("sk_test_abcdefghijklmnop").is_ok());
        assert!(validate_api_key("rk_live_abcdefghijklmnop").is_ok());
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        assert!(validate_api_key("pk_test_abcdefghijklmnop").is_err());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client = LiveProcessorClient::with_default_config("sk_test_abcdefghijklmnop")
            .expect("valid key");
        let debug = format!("{:?}", client);
        assert!(!debug.contains("abcdefghijklmnop"));
    }

    #[test]
    fn test_session_object_mapping() {
        let json = serde_json::json!({
            "id": "cs_1",
            "url": null,
            "customer_details": {"email": "fan@example.com", "address": null},
            "amount_total": 1500,
            "currency": "usd",
            "payment_intent": "pi_1",
            "subscription": null,
            "metadata": {"purchaseType": "track"},
            "shipping_details": {"address": {"line1": "1 Main St", "line2": null,
                "city": "Lagos", "state": null, "postal_code": null, "country": "NG"}},
            "line_items": {"data": [
                {"quantity": 2, "amount_total": 1500, "currency": "usd",
                 "price": {"product": "prod_1"}}
            ]}
        });
        let session: SessionObject = serde_json::from_value(json).unwrap();
        let details: SessionDetails = session.into();
        assert_eq!(details.customer_email.as_deref(), Some("fan@example.com"));
        assert_eq!(details.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(details.line_items.len(), 1);
        assert_eq!(details.line_items[0].product_id, "prod_1");
        assert_eq!(details.line_items[0].quantity, 2);
        assert_eq!(
            details.shipping_address.unwrap().country.as_deref(),
            Some("NG")
        );
    }

    #[test]
    fn test_payment_intent_status_parse() {
        assert_eq!(
            PaymentIntentStatus::parse("succeeded"),
            PaymentIntentStatus::Succeeded
        );
        assert_eq!(
            PaymentIntentStatus::parse("processing"),
            PaymentIntentStatus::Processing
        );
        assert_eq!(
            PaymentIntentStatus::parse("canceled"),
            PaymentIntentStatus::Failed
        );
    }
}
