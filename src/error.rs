use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

/// The main error type for the engine's HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Payment-domain errors.
///
/// These carry more context than the generic `EngineError` variants and can
/// be classified for retry decisions before being converted for HTTP
/// responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    // Webhook boundary
    /// Webhook signature is invalid.
    SignatureInvalid,
    /// Webhook timestamp is too old (replay attack protection).
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
    /// No webhook secret is configured and unverified delivery is not allowed.
    WebhookSecretMissing,

    // Checkout-time validation
    /// The seller has no connected payment account or charges are disabled.
    SellerNotPayable { artist_id: String },
    /// The offered price is below the item's configured floor.
    PriceBelowMinimum { price: i64, minimum: i64 },

    // Registration
    /// A purchase for this (user, target) pair already exists.
    ///
    /// Callers are expected to swallow this as a no-op.
    DuplicatePurchase { user_id: String, target_id: String },
    /// A unique-constraint conflict on a grant that may legitimately already
    /// exist. Swallowed by callers.
    DataIntegrityConflict { message: String },
    /// No upstream product exists for the given search key.
    ///
    /// Treated as "create a new one"; only escalated if creation fails.
    UpstreamProductMissing { search_key: String },

    // Lookups
    /// A record the event refers to does not exist.
    RecordMissing { kind: &'static str, id: String },

    // Processor API
    /// The payment processor returned an error.
    ProcessorApi {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureInvalid => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::WebhookSecretMissing => {
                write!(f, "No webhook secret configured and unverified delivery is disabled")
            }
            Self::SellerNotPayable { artist_id } => {
                write!(f, "Artist '{}' has no payable account", artist_id)
            }
            Self::PriceBelowMinimum { price, minimum } => {
                write!(f, "Price {} is below the minimum of {}", price, minimum)
            }
            Self::DuplicatePurchase { user_id, target_id } => {
                write!(f, "User '{}' already owns '{}'", user_id, target_id)
            }
            Self::DataIntegrityConflict { message } => {
                write!(f, "Data integrity conflict: {}", message)
            }
            Self::UpstreamProductMissing { search_key } => {
                write!(f, "No upstream product for search key '{}'", search_key)
            }
            Self::RecordMissing { kind, id } => {
                write!(f, "{} '{}' not found", kind, id)
            }
            Self::ProcessorApi { operation, message, code, http_status } => {
                write!(f, "Processor error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => {
                write!(f, "Internal payment error: {}", message)
            }
        }
    }
}

impl std::error::Error for PaymentError {}

impl PaymentError {
    /// Check if this is a client error (4xx at the HTTP boundary).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::SignatureInvalid
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. }
            | Self::SellerNotPayable { .. }
            | Self::PriceBelowMinimum { .. }
            | Self::DuplicatePurchase { .. }
            | Self::RecordMissing { .. } => true,
            Self::ProcessorApi { http_status, .. } => {
                matches!(http_status, Some(400..=428) | Some(430..=499))
            }
            _ => false,
        }
    }

    /// Check if the failed operation should be retried.
    ///
    /// Transient processor failures and timeouts map to a non-2xx webhook
    /// acknowledgement so the processor's at-least-once retry kicks in.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProcessorApi { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599) | None)
            }
            Self::Internal { .. } => true,
            _ => false,
        }
    }
}

impl From<PaymentError> for EngineError {
    fn from(err: PaymentError) -> Self {
        match &err {
            PaymentError::RecordMissing { .. } => EngineError::NotFound(err.to_string()),

            PaymentError::SellerNotPayable { .. } => EngineError::Forbidden(err.to_string()),

            PaymentError::SignatureInvalid
            | PaymentError::WebhookTimestampExpired { .. }
            | PaymentError::InvalidWebhookPayload { .. }
            | PaymentError::PriceBelowMinimum { .. }
            | PaymentError::DuplicatePurchase { .. } => EngineError::BadRequest(err.to_string()),

            PaymentError::WebhookSecretMissing
            | PaymentError::DataIntegrityConflict { .. }
            | PaymentError::UpstreamProductMissing { .. }
            | PaymentError::Internal { .. } => EngineError::Internal(err.to_string()),

            PaymentError::ProcessorApi { http_status, .. } => match http_status {
                Some(429) | Some(500..=599) | None => {
                    EngineError::ServiceUnavailable(err.to_string())
                }
                Some(400..=499) => EngineError::BadRequest(err.to_string()),
                _ => EngineError::Internal(err.to_string()),
            },
        }
    }
}

/// Structured error body returned by the HTTP boundary.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

impl EngineError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Message suitable for client responses.
    ///
    /// Server-side failures return a generic string; the full error is logged
    /// server-side but not exposed to callers.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        tracing::error!(
            target: "bandstand::http",
            status = status.as_u16(),
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            EngineError::BadRequest(format!("JSON error: {}", err))
        } else {
            EngineError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::RequestTimeout
        } else if err.is_connect() {
            EngineError::ServiceUnavailable(format!("Connection error: {}", err))
        } else {
            EngineError::Internal(format!("Request error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PaymentError::PriceBelowMinimum {
            price: 150,
            minimum: 500,
        };
        assert_eq!(err.to_string(), "Price 150 is below the minimum of 500");

        let err = PaymentError::SellerNotPayable {
            artist_id: "artist_1".to_string(),
        };
        assert_eq!(err.to_string(), "Artist 'artist_1' has no payable account");
    }

    #[test]
    fn test_error_classification() {
        let err = PaymentError::SignatureInvalid;
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = PaymentError::ProcessorApi {
            operation: "get_payment_intent".to_string(),
            message: "upstream 503".to_string(),
            code: None,
            http_status: Some(503),
        };
        assert!(!err.is_client_error());
        assert!(err.is_retryable());

        // Timeouts carry no status and are retryable.
        let err = PaymentError::ProcessorApi {
            operation: "create_charge".to_string(),
            message: "timed out".to_string(),
            code: None,
            http_status: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_convert_to_engine_error() {
        let err = PaymentError::RecordMissing {
            kind: "subscription",
            id: "sub_1".to_string(),
        };
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::NotFound(_)));

        let err = PaymentError::SignatureInvalid;
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::BadRequest(_)));

        let err = PaymentError::ProcessorApi {
            operation: "x".to_string(),
            message: "y".to_string(),
            code: None,
            http_status: Some(500),
        };
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::bad_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::service_unavailable("x").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_safe_message_hides_server_details() {
        let err = EngineError::internal("db password is hunter2");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = EngineError::bad_request("missing field 'price'");
        assert_eq!(err.safe_message(), "Bad request: missing field 'price'");
    }
}
