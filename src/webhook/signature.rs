//! Webhook signature verification.
//!
//! The signature header has the form `t=<unix timestamp>,v1=<hex hmac>`
//! where the HMAC-SHA256 is computed over `"{timestamp}.{body}"` with the
//! shared endpoint secret. Comparison is constant-time and the timestamp
//! must be within the tolerance window to stop replays.

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SiteSettings;
use crate::error::{PaymentError, Result};

/// Default replay tolerance window.
const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Verifies webhook payload signatures.
pub struct SignatureVerifier {
    secret: Option<SecretString>,
    allow_unverified: bool,
    tolerance_seconds: i64,
}

impl SignatureVerifier {
    /// Create a verifier with a signing secret.
    #[must_use]
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: Some(secret.into()),
            allow_unverified: false,
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    /// Build from site settings.
    #[must_use]
    pub fn from_settings(settings: &SiteSettings) -> Self {
        Self {
            secret: settings.webhook_secret.clone(),
            allow_unverified: settings.allow_unverified_webhooks,
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    /// Set the replay tolerance window.
    #[must_use]
    pub fn tolerance_seconds(mut self, seconds: i64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    /// Verify a payload against its signature header.
    ///
    /// # Errors
    /// Fails on a bad or missing signature, a stale timestamp, or a missing
    /// secret without the development pass-through flag.
    pub fn verify(&self, payload: &[u8], signature_header: Option<&str>) -> Result<()> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())
    }

    /// Verify against an explicit clock.
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now_unix: i64,
    ) -> Result<()> {
        let Some(secret) = &self.secret else {
            // Pass-through requires the explicit development flag; a missing
            // secret alone is a configuration error.
            if self.allow_unverified {
                tracing::warn!(
                    target: "bandstand::webhook",
                    "Accepting unverified webhook payload (development mode)"
                );
                return Ok(());
            }
            return Err(PaymentError::WebhookSecretMissing.into());
        };

        let header = signature_header.ok_or(PaymentError::SignatureInvalid)?;
        let parts = parse_signature_header(header)?;

        let age = (now_unix - parts.timestamp).abs();
        if age > self.tolerance_seconds {
            return Err(PaymentError::WebhookTimestampExpired { age_seconds: age }.into());
        }

        let signed_payload = format!(
            "{}.{}",
            parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected = compute_signature(secret.expose_secret(), signed_payload.as_bytes())?;

        let expected_bytes =
            hex::decode(&expected).map_err(|_| PaymentError::Internal {
                message: "hex encoding of computed signature failed".to_string(),
            })?;
        let provided_bytes =
            hex::decode(&parts.signature).map_err(|_| PaymentError::SignatureInvalid)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(PaymentError::SignatureInvalid.into());
        }
        Ok(())
    }
}

struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(PaymentError::SignatureInvalid.into());
        };
        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            // Ignore other scheme versions.
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok(SignatureParts {
            timestamp,
            signature,
        }),
        _ => Err(PaymentError::SignatureInvalid.into()),
    }
}

fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| PaymentError::Internal {
            message: "HMAC key setup failed".to_string(),
        })?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Produce a valid signature header for a payload.
///
/// Used by tests and local tooling to simulate deliveries.
#[must_use]
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
