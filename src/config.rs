//! Site-wide settings injected into the engine.
//!
//! Everything the engine reads from platform configuration is carried in an
//! explicit [`SiteSettings`] value passed in at construction time. Nothing is
//! read from ambient global state, so tests can substitute values freely.

use secrecy::SecretString;

/// Platform-wide settings for fee calculation and webhook handling.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Default platform cut as a percentage of the price (e.g. `7.0`).
    pub platform_fee_percent: f64,
    /// Lowercase currency codes the platform takes no cut on.
    ///
    /// Used for regions the processor cannot yet pay out to directly.
    pub zero_fee_currencies: Vec<String>,
    /// Default currency for prices that don't specify one.
    pub default_currency: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: Option<SecretString>,
    /// Accept unsigned webhook payloads when no secret is configured.
    ///
    /// Local development only. A missing secret without this flag is an
    /// error, never a silent pass-through.
    pub allow_unverified_webhooks: bool,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            platform_fee_percent: 7.0,
            zero_fee_currencies: Vec::new(),
            default_currency: "usd".to_string(),
            webhook_secret: None,
            allow_unverified_webhooks: false,
        }
    }
}

impl SiteSettings {
    /// Create settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default platform fee percent.
    #[must_use]
    pub fn platform_fee_percent(mut self, percent: f64) -> Self {
        self.platform_fee_percent = percent;
        self
    }

    /// Set the zero-fee currency allow-list.
    #[must_use]
    pub fn zero_fee_currencies<I, S>(mut self, currencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zero_fee_currencies = currencies
            .into_iter()
            .map(|c| c.into().to_lowercase())
            .collect();
        self
    }

    /// Set the default currency.
    #[must_use]
    pub fn default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into().to_lowercase();
        self
    }

    /// Set the webhook signing secret.
    #[must_use]
    pub fn webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Allow unsigned webhooks when no secret is configured (development only).
    #[must_use]
    pub fn allow_unverified_webhooks(mut self, allow: bool) -> Self {
        self.allow_unverified_webhooks = allow;
        self
    }

    /// Check whether the platform takes no cut for this currency.
    #[must_use]
    pub fn is_zero_fee_currency(&self, currency: &str) -> bool {
        self.zero_fee_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SiteSettings::new();
        assert_eq!(settings.platform_fee_percent, 7.0);
        assert!(!settings.allow_unverified_webhooks);
        assert!(settings.webhook_secret.is_none());
    }

    #[test]
    fn test_zero_fee_currency_case_insensitive() {
        let settings = SiteSettings::new().zero_fee_currencies(["NGN", "brl"]);
        assert!(settings.is_zero_fee_currency("ngn"));
        assert!(settings.is_zero_fee_currency("NGN"));
        assert!(settings.is_zero_fee_currency("BRL"));
        assert!(!settings.is_zero_fee_currency("usd"));
    }

    #[test]
    fn test_builder_chain() {
        let settings = SiteSettings::new()
            .platform_fee_percent(10.0)
            .default_currency("EUR")
            .webhook_secret("whsec_test")
            .allow_unverified_webhooks(true);

        assert_eq!(settings.platform_fee_percent, 10.0);
        assert_eq!(settings.default_currency, "eur");
        assert!(settings.webhook_secret.is_some());
        assert!(settings.allow_unverified_webhooks);
    }
}
