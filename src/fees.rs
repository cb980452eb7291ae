//! Platform fee calculation.
//!
//! Pure and deterministic: no I/O, no clock, no global state. All amounts
//! are in the currency's smallest unit.

use crate::config::SiteSettings;

/// Calculates the platform's cut of a payment.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    settings: SiteSettings,
}

impl FeeCalculator {
    /// Create a calculator from injected site settings.
    #[must_use]
    pub fn new(settings: SiteSettings) -> Self {
        Self { settings }
    }

    /// Compute the platform cut for a price.
    ///
    /// The default percent comes from site settings; an artist- or item-level
    /// `override_percent` replaces it. Currencies on the zero-fee allow-list
    /// always yield 0 regardless of overrides. The result is rounded to the
    /// nearest smallest currency unit.
    #[must_use]
    pub fn app_fee(&self, price: i64, currency: &str, override_percent: Option<f64>) -> i64 {
        if price <= 0 {
            return 0;
        }
        if self.settings.is_zero_fee_currency(currency) {
            return 0;
        }

        let percent = override_percent.unwrap_or(self.settings.platform_fee_percent);
        if percent <= 0.0 {
            return 0;
        }

        ((price as f64) * percent / 100.0).round() as i64
    }

    /// The effective fee percent for an optional override.
    #[must_use]
    pub fn effective_percent(&self, override_percent: Option<f64>) -> f64 {
        override_percent.unwrap_or(self.settings.platform_fee_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> FeeCalculator {
        FeeCalculator::new(
            SiteSettings::new()
                .platform_fee_percent(7.0)
                .zero_fee_currencies(["ngn", "brl"]),
        )
    }

    #[test]
    fn test_default_percent() {
        let fees = calculator();
        // 7% of 1000 = 70
        assert_eq!(fees.app_fee(1000, "usd", None), 70);
    }

    #[test]
    fn test_override_replaces_default() {
        let fees = calculator();
        assert_eq!(fees.app_fee(1000, "usd", Some(10.0)), 100);
        assert_eq!(fees.app_fee(1000, "usd", Some(0.0)), 0);
    }

    #[test]
    fn test_zero_fee_currency_beats_override() {
        let fees = calculator();
        assert_eq!(fees.app_fee(1000, "ngn", None), 0);
        assert_eq!(fees.app_fee(1000, "NGN", Some(50.0)), 0);
        assert_eq!(fees.app_fee(999_999, "brl", Some(99.0)), 0);
    }

    #[test]
    fn test_rounds_to_smallest_unit() {
        let fees = calculator();
        // 7% of 333 = 23.31 -> 23
        assert_eq!(fees.app_fee(333, "usd", None), 23);
        // 7% of 350 = 24.5 -> 25
        assert_eq!(fees.app_fee(350, "usd", None), 25);
    }

    #[test]
    fn test_free_and_negative_prices() {
        let fees = calculator();
        assert_eq!(fees.app_fee(0, "usd", None), 0);
        assert_eq!(fees.app_fee(-500, "usd", None), 0);
    }

    #[test]
    fn test_effective_percent() {
        let fees = calculator();
        assert_eq!(fees.effective_percent(None), 7.0);
        assert_eq!(fees.effective_percent(Some(12.5)), 12.5);
    }
}
