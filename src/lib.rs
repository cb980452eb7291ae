//! Bandstand - payment and purchase reconciliation for direct-to-fan music
//! commerce.
//!
//! The engine sits between a hosted payment processor and the platform's
//! catalog. It opens checkout sessions stamped with reconciliation metadata,
//! then consumes the processor's webhook stream to turn completed payments
//! into purchases, subscriptions, pledge settlements, and ledger records.
//! Delivery is at-least-once, so every handler is idempotent.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bandstand::{
//!     CheckoutUrls, PaymentContext, SiteSettings, TracingDispatcher,
//! };
//! use bandstand::processor::{LiveProcessorClient, LiveProcessorConfig};
//! use bandstand::storage::memory::InMemoryEngineStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     bandstand::init_tracing();
//!
//!     let settings = SiteSettings::new()
//!         .platform_fee_percent(7.0)
//!         .webhook_secret(std::env::var("WEBHOOK_SECRET")?);
//!     let processor =
//!         LiveProcessorClient::new(std::env::var("PROCESSOR_KEY")?, LiveProcessorConfig::new())?;
//!
//!     let context = PaymentContext::new(
//!         InMemoryEngineStore::new(),
//!         processor,
//!         TracingDispatcher::new(),
//!         settings,
//!         CheckoutUrls::new("https://example.com/thanks", "https://example.com/cart"),
//!     );
//!     let app = bandstand::http::router(context);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fees;
pub mod http;
pub mod metadata;
pub mod notify;
pub mod pledges;
pub mod processor;
pub mod registrar;
pub mod storage;
pub mod subscriptions;
pub mod webhook;

// Re-exports for public API
pub use catalog::{Buyer, CheckoutManager, CheckoutUrls};
pub use config::SiteSettings;
pub use error::{EngineError, PaymentError, Result};
pub use fees::FeeCalculator;
pub use http::{PaymentContext, SIGNATURE_HEADER};
pub use metadata::{PurchaseType, SessionMetadata};
pub use notify::{NotificationDispatcher, TracingDispatcher};
pub use pledges::{PledgeChargeReport, PledgeCharger};
pub use registrar::PurchaseRegistrar;
pub use subscriptions::{InvoiceEvent, SubscriptionLifecycle};
pub use webhook::{SignatureVerifier, WebhookEvent, WebhookHandler, WebhookOutcome};

#[cfg(feature = "test-payments")]
pub use notify::RecordingDispatcher;
#[cfg(feature = "test-payments")]
pub use processor::MockProcessorClient;
#[cfg(feature = "test-payments")]
pub use storage::memory::InMemoryEngineStore;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before building the router.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "bandstand=debug")
/// - `BANDSTAND_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("BANDSTAND_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
