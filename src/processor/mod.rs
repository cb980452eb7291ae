//! Payment processor boundary.
//!
//! Everything the engine knows about the processor goes through the
//! [`ProcessorClient`] trait: product catalog sync, checkout sessions,
//! payment intent lookups, and off-session charges. The live HTTP client
//! and a scriptable mock both implement it.

mod client;
mod live;
#[cfg(any(test, feature = "test-payments"))]
mod mock;
mod types;

pub use client::{ProcessorClient, ProcessorResult};
pub use live::{LiveProcessorClient, LiveProcessorConfig, ProcessorConfigError};
#[cfg(any(test, feature = "test-payments"))]
pub use mock::MockProcessorClient;
pub use types::{
    Address, CheckoutSession, CreateProductRequest, CreateSessionRequest, OffSessionChargeRequest,
    PaymentIntentDetails, PaymentIntentStatus, SessionDetails, SessionLineItem,
    SessionLineItemSpec, SessionMode, StoredPaymentMethod, UpstreamProduct,
};
