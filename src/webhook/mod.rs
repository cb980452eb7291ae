//! Webhook verification and event routing.

mod router;
mod signature;

pub use router::{WebhookEvent, WebhookHandler, WebhookOutcome};
pub use signature::{sign_payload, SignatureVerifier};
