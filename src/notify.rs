//! Notification dispatch contract.
//!
//! The engine never renders or sends email itself. It enqueues a template
//! name, a recipient, and structured locals; delivery is someone else's
//! problem and is never awaited inline with a financial record.

use async_trait::async_trait;

use crate::error::Result;

/// Template names the engine enqueues.
pub mod templates {
    pub const TRACK_DOWNLOAD: &str = "track-download";
    pub const TRACK_PURCHASE_RECEIPT: &str = "track-purchase-receipt";
    pub const ALBUM_DOWNLOAD: &str = "album-download";
    pub const ALBUM_PURCHASE_RECEIPT: &str = "album-purchase-receipt";
    pub const CATALOGUE_PURCHASE_RECEIPT: &str = "catalogue-purchase-receipt";
    pub const MERCH_PURCHASE_RECEIPT: &str = "merch-purchase-receipt";
    pub const ARTIST_NEW_SALE: &str = "artist-new-sale";
    pub const TIP_RECEIPT: &str = "tip-receipt";
    pub const TIP_RECEIVED: &str = "tip-received";
    pub const USER_SUBSCRIBED_TO_YOU: &str = "user-subscribed-to-you";
    pub const SUBSCRIPTION_RECEIPT: &str = "subscription-receipt";
    pub const SUBSCRIPTION_PAYMENT_FAILED: &str = "subscription-payment-failed";
    pub const FUNDRAISER_PLEDGE_CHARGED: &str = "fundraiser-pledge-charged";
    pub const FUNDRAISER_PLEDGE_FAILED: &str = "fundraiser-pledge-failed";
}

/// Fire-and-forget notification sink.
///
/// Implementations hand the message to a mail queue; the engine never waits
/// on delivery confirmation.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Enqueue a notification for delivery.
    async fn enqueue(
        &self,
        template: &str,
        recipient_email: &str,
        locals: serde_json::Value,
    ) -> Result<()>;
}

/// Enqueue a notification, logging instead of propagating on failure.
///
/// Notification enqueue sits outside the handler's atomic unit of work: a
/// delivery failure must not roll back a financial record.
pub async fn enqueue_or_log<N: NotificationDispatcher>(
    dispatcher: &N,
    template: &str,
    recipient_email: &str,
    locals: serde_json::Value,
) {
    if let Err(err) = dispatcher.enqueue(template, recipient_email, locals).await {
        tracing::warn!(
            target: "bandstand::notify",
            template,
            recipient = recipient_email,
            error = %err,
            "Failed to enqueue notification"
        );
    }
}

/// Dispatcher that logs notifications via `tracing`.
///
/// Development backend, in the spirit of a console mailer.
#[derive(Debug, Clone, Default)]
pub struct TracingDispatcher;

impl TracingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn enqueue(
        &self,
        template: &str,
        recipient_email: &str,
        locals: serde_json::Value,
    ) -> Result<()> {
        tracing::info!(
            target: "bandstand::notify",
            template,
            recipient = recipient_email,
            locals = %locals,
            "Notification enqueued"
        );
        Ok(())
    }
}

/// A notification captured by [`RecordingDispatcher`].
#[cfg(any(test, feature = "test-payments"))]
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub template: String,
    pub recipient_email: String,
    pub locals: serde_json::Value,
}

/// Dispatcher that records every notification for inspection in tests.
#[cfg(any(test, feature = "test-payments"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    queued: std::sync::Arc<std::sync::Mutex<Vec<QueuedNotification>>>,
}

#[cfg(any(test, feature = "test-payments"))]
impl RecordingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications enqueued so far.
    pub fn queued(&self) -> Vec<QueuedNotification> {
        self.queued.lock().unwrap().clone()
    }

    /// Notifications for a given template name.
    pub fn queued_for_template(&self, template: &str) -> Vec<QueuedNotification> {
        self.queued
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.template == template)
            .cloned()
            .collect()
    }
}

#[cfg(any(test, feature = "test-payments"))]
#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn enqueue(
        &self,
        template: &str,
        recipient_email: &str,
        locals: serde_json::Value,
    ) -> Result<()> {
        self.queued.lock().unwrap().push(QueuedNotification {
            template: template.to_string(),
            recipient_email: recipient_email.to_string(),
            locals,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_dispatcher() {
        let dispatcher = RecordingDispatcher::new();

        dispatcher
            .enqueue(
                templates::ALBUM_DOWNLOAD,
                "fan@example.com",
                serde_json::json!({"trackGroupId": "tg_1"}),
            )
            .await
            .unwrap();

        let queued = dispatcher.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].template, "album-download");
        assert_eq!(queued[0].recipient_email, "fan@example.com");

        assert_eq!(dispatcher.queued_for_template("album-download").len(), 1);
        assert!(dispatcher.queued_for_template("tip-receipt").is_empty());
    }
}
