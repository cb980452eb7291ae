//! Reconciliation metadata attached to checkout sessions.
//!
//! The metadata bag is the only channel through which the asynchronous
//! webhook handler learns what was purchased, so every session the engine
//! opens embeds a full [`SessionMetadata`]. The processor stores metadata as
//! opaque string pairs; this module owns the round-trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};

/// The kind of thing a checkout session pays for.
///
/// Closed set: the event router matches exhaustively so every variant has a
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurchaseType {
    #[serde(rename = "track")]
    Track,
    #[serde(rename = "trackGroup")]
    TrackGroup,
    #[serde(rename = "artistCatalogue")]
    ArtistCatalogue,
    #[serde(rename = "merch")]
    Merch,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "tip")]
    Tip,
    #[serde(rename = "fundraiserPledge")]
    FundraiserPledge,
}

impl PurchaseType {
    /// Convert to the metadata string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::TrackGroup => "trackGroup",
            Self::ArtistCatalogue => "artistCatalogue",
            Self::Merch => "merch",
            Self::Subscription => "subscription",
            Self::Tip => "tip",
            Self::FundraiserPledge => "fundraiserPledge",
        }
    }

    /// Parse from the metadata string value.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "track" => Some(Self::Track),
            "trackGroup" => Some(Self::TrackGroup),
            "artistCatalogue" => Some(Self::ArtistCatalogue),
            "merch" => Some(Self::Merch),
            "subscription" => Some(Self::Subscription),
            "tip" => Some(Self::Tip),
            "fundraiserPledge" => Some(Self::FundraiserPledge),
            _ => None,
        }
    }
}

impl std::fmt::Display for PurchaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata attached to a checkout session at creation time.
///
/// Created by the session builder, consumed exactly once by the event router
/// when the completion event arrives. Never persisted verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub purchase_type: PurchaseType,
    /// The seller's connected account the funds settle into.
    pub connected_account_id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub artist_id: Option<String>,
    pub track_id: Option<String>,
    pub track_group_id: Option<String>,
    pub tier_id: Option<String>,
    pub merch_id: Option<String>,
    pub pledge_id: Option<String>,
    pub client_id: Option<String>,
}

impl SessionMetadata {
    /// Create metadata for a purchase type and seller account.
    #[must_use]
    pub fn new(purchase_type: PurchaseType, connected_account_id: impl Into<String>) -> Self {
        Self {
            purchase_type,
            connected_account_id: connected_account_id.into(),
            user_id: None,
            user_email: None,
            artist_id: None,
            track_id: None,
            track_group_id: None,
            tier_id: None,
            merch_id: None,
            pledge_id: None,
            client_id: None,
        }
    }

    /// Attach the buyer's account id.
    #[must_use]
    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Attach the buyer's email (email-only checkout).
    #[must_use]
    pub fn user_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }

    /// Attach the seller's artist id.
    #[must_use]
    pub fn artist_id(mut self, id: impl Into<String>) -> Self {
        self.artist_id = Some(id.into());
        self
    }

    /// Attach the track being sold.
    #[must_use]
    pub fn track_id(mut self, id: impl Into<String>) -> Self {
        self.track_id = Some(id.into());
        self
    }

    /// Attach the release being sold.
    #[must_use]
    pub fn track_group_id(mut self, id: impl Into<String>) -> Self {
        self.track_group_id = Some(id.into());
        self
    }

    /// Attach the support tier being subscribed to.
    #[must_use]
    pub fn tier_id(mut self, id: impl Into<String>) -> Self {
        self.tier_id = Some(id.into());
        self
    }

    /// Attach the merch item being sold.
    #[must_use]
    pub fn merch_id(mut self, id: impl Into<String>) -> Self {
        self.merch_id = Some(id.into());
        self
    }

    /// Attach the pledge being charged (off-session flow).
    #[must_use]
    pub fn pledge_id(mut self, id: impl Into<String>) -> Self {
        self.pledge_id = Some(id.into());
        self
    }

    /// Attach the originating API client.
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Encode into the processor's string-keyed metadata bag.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("purchaseType".to_string(), self.purchase_type.as_str().to_string());
        map.insert("stripeAccountId".to_string(), self.connected_account_id.clone());

        let optional = [
            ("userId", &self.user_id),
            ("userEmail", &self.user_email),
            ("artistId", &self.artist_id),
            ("trackId", &self.track_id),
            ("trackGroupId", &self.track_group_id),
            ("tierId", &self.tier_id),
            ("merchId", &self.merch_id),
            ("pledgeId", &self.pledge_id),
            ("clientId", &self.client_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        map
    }

    /// Decode from the processor's metadata bag.
    ///
    /// # Errors
    /// Fails when `purchaseType` is missing or not one of the closed set.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let raw = map.get("purchaseType").ok_or_else(|| {
            PaymentError::InvalidWebhookPayload {
                message: "metadata is missing purchaseType".to_string(),
            }
        })?;

        let purchase_type = PurchaseType::from_str(raw).ok_or_else(|| {
            PaymentError::InvalidWebhookPayload {
                message: format!("unknown purchaseType '{}'", raw),
            }
        })?;

        let get = |key: &str| map.get(key).cloned();

        Ok(Self {
            purchase_type,
            connected_account_id: get("stripeAccountId").unwrap_or_default(),
            user_id: get("userId"),
            user_email: get("userEmail"),
            artist_id: get("artistId"),
            track_id: get("trackId"),
            track_group_id: get("trackGroupId"),
            tier_id: get("tierId"),
            merch_id: get("merchId"),
            pledge_id: get("pledgeId"),
            client_id: get("clientId"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_type_round_trip() {
        for pt in [
            PurchaseType::Track,
            PurchaseType::TrackGroup,
            PurchaseType::ArtistCatalogue,
            PurchaseType::Merch,
            PurchaseType::Subscription,
            PurchaseType::Tip,
            PurchaseType::FundraiserPledge,
        ] {
            assert_eq!(PurchaseType::from_str(pt.as_str()), Some(pt));
        }
        assert_eq!(PurchaseType::from_str("giftCard"), None);
    }

    #[test]
    fn test_metadata_round_trip() {
        let meta = SessionMetadata::new(PurchaseType::TrackGroup, "acct_1")
            .user_email("fan@example.com")
            .artist_id("artist_1")
            .track_group_id("tg_1");

        let map = meta.to_map();
        assert_eq!(map.get("purchaseType").unwrap(), "trackGroup");
        assert_eq!(map.get("stripeAccountId").unwrap(), "acct_1");
        assert!(!map.contains_key("trackId"));

        let parsed = SessionMetadata::from_map(&map).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_from_map_missing_purchase_type() {
        let map = HashMap::from([("userId".to_string(), "u1".to_string())]);
        assert!(SessionMetadata::from_map(&map).is_err());
    }

    #[test]
    fn test_from_map_unknown_purchase_type() {
        let map = HashMap::from([("purchaseType".to_string(), "mystery".to_string())]);
        assert!(SessionMetadata::from_map(&map).is_err());
    }
}
