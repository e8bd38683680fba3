//! Sale records as persisted in the record store.
//!
//! A [`SaleRecord`] is created exactly once by the ingestion engine and is
//! afterwards only touched by the publisher, which writes `mediaId` and then
//! `publishDetails`. Field names are camelCase on the wire; the [`fields`]
//! module holds the paths used to address them in store conditions.

use crate::marketplace::Marketplace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field paths of a [`SaleRecord`] document.
///
/// Nested fields are joined with `.`; the store gateway splits and quotes
/// them, so callers never build raw query text from these.
pub mod fields {
    pub const ID: &str = "id";
    pub const COLLECTION: &str = "collection";
    pub const MARKETPLACE: &str = "marketplace";
    pub const PRICE: &str = "price";
    pub const SALE_TIME: &str = "saleTime";
    pub const CREATED_AT: &str = "createdAt";
    pub const NFT_NAME: &str = "nft.name";
    pub const MEDIA_ID: &str = "mediaId";
    pub const PUBLISH_DETAILS: &str = "publishDetails";
}

/// A single marketplace sale of an NFT from the tracked collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
    /// Source transaction signature; also the primary key.
    pub id: String,
    #[serde(default)]
    pub buyer: Option<String>,
    #[serde(default)]
    pub seller: Option<String>,
    /// Collection identifier, e.g. `bad-bromatoes`
    pub collection: String,
    pub marketplace: Marketplace,
    /// Mint account of the NFT that changed hands
    pub mint_pubkey: String,
    /// Sale price in lamports
    pub price: u64,
    pub sale_time: Option<DateTime<Utc>>,
    /// Set by the ingestion engine immediately before the record is created
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub nft: NftInfo,
    #[serde(default)]
    pub publish_details: Option<PublishDetails>,
    /// Channel-side media handle, cached so a retried publish skips the upload
    #[serde(default)]
    pub media_id: String,
}

impl SaleRecord {
    /// Whether a publication outcome has been recorded for this sale.
    pub fn is_published(&self) -> bool {
        self.publish_details.is_some()
    }

    /// Whether a channel media handle is already cached on the record.
    pub fn has_media(&self) -> bool {
        !self.media_id.is_empty()
    }
}

/// Off-chain identity of the NFT, resolved at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftInfo {
    pub name: String,
    pub symbol: String,
    #[serde(rename = "metadataURI")]
    pub metadata_uri: String,
}

/// Outcome of publishing a sale to a social channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDetails {
    pub external_post_id: String,
    pub channel: PublishChannel,
    pub time: DateTime<Utc>,
    pub success: bool,
}

/// Channels a sale can be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishChannel {
    Primary,
}

impl PublishChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishChannel::Primary => "primary",
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::sale_at;
    use super::*;

    #[test]
    fn test_record_serializes_with_store_field_names() {
        let record = sale_at("sig-1", 1_640_995_200);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["mintPubkey"], "mint-sig-1");
        assert_eq!(value["saleTime"], "2022-01-01T00:00:00Z");
        assert_eq!(value["nft"]["metadataURI"], "https://arweave.net/sig-1");
        assert_eq!(value["marketplace"], "magic-eden");
        assert!(value["publishDetails"].is_null());
        assert_eq!(value["mediaId"], "");
    }

    #[test]
    fn test_record_tolerates_missing_publication_fields() {
        let json = r#"{
            "id": "sig-2",
            "collection": "bad-bromatoes",
            "marketplace": "solsea",
            "mintPubkey": "mint",
            "price": 100,
            "saleTime": "2021-12-24T10:00:00Z",
            "nft": {"name": "n", "symbol": "s", "metadataURI": "u"}
        }"#;

        let record: SaleRecord = serde_json::from_str(json).unwrap();
        assert!(!record.is_published());
        assert!(!record.has_media());
        assert_eq!(record.buyer, None);
    }

    #[test]
    fn test_publish_details_round_trip_names() {
        let details = PublishDetails {
            external_post_id: "1475".to_string(),
            channel: PublishChannel::Primary,
            time: Utc::now(),
            success: true,
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["externalPostId"], "1475");
        assert_eq!(value["channel"], "primary");
    }
}
