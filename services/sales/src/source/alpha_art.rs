use super::{ActivitySource, Cursor, PageRequest, RawActivity, SourceError, TradeDetail};
use crate::marketplace::Marketplace;
use crate::record::SaleRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// The activity endpoint never returns more than this per page.
pub const MAX_PAGE_LIMIT: u32 = 20;

const ACTIVITY_PATH: &str = "/api/v1/activity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingType {
    Sale,
    Listing,
    Offer,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivityRequest<'a> {
    id: &'a str,
    resource_type: &'static str,
    trading_types: [TradingType; 1],
    before: Option<DateTime<Utc>>,
    limit: u32,
    #[serde(rename = "NoForeignListing")]
    no_foreign_listing: bool,
}

#[derive(Debug, Deserialize)]
struct ActivityHistory {
    #[serde(default)]
    history: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub signature: String,
    pub mint_pubkey: String,
    /// Seller, for sales
    #[serde(default)]
    pub user: Option<String>,
    pub trading_type: TradingType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub marketplace: Option<String>,
    /// Lamports, as a decimal string
    pub price: String,
    #[serde(default)]
    pub to_pubkey: Option<String>,
}

impl ActivityEntry {
    fn into_activity(self) -> Result<RawActivity, SourceError> {
        let price = self.price.trim().parse::<u64>().map_err(|e| {
            SourceError::Malformed(format!(
                "price {:?} of activity {}: {e}",
                self.price, self.signature
            ))
        })?;

        // entries without a label happened on the feed's own marketplace
        let marketplace = match self.marketplace.as_deref() {
            None | Some("") => Some(Marketplace::AlphaArt),
            Some(label) => Marketplace::from_feed_label(label),
        };

        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());

        Ok(RawActivity {
            cursor: Cursor::Time(self.created_at),
            event_time: Some(self.created_at),
            failed: false,
            detail: Some(TradeDetail {
                mint: self.mint_pubkey,
                price,
                marketplace,
                buyer: non_empty(self.to_pubkey),
                seller: non_empty(self.user),
                ..Default::default()
            }),
            id: self.signature,
        })
    }
}

/// Clamp a requested page size the way the endpoint does; zero means default.
fn clamp_limit(limit: u32) -> u32 {
    if limit == 0 {
        MAX_PAGE_LIMIT
    } else {
        limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Marketplace-API activity for one collection.
pub struct AlphaArtSource {
    http: reqwest::Client,
    api_url: String,
    collection_id: String,
    page_limit: u32,
}

impl AlphaArtSource {
    pub fn new(
        api_url: &str,
        collection_id: &str,
        page_limit: u32,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, api_url, collection_id, page_limit))
    }

    pub fn with_client(
        http: reqwest::Client,
        api_url: &str,
        collection_id: &str,
        page_limit: u32,
    ) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            collection_id: collection_id.to_string(),
            page_limit: clamp_limit(page_limit),
        }
    }
}

#[async_trait]
impl ActivitySource for AlphaArtSource {
    fn name(&self) -> &'static str {
        "alpha_art"
    }

    fn page_limit(&self) -> u32 {
        self.page_limit
    }

    #[instrument(skip(self, request), fields(collection = %self.collection_id))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawActivity>, SourceError> {
        let now = Utc::now();
        // a future `before` is sent as null, which the endpoint reads as "now"
        let before = match &request.before {
            Some(Cursor::Time(time)) if *time <= now => Some(*time),
            _ => None,
        };
        let until = match &request.until {
            Some(Cursor::Time(time)) => Some(*time),
            _ => None,
        };

        let body = ActivityRequest {
            id: &self.collection_id,
            resource_type: "COLLECTION",
            trading_types: [TradingType::Sale],
            before,
            limit: clamp_limit(request.limit),
            no_foreign_listing: true,
        };

        let response = self
            .http
            .post(format!("{}{}", self.api_url, ACTIVITY_PATH))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited("alpha art activity".to_string()));
        }

        let history: ActivityHistory = response.error_for_status()?.json().await?;
        debug!(count = history.history.len(), "Fetched activity page");

        history
            .history
            .into_iter()
            .filter(|entry| entry.trading_type == TradingType::Sale)
            .filter(|entry| until.map_or(true, |until| entry.created_at > until))
            .map(ActivityEntry::into_activity)
            .collect()
    }

    async fn load_detail(&self, activity: &RawActivity) -> Result<Option<TradeDetail>, SourceError> {
        Ok(activity.detail.clone())
    }

    fn cursor_for(&self, record: &SaleRecord) -> Option<Cursor> {
        record.sale_time.map(Cursor::Time)
    }
}
