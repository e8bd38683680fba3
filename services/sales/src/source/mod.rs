//! Marketplace activity sources.
//!
//! A source yields pages of raw activity strictly older than a `before`
//! cursor and newer than an `until` cursor, newest first. Pages are not
//! trusted to be ordered; the ingestion engine sorts them itself.

pub mod alpha_art;
pub mod solana;
pub mod token_metadata;

use crate::marketplace::Marketplace;
use crate::record::{NftInfo, SaleRecord};
use crate::retry::Transient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use alpha_art::AlphaArtSource;
pub use solana::{SolanaRpcClient, SolanaSource};

/// Activity source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            SourceError::RateLimited(_) => true,
            SourceError::Http(e) => e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS),
            SourceError::Rpc { code, message } => *code == 429 || message.contains("429"),
            SourceError::Malformed(_) => false,
        }
    }
}

/// Pagination boundary: a transaction signature or an activity timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Signature(String),
    Time(DateTime<Utc>),
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Signature(signature) => f.write_str(signature),
            Cursor::Time(time) => write!(f, "{}", time.to_rfc3339()),
        }
    }
}

/// One page request against a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Fetch strictly older than this; `None` starts from the newest entry
    pub before: Option<Cursor>,
    /// Stop at this boundary; `None` walks the whole history
    pub until: Option<Cursor>,
    pub limit: u32,
}

/// A feed-reported event before it is resolved into a [`SaleRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawActivity {
    pub id: String,
    pub cursor: Cursor,
    pub event_time: Option<DateTime<Utc>>,
    /// The source already knows this entry did not succeed
    pub failed: bool,
    /// Trade detail when the feed carries it inline
    pub detail: Option<TradeDetail>,
}

/// What the engine needs to turn an activity into a sale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeDetail {
    pub mint: String,
    /// Lamports
    pub price: u64,
    /// Set when the feed names the marketplace; otherwise classified from keys
    pub marketplace: Option<Marketplace>,
    pub account_keys: Vec<String>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    /// Confirmation time reported with the detail, if any
    pub time: Option<DateTime<Utc>>,
}

/// External activity feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Short name for logs and metrics
    fn name(&self) -> &'static str;

    /// Page size this source supports
    fn page_limit(&self) -> u32;

    /// Fetch one page, newest first. An empty page means history is exhausted.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawActivity>, SourceError>;

    /// Load trade detail for an entry. `None` means the entry is not a
    /// completed trade and should be skipped.
    async fn load_detail(&self, activity: &RawActivity) -> Result<Option<TradeDetail>, SourceError>;

    /// Cursor pointing at a stored record, used as the `until` watermark.
    fn cursor_for(&self, record: &SaleRecord) -> Option<Cursor>;
}

/// Resolves an NFT mint to its on-chain name, symbol and metadata URI.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn nft_metadata(&self, mint: &str) -> Result<NftInfo, SourceError>;
}
