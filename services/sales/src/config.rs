use crate::channel::OAuthCredentials;
use crate::marketplace::{Marketplace, NoiseFilter};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the sales service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Activity source configuration
    #[serde(default)]
    pub source: SourceConfig,
    /// Ingestion loop configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Publication loop configuration
    #[serde(default)]
    pub publication: PublicationConfig,
    /// Publishing channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Operational API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Which activity feed this deployment follows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Solana,
    AlphaArt,
}

/// Activity source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    /// Solana JSON-RPC endpoint, also used for token metadata lookups
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    /// Collection royalty account whose signatures form the Solana feed
    #[serde(default)]
    pub royalty_address: String,
    #[serde(default = "default_alpha_art_url")]
    pub alpha_art_url: String,
    /// Collection identifier, stored on every record
    #[serde(default = "default_collection_id")]
    pub collection_id: String,
    /// Entries per page; the Alpha Art feed caps this at 20
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Ingestion loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ingestion_interval_secs")]
    pub interval_secs: u64,
    /// Flush once more than this many records are buffered
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default = "default_entry_delay_ms")]
    pub entry_delay_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Overall deadline for one retried call, in seconds
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
    /// Minimum lamport price per marketplace; cheaper entries are discarded
    #[serde(default = "default_min_price")]
    pub min_price: HashMap<Marketplace, u64>,
}

/// Publication loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PublicationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_publication_interval_secs")]
    pub interval_secs: u64,
    /// Sales before this instant are never published
    #[serde(default = "default_cutoff")]
    pub cutoff: DateTime<Utc>,
    #[serde(default = "default_headline")]
    pub headline: String,
    #[serde(default = "default_hashtag")]
    pub hashtag: String,
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,
    /// Lamport amounts below this are published without a price
    #[serde(default = "default_price_threshold")]
    pub price_threshold: u64,
    /// Timeout for metadata and image downloads, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub download_timeout_secs: u64,
}

/// Publishing channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_post_url")]
    pub post_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    /// APPEND segment size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub credentials: OAuthCredentials,
}

/// Operational API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "sales-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_rpc_url() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_alpha_art_url() -> String {
    "https://apis.alpha.art".to_string()
}

fn default_collection_id() -> String {
    "bad-bromatoes".to_string()
}

fn default_page_limit() -> u32 {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_ingestion_interval_secs() -> u64 {
    60
}

fn default_flush_threshold() -> usize {
    500
}

fn default_entry_delay_ms() -> u64 {
    250
}

fn default_page_delay_ms() -> u64 {
    6000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_retry_timeout_secs() -> u64 {
    45
}

fn default_min_price() -> HashMap<Marketplace, u64> {
    HashMap::from([(Marketplace::Solsea, 90_000_000)])
}

fn default_publication_interval_secs() -> u64 {
    120
}

fn default_cutoff() -> DateTime<Utc> {
    // 2021-12-01T00:00:00Z
    DateTime::from_timestamp(1_638_316_800, 0).unwrap_or_default()
}

fn default_headline() -> String {
    "New Bromato Sale!".to_string()
}

fn default_hashtag() -> String {
    "#Bromato".to_string()
}

fn default_explorer_url() -> String {
    "https://solscan.io".to_string()
}

fn default_price_threshold() -> u64 {
    crate::price::DEFAULT_PRICE_THRESHOLD
}

fn default_post_url() -> String {
    crate::channel::twitter::DEFAULT_POST_URL.to_string()
}

fn default_upload_url() -> String {
    crate::channel::twitter::DEFAULT_UPLOAD_URL.to_string()
}

fn default_chunk_size() -> usize {
    crate::channel::twitter::CHUNK_SIZE
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/sales").required(false))
            .add_source(config::File::with_name("/etc/bromato/sales").required(false))
            // SALES__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("SALES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        match self.source.kind {
            SourceKind::Solana if self.source.royalty_address.is_empty() => {
                return Err(ConfigValidationError::MissingField(
                    "source.royalty_address".to_string(),
                ));
            }
            SourceKind::AlphaArt if self.source.collection_id.is_empty() => {
                return Err(ConfigValidationError::MissingField(
                    "source.collection_id".to_string(),
                ));
            }
            _ => {}
        }

        if self.source.page_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.page_limit".to_string(),
                message: "Page limit must be greater than 0".to_string(),
            });
        }

        if self.ingestion.retry_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingestion.retry_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.ingestion.interval_secs == 0 || self.publication.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingestion/publication.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.channel.chunk_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "channel.chunk_size".to_string(),
                message: "Chunk size must be greater than 0".to_string(),
            });
        }

        if self.publication.enabled && !self.channel.credentials.is_complete() {
            return Err(ConfigValidationError::MissingField(
                "channel.credentials".to_string(),
            ));
        }

        Ok(())
    }
}

impl IngestionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn entry_delay(&self) -> Duration {
        Duration::from_millis(self.entry_delay_ms)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs(self.retry_backoff_secs),
            Duration::from_secs(self.retry_timeout_secs),
        )
    }

    pub fn noise_filter(&self) -> NoiseFilter {
        NoiseFilter::new(self.min_price.clone())
    }
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PublicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            rpc_url: default_rpc_url(),
            commitment: default_commitment(),
            royalty_address: String::new(),
            alpha_art_url: default_alpha_art_url(),
            collection_id: default_collection_id(),
            page_limit: default_page_limit(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_ingestion_interval_secs(),
            flush_threshold: default_flush_threshold(),
            entry_delay_ms: default_entry_delay_ms(),
            page_delay_ms: default_page_delay_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_timeout_secs: default_retry_timeout_secs(),
            min_price: default_min_price(),
        }
    }
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_publication_interval_secs(),
            cutoff: default_cutoff(),
            headline: default_headline(),
            hashtag: default_hashtag(),
            explorer_url: default_explorer_url(),
            price_threshold: default_price_threshold(),
            download_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            post_url: default_post_url(),
            upload_url: default_upload_url(),
            chunk_size: default_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
            credentials: OAuthCredentials::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
