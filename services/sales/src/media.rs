//! Off-chain metadata and image resolution.
//!
//! The metadata document only promises a string `image` field. Images are
//! downloaded fully into memory because the channel upload declares the
//! total size before sending any bytes.

use crate::record::SaleRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

const DEFAULT_EXTENSION: &str = "png";

/// Resolver errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Metadata at {0} has no string image field")]
    MissingImage(String),

    #[error("Malformed metadata at {url}: {message}")]
    Malformed { url: String, message: String },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A downloaded image ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub bytes: Vec<u8>,
    pub extension: String,
}

impl MediaFile {
    /// MIME type declared to the channel.
    pub fn media_type(&self) -> String {
        match self.extension.as_str() {
            "jpg" => "image/jpeg".to_string(),
            ext => format!("image/{ext}"),
        }
    }
}

/// Extension from the `ext` query parameter of an image URI, or `png`.
pub fn image_extension(image_uri: &str) -> String {
    let from_query = match Url::parse(image_uri) {
        Ok(url) => url
            .query_pairs()
            .find(|(key, _)| key == "ext")
            .map(|(_, value)| value.into_owned()),
        Err(_) => image_uri
            .split_once("?ext=")
            .map(|(_, rest)| rest.split('&').next().unwrap_or_default().to_string()),
    };

    from_query
        .map(|ext| ext.trim().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Fetches the image behind a sale's NFT metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, record: &SaleRecord) -> Result<MediaFile, ResolveError>;
}

pub struct HttpMediaResolver {
    http: reqwest::Client,
}

impl HttpMediaResolver {
    pub fn new(timeout: Duration) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ResolveError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ResolveError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Image URI from the metadata document.
    pub async fn image_uri(&self, metadata_uri: &str) -> Result<String, ResolveError> {
        let document: Value = self
            .get(metadata_uri)
            .await?
            .json()
            .await
            .map_err(|e| ResolveError::Malformed {
                url: metadata_uri.to_string(),
                message: e.to_string(),
            })?;

        document
            .get("image")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ResolveError::MissingImage(metadata_uri.to_string()))
    }
}

#[async_trait]
impl MediaResolver for HttpMediaResolver {
    #[instrument(skip(self, record), fields(sale_id = %record.id))]
    async fn resolve(&self, record: &SaleRecord) -> Result<MediaFile, ResolveError> {
        let image_uri = self.image_uri(&record.nft.metadata_uri).await?;
        let extension = image_extension(&image_uri);
        let bytes = self.get(&image_uri).await?.bytes().await?.to_vec();

        debug!(
            image_uri = %image_uri,
            extension = %extension,
            size_bytes = bytes.len(),
            "Downloaded sale image"
        );

        Ok(MediaFile { bytes, extension })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::sale_at;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_extension_from_query() {
        assert_eq!(
            image_extension("https://www.arweave.net/abc?ext=gif"),
            "gif"
        );
        assert_eq!(
            image_extension("https://www.arweave.net/abc?foo=1&ext=JPG"),
            "jpg"
        );
        assert_eq!(image_extension("https://www.arweave.net/abc"), "png");
        assert_eq!(image_extension("ipfs-hash?ext=webp"), "webp");
        assert_eq!(image_extension("https://x.y/abc?ext="), "png");
    }

    #[test]
    fn test_media_type() {
        let file = MediaFile {
            bytes: vec![],
            extension: "jpg".to_string(),
        };
        assert_eq!(file.media_type(), "image/jpeg");
        let file = MediaFile {
            bytes: vec![],
            extension: "gif".to_string(),
        };
        assert_eq!(file.media_type(), "image/gif");
    }

    async fn serve(metadata: Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new()
            .route("/meta.json", get(move || async move { Json(metadata) }))
            .route("/image", get(|| async { vec![7u8; 2048] }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn record_at(base: &str) -> SaleRecord {
        let mut record = sale_at("sig", 1_640_995_200);
        record.nft.metadata_uri = format!("{base}/meta.json");
        record
    }

    #[tokio::test]
    async fn test_resolve_downloads_image() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let image = format!("{base}/image?ext=gif");
        let router = Router::new()
            .route(
                "/meta.json",
                get(move || async move { Json(json!({"name": "Bad Bromato", "image": image})) }),
            )
            .route("/image", get(|| async { vec![7u8; 2048] }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let resolver = HttpMediaResolver::with_client(reqwest::Client::new());
        let media = resolver.resolve(&record_at(&base)).await.unwrap();

        assert_eq!(media.extension, "gif");
        assert_eq!(media.bytes.len(), 2048);
    }

    #[tokio::test]
    async fn test_missing_or_non_string_image() {
        let resolver = HttpMediaResolver::with_client(reqwest::Client::new());

        let base = serve(json!({"name": "no image"})).await;
        assert!(matches!(
            resolver.resolve(&record_at(&base)).await,
            Err(ResolveError::MissingImage(_))
        ));

        let base = serve(json!({"image": 42})).await;
        assert!(matches!(
            resolver.resolve(&record_at(&base)).await,
            Err(ResolveError::MissingImage(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_status_error() {
        let resolver = HttpMediaResolver::with_client(reqwest::Client::new());
        let base = serve(json!({})).await;
        let mut record = record_at(&base);
        record.nft.metadata_uri = format!("{base}/missing.json");

        assert!(matches!(
            resolver.resolve(&record).await,
            Err(ResolveError::Status { status: 404, .. })
        ));
    }
}
