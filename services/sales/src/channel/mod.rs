//! Publishing channel: chunked media upload and posting.

pub mod oauth;
pub mod twitter;

use crate::media::MediaFile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use oauth::{OAuthCredentials, OAuthSigner};
pub use twitter::TwitterClient;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Rate limited until {reset_at:?}")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("{stage} failed with status {status}: {body}")]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },

    #[error("Malformed {stage} response: {message}")]
    Malformed {
        stage: &'static str,
        message: String,
    },

    #[error("Failed to sign request: {0}")]
    Signing(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Uploads media and returns the channel's media handle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, media: &MediaFile) -> Result<String, ChannelError>;
}

/// Posts a message with attached media and returns the external post id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SocialChannel: Send + Sync {
    async fn post(&self, text: &str, media_ids: &[String]) -> Result<String, ChannelError>;
}
