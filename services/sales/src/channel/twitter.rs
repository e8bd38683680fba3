//! Twitter client: chunked media upload (INIT, APPEND, FINALIZE) and
//! v2 tweet creation, signed with OAuth 1.0a.
//!
//! A 429 on the post step blocks until `x-rate-limit-reset` and then fails;
//! a 429 on an upload call fails at once.

use super::{ChannelError, MediaUploader, OAuthSigner, SocialChannel};
use crate::media::MediaFile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DEFAULT_UPLOAD_URL: &str = "https://upload.twitter.com/1.1/media/upload.json";
pub const DEFAULT_POST_URL: &str = "https://api.twitter.com/2/tweets";

/// Default APPEND segment size
pub const CHUNK_SIZE: usize = 1024 * 1024;

const MEDIA_CATEGORY: &str = "tweet_image";
const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";

#[derive(Deserialize)]
struct InitResponse {
    media_id_string: String,
}

#[derive(Deserialize)]
struct PostResponse {
    data: PostData,
}

#[derive(Deserialize)]
struct PostData {
    id: String,
}

pub struct TwitterClient {
    http: reqwest::Client,
    signer: OAuthSigner,
    upload_url: Url,
    post_url: Url,
    chunk_size: usize,
}

impl TwitterClient {
    pub fn new(
        signer: OAuthSigner,
        upload_url: Url,
        post_url: Url,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, signer, upload_url, post_url))
    }

    pub fn with_client(
        http: reqwest::Client,
        signer: OAuthSigner,
        upload_url: Url,
        post_url: Url,
    ) -> Self {
        Self {
            http,
            signer,
            upload_url,
            post_url,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Override the APPEND segment size. Zero keeps the current size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size > 0 {
            self.chunk_size = chunk_size;
        }
        self
    }

    async fn send_upload_form(
        &self,
        stage: &'static str,
        params: &[(&str, &str)],
    ) -> Result<Response, ChannelError> {
        let authorization = self.signer.authorization("POST", &self.upload_url, params)?;
        let response = self
            .http
            .post(self.upload_url.clone())
            .header(reqwest::header::AUTHORIZATION, authorization)
            .form(params)
            .send()
            .await?;
        check_status(stage, response).await
    }

    async fn init(&self, media: &MediaFile) -> Result<String, ChannelError> {
        let total_bytes = media.bytes.len().to_string();
        let media_type = media.media_type();
        let response = self
            .send_upload_form(
                "init",
                &[
                    ("command", "INIT"),
                    ("total_bytes", total_bytes.as_str()),
                    ("media_type", media_type.as_str()),
                    ("media_category", MEDIA_CATEGORY),
                ],
            )
            .await?;

        let body: InitResponse = response.json().await.map_err(|e| ChannelError::Malformed {
            stage: "init",
            message: e.to_string(),
        })?;
        Ok(body.media_id_string)
    }

    async fn append(
        &self,
        media_id: &str,
        segment_index: usize,
        chunk: &[u8],
    ) -> Result<(), ChannelError> {
        // Multipart fields are not part of the signature base string.
        let authorization = self.signer.authorization("POST", &self.upload_url, &[])?;
        let form = Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment_index.to_string())
            .part("media", Part::bytes(chunk.to_vec()).file_name("media"));

        let response = self
            .http
            .post(self.upload_url.clone())
            .header(reqwest::header::AUTHORIZATION, authorization)
            .multipart(form)
            .send()
            .await?;
        check_status("append", response).await?;

        metrics::counter!("sales.media.bytes_uploaded").increment(chunk.len() as u64);
        Ok(())
    }

    async fn finalize(&self, media_id: &str) -> Result<(), ChannelError> {
        self.send_upload_form("finalize", &[("command", "FINALIZE"), ("media_id", media_id)])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MediaUploader for TwitterClient {
    #[instrument(skip(self, media), fields(size_bytes = media.bytes.len()))]
    async fn upload(&self, media: &MediaFile) -> Result<String, ChannelError> {
        let media_id = self.init(media).await?;

        for (segment_index, chunk) in media.bytes.chunks(self.chunk_size).enumerate() {
            self.append(&media_id, segment_index, chunk).await?;
            debug!(
                media_id = %media_id,
                segment_index,
                chunk_bytes = chunk.len(),
                "Appended media segment"
            );
        }

        self.finalize(&media_id).await?;

        info!(media_id = %media_id, "Uploaded media");
        Ok(media_id)
    }
}

#[async_trait]
impl SocialChannel for TwitterClient {
    #[instrument(skip(self, text))]
    async fn post(&self, text: &str, media_ids: &[String]) -> Result<String, ChannelError> {
        let authorization = self.signer.authorization("POST", &self.post_url, &[])?;
        let response = self
            .http
            .post(self.post_url.clone())
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&json!({
                "text": text,
                "media": { "media_ids": media_ids },
            }))
            .send()
            .await?;
        let response = match check_status("post", response).await {
            Err(ChannelError::RateLimited { reset_at }) => {
                wait_for_reset(reset_at).await;
                return Err(ChannelError::RateLimited { reset_at });
            }
            other => other?,
        };

        let body: PostResponse = response.json().await.map_err(|e| ChannelError::Malformed {
            stage: "post",
            message: e.to_string(),
        })?;

        info!(post_id = %body.data.id, "Posted sale");
        Ok(body.data.id)
    }
}

/// Reset instant advertised by a rate-limited response.
fn rate_limit_reset(response: &Response) -> Option<DateTime<Utc>> {
    response
        .headers()
        .get(RATE_LIMIT_RESET_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Block until a rate limit window resets; returns at once if it already has.
async fn wait_for_reset(reset_at: Option<DateTime<Utc>>) {
    if let Some(wait) = reset_at.and_then(|reset| (reset - Utc::now()).to_std().ok()) {
        debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit reset");
        tokio::time::sleep(wait).await;
    }
}

/// Maps non-2xx responses to errors.
async fn check_status(stage: &'static str, response: Response) -> Result<Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset_at = rate_limit_reset(&response);
        metrics::counter!("sales.publish.rate_limited").increment(1);
        warn!(stage, reset_at = ?reset_at, "Channel rate limit hit");
        return Err(ChannelError::RateLimited { reset_at });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Status {
        stage,
        status: status.as_u16(),
        body,
    })
}
