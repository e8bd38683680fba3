//! Publication state machine.
//!
//! One attempt publishes at most one sale: the oldest unpublished record at
//! or after the cutoff. The attempt moves through
//! `Idle → MetadataResolved → MediaUploaded → Posted → Recorded`; a failure
//! in any state aborts it. The only state persisted before `Recorded` is the
//! channel media handle, so a retried attempt skips the upload.

use crate::channel::{ChannelError, MediaUploader, SocialChannel};
use crate::media::{MediaFile, MediaResolver, ResolveError};
use crate::price::to_price_string;
use crate::record::{fields, PublishChannel, PublishDetails, SaleRecord};
use crate::store::{
    Condition, Direction, FieldUpdate, Predicate, QueryValue, RecordStore, StoreError, ValueKind,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PublishFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to encode publish details: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A publish attempt that stopped in `stage`.
#[derive(Error, Debug)]
#[error("Publish failed in state {stage}: {source}")]
pub struct PublishError {
    pub stage: &'static str,
    #[source]
    pub source: PublishFailure,
}

impl PublishError {
    fn at(stage: &'static str, source: impl Into<PublishFailure>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// Fixed message layout for published sales
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub headline: String,
    pub hashtag: String,
    /// Block explorer base; the transaction link is `<explorer>/tx/<id>`
    pub explorer_url: String,
    pub price_threshold: u64,
}

impl MessageTemplate {
    pub fn render(&self, record: &SaleRecord) -> String {
        let mut text = format!("{}\nName: {}\n", self.headline, record.nft.name);

        let price = to_price_string(record.price, self.price_threshold);
        if !price.is_empty() {
            text.push_str(&format!("Price: {price} SOL\n"));
        }

        text.push_str(&format!("Marketplace: {}\n", record.marketplace));

        if let Some(sale_time) = record.sale_time {
            text.push_str(&format!(
                "Sale Time: {}\n",
                sale_time.format("%Y-%m-%d %H:%M:%S %z UTC")
            ));
        }

        text.push_str(&format!(
            "Transaction: {}/tx/{}\n",
            self.explorer_url.trim_end_matches('/'),
            record.id
        ));
        text.push_str(&self.hashtag);
        text
    }
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Records sold before this instant are never published
    pub cutoff: DateTime<Utc>,
    pub template: MessageTemplate,
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing eligible
    Idle,
    Published { sale_id: String, post_id: String },
}

#[derive(Debug)]
enum PublishState {
    Idle,
    MetadataResolved(MediaFile),
    MediaUploaded,
    Posted { post_id: String },
    Recorded { post_id: String },
}

impl PublishState {
    fn name(&self) -> &'static str {
        match self {
            PublishState::Idle => "idle",
            PublishState::MetadataResolved(_) => "metadata_resolved",
            PublishState::MediaUploaded => "media_uploaded",
            PublishState::Posted { .. } => "posted",
            PublishState::Recorded { .. } => "recorded",
        }
    }
}

pub struct Publisher {
    store: Arc<dyn RecordStore>,
    resolver: Arc<dyn MediaResolver>,
    uploader: Arc<dyn MediaUploader>,
    channel: Arc<dyn SocialChannel>,
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        resolver: Arc<dyn MediaResolver>,
        uploader: Arc<dyn MediaUploader>,
        channel: Arc<dyn SocialChannel>,
        settings: PublishSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            uploader,
            channel,
            settings,
        }
    }

    /// Oldest unpublished record at or after the cutoff.
    pub async fn next_candidate(&self) -> Result<Option<SaleRecord>, StoreError> {
        next_candidate(self.store.as_ref(), self.settings.cutoff).await
    }

    /// Run one publish attempt.
    pub async fn run(&self) -> Result<PublishOutcome, PublishError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("publish_run", %run_id);

        async {
            let result = self.attempt().await;
            match &result {
                Ok(PublishOutcome::Idle) => debug!("Nothing to publish"),
                Ok(PublishOutcome::Published { sale_id, post_id }) => {
                    metrics::counter!("sales.publish.published").increment(1);
                    info!(sale_id = %sale_id, post_id = %post_id, "Published sale");
                }
                Err(e) => {
                    metrics::counter!("sales.publish.failures").increment(1);
                    warn!(stage = e.stage, error = %e.source, "Publish attempt aborted");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self) -> Result<PublishOutcome, PublishError> {
        let Some(mut record) = self
            .next_candidate()
            .await
            .map_err(|e| PublishError::at("select", e))?
        else {
            return Ok(PublishOutcome::Idle);
        };

        debug!(sale_id = %record.id, sale_time = ?record.sale_time, "Selected sale");

        let mut state = PublishState::Idle;
        loop {
            let stage = state.name();
            state = self
                .advance(&mut record, state)
                .await
                .map_err(|e| PublishError::at(stage, e))?;

            if let PublishState::Recorded { post_id } = state {
                return Ok(PublishOutcome::Published {
                    sale_id: record.id,
                    post_id,
                });
            }
        }
    }

    async fn advance(
        &self,
        record: &mut SaleRecord,
        state: PublishState,
    ) -> Result<PublishState, PublishFailure> {
        let next = match state {
            PublishState::Idle if record.has_media() => {
                debug!(media_id = %record.media_id, "Reusing uploaded media");
                PublishState::MediaUploaded
            }
            PublishState::Idle => PublishState::MetadataResolved(self.resolver.resolve(record).await?),
            PublishState::MetadataResolved(media) => {
                let media_id = self.uploader.upload(&media).await?;
                self.store
                    .update_fields(&record.id, &[FieldUpdate::new(fields::MEDIA_ID, json!(media_id))])
                    .await?;
                record.media_id = media_id;
                PublishState::MediaUploaded
            }
            PublishState::MediaUploaded => {
                let text = self.settings.template.render(record);
                let post_id = self
                    .channel
                    .post(&text, std::slice::from_ref(&record.media_id))
                    .await?;
                PublishState::Posted { post_id }
            }
            PublishState::Posted { post_id } => {
                let details = PublishDetails {
                    external_post_id: post_id.clone(),
                    channel: PublishChannel::Primary,
                    time: Utc::now(),
                    success: true,
                };
                let updates = [
                    FieldUpdate::new(fields::MEDIA_ID, json!(record.media_id)),
                    FieldUpdate::new(fields::PUBLISH_DETAILS, serde_json::to_value(&details)?),
                ];
                self.store.update_fields(&record.id, &updates).await?;
                record.publish_details = Some(details);
                PublishState::Recorded { post_id }
            }
            recorded @ PublishState::Recorded { .. } => recorded,
        };
        Ok(next)
    }
}

/// Selection shared by the publisher and the operational API.
pub async fn next_candidate(
    store: &dyn RecordStore,
    cutoff: DateTime<Utc>,
) -> Result<Option<SaleRecord>, StoreError> {
    let condition = Condition::new()
        .filter(Predicate::is_null(fields::PUBLISH_DETAILS))
        .filter(Predicate::gte(fields::SALE_TIME, QueryValue::Time(cutoff)))
        .order_by(fields::SALE_TIME, ValueKind::Time, Direction::Asc)
        .limit(1);

    match store.list(&condition).await {
        Ok(records) => Ok(records.into_iter().next()),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
