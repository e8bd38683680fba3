//! Ingestion engine.
//!
//! Walks the activity feed from the newest entry backwards, resolving each
//! unseen entry into a [`SaleRecord`], and stops at the first entry the store
//! already holds. The feed is assumed to be monotonically decreasing in time,
//! so that entry is a watermark past which everything has been captured.
//!
//! Records are buffered and created one by one on flush. A flush happens
//! when the buffer grows past the threshold and when the walk terminates,
//! including on shutdown, which is only observed between pages. Errors
//! discard the buffer.

use crate::marketplace::{identify_parties, Marketplace, NoiseFilter, Parties};
use crate::record::{fields, SaleRecord};
use crate::retry::{RetryError, RetryPolicy};
use crate::source::{
    ActivitySource, Cursor, MetadataLookup, PageRequest, RawActivity, SourceError, TradeDetail,
};
use crate::store::{self, Condition, Direction, Predicate, QueryValue, RecordStore, StoreError, ValueKind};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Ingestion errors; each one aborts the current run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to fetch activity page: {0}")]
    Source(#[source] RetryError<SourceError>),

    #[error("Failed to load activity {id}: {source}")]
    Detail {
        id: String,
        source: RetryError<SourceError>,
    },

    #[error("Failed to resolve metadata for mint {mint}: {source}")]
    Metadata {
        mint: String,
        source: RetryError<SourceError>,
    },

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to create record {id} after {created} created in this run: {source}")]
    Flush {
        id: String,
        created: u32,
        source: StoreError,
    },
}

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Collection written into every record
    pub collection: String,
    /// Flush once the buffer holds more than this many records
    pub flush_threshold: usize,
    /// Politeness delay after each entry
    pub entry_delay: Duration,
    /// Delay between pages
    pub page_delay: Duration,
    pub retry: RetryPolicy,
    pub noise_filter: NoiseFilter,
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The source returned an empty page
    #[default]
    Exhausted,
    /// An entry already in the store was reached
    CaughtUp,
    /// Shutdown was requested between pages
    Cancelled,
}

/// Summary of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: u32,
    pub created: u32,
    pub skipped: u32,
    pub stop: StopReason,
}

/// What became of a single feed entry
#[derive(Debug)]
enum EntryOutcome {
    Sale(Box<SaleRecord>),
    Skip { reason: &'static str },
}

pub struct IngestionEngine {
    source: Arc<dyn ActivitySource>,
    metadata: Arc<dyn MetadataLookup>,
    store: Arc<dyn RecordStore>,
    settings: IngestSettings,
}

impl IngestionEngine {
    pub fn new(
        source: Arc<dyn ActivitySource>,
        metadata: Arc<dyn MetadataLookup>,
        store: Arc<dyn RecordStore>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            source,
            metadata,
            store,
            settings,
        }
    }

    /// Run one ingestion pass.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<IngestReport, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.name());

        async {
            metrics::counter!("sales.ingest.runs").increment(1);
            let result = self.walk(cancel).await;
            match &result {
                Ok(report) => info!(
                    pages = report.pages,
                    created = report.created,
                    skipped = report.skipped,
                    stop = ?report.stop,
                    "Ingestion run finished"
                ),
                Err(e) => {
                    metrics::counter!("sales.ingest.failures").increment(1);
                    warn!(error = %e, "Ingestion run aborted");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Cursor of the oldest stored sale; the store is complete past it.
    async fn watermark(&self) -> Result<Option<Cursor>, IngestError> {
        let condition = Condition::new()
            .filter(Predicate::eq(
                fields::COLLECTION,
                QueryValue::Text(self.settings.collection.clone()),
            ))
            .filter(Predicate::is_not_null(fields::SALE_TIME))
            .order_by(fields::SALE_TIME, ValueKind::Time, Direction::Asc)
            .limit(1);

        match self.store.list(&condition).await {
            Ok(records) => Ok(records.first().and_then(|r| self.source.cursor_for(r))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn walk(&self, cancel: &CancellationToken) -> Result<IngestReport, IngestError> {
        let until = self.watermark().await?;
        let mut before: Option<Cursor> = None;
        let mut buffer: Vec<SaleRecord> = Vec::new();
        let mut buffered_ids: HashSet<String> = HashSet::new();
        let mut report = IngestReport::default();
        let mut done = false;

        debug!(until = ?until, "Starting walk");

        while !done {
            if cancel.is_cancelled() {
                info!(buffered = buffer.len(), "Shutdown requested, stopping walk");
                report.stop = StopReason::Cancelled;
                break;
            }

            let request = PageRequest {
                before: before.clone(),
                until: until.clone(),
                limit: self.source.page_limit(),
            };
            let mut page = self
                .settings
                .retry
                .execute("fetch_page", || self.source.fetch_page(&request))
                .await
                .map_err(IngestError::Source)?;

            if page.is_empty() {
                report.stop = StopReason::Exhausted;
                break;
            }
            report.pages += 1;

            // newest first; entries without a time sort last
            page.sort_by(|a, b| b.event_time.cmp(&a.event_time));

            for activity in &page {
                if store::contains(self.store.as_ref(), &activity.id).await? {
                    debug!(signature = %activity.id, "Reached stored sale");
                    report.stop = StopReason::CaughtUp;
                    done = true;
                    break;
                }

                if buffered_ids.contains(&activity.id) {
                    continue;
                }

                match self.resolve(activity).await? {
                    EntryOutcome::Sale(record) => {
                        debug!(
                            signature = %record.id,
                            marketplace = %record.marketplace,
                            price = record.price,
                            "Buffered sale"
                        );
                        buffered_ids.insert(record.id.clone());
                        buffer.push(*record);
                    }
                    EntryOutcome::Skip { reason } => {
                        debug!(signature = %activity.id, reason = reason, "Skipped entry");
                        metrics::counter!("sales.ingest.skipped", "reason" => reason).increment(1);
                        report.skipped += 1;
                    }
                }

                tokio::time::sleep(self.settings.entry_delay).await;
            }

            before = page.last().map(|activity| activity.cursor.clone());

            if buffer.len() > self.settings.flush_threshold {
                self.flush(&mut buffer, &mut report).await?;
                buffered_ids.clear();
            }

            if !done {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.page_delay) => {}
                }
            }
        }

        self.flush(&mut buffer, &mut report).await?;
        Ok(report)
    }

    /// Turn a feed entry into a sale, or explain why it is not one.
    async fn resolve(&self, activity: &RawActivity) -> Result<EntryOutcome, IngestError> {
        if activity.failed {
            return Ok(EntryOutcome::Skip {
                reason: "failed_transaction",
            });
        }

        let detail = self
            .settings
            .retry
            .execute("load_detail", || self.source.load_detail(activity))
            .await
            .map_err(|source| IngestError::Detail {
                id: activity.id.clone(),
                source,
            })?;

        let Some(detail) = detail else {
            return Ok(EntryOutcome::Skip {
                reason: "not_a_trade",
            });
        };

        let Some(marketplace) = detail
            .marketplace
            .or_else(|| Marketplace::classify(&detail.account_keys))
        else {
            return Ok(EntryOutcome::Skip {
                reason: "unknown_marketplace",
            });
        };

        if self.settings.noise_filter.is_noise(marketplace, detail.price) {
            return Ok(EntryOutcome::Skip {
                reason: "below_minimum_price",
            });
        }

        let Some(sale_time) = activity.event_time.or(detail.time) else {
            warn!(signature = %activity.id, "Sale has no event time");
            return Ok(EntryOutcome::Skip {
                reason: "missing_time",
            });
        };

        let parties = parties_for(marketplace, &detail);

        let nft = self
            .settings
            .retry
            .execute("nft_metadata", || self.metadata.nft_metadata(&detail.mint))
            .await
            .map_err(|source| IngestError::Metadata {
                mint: detail.mint.clone(),
                source,
            })?;

        Ok(EntryOutcome::Sale(Box::new(SaleRecord {
            id: activity.id.clone(),
            buyer: parties.buyer,
            seller: parties.seller,
            collection: self.settings.collection.clone(),
            marketplace,
            mint_pubkey: detail.mint,
            price: detail.price,
            sale_time: Some(sale_time),
            created_at: None,
            nft,
            publish_details: None,
            media_id: String::new(),
        })))
    }

    /// Create buffered records oldest first; the first failure aborts the run.
    async fn flush(
        &self,
        buffer: &mut Vec<SaleRecord>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        if buffer.is_empty() {
            return Ok(());
        }

        info!(count = buffer.len(), "Flushing buffered sales");

        for mut record in buffer.drain(..).rev() {
            record.created_at = Some(Utc::now());
            if let Err(source) = self.store.create(&record).await {
                return Err(IngestError::Flush {
                    id: record.id,
                    created: report.created,
                    source,
                });
            }
            report.created += 1;
            metrics::counter!("sales.ingest.created").increment(1);
        }

        Ok(())
    }
}

/// Counterparties reported by the feed win over balance heuristics.
fn parties_for(marketplace: Marketplace, detail: &TradeDetail) -> Parties {
    if detail.buyer.is_some() || detail.seller.is_some() {
        return Parties {
            buyer: detail.buyer.clone(),
            seller: detail.seller.clone(),
        };
    }
    identify_parties(
        marketplace,
        &detail.account_keys,
        &detail.pre_balances,
        &detail.post_balances,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::sale_at;
    use crate::record::NftInfo;
    use crate::source::MockMetadataLookup;
    use crate::store::memory::MemoryStore;
    use crate::store::MockRecordStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const MAGIC_EDEN: &str = "MEisE1HzehtrDpAAT8PnLHjpSSkRYakotTuJRPjTpo8";
    const SOLSEA: &str = "617jbWo616ggkDxvW1Le8pV38XLbVSyWY8ae6QUmGBAU";

    /// Serves scripted pages and records every request.
    #[derive(Default)]
    struct ScriptedSource {
        pages: Mutex<VecDeque<Vec<RawActivity>>>,
        requests: Mutex<Vec<PageRequest>>,
        /// Cancel the token once this many pages have been requested
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Vec<RawActivity>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<PageRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActivitySource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn page_limit(&self) -> u32 {
            50
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawActivity>, SourceError> {
            let fetched = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            if let Some((after, cancel)) = &self.cancel_after {
                if fetched >= *after {
                    cancel.cancel();
                }
            }
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn load_detail(
            &self,
            activity: &RawActivity,
        ) -> Result<Option<TradeDetail>, SourceError> {
            Ok(activity.detail.clone())
        }

        fn cursor_for(&self, record: &SaleRecord) -> Option<Cursor> {
            Some(Cursor::Signature(record.id.clone()))
        }
    }

    fn entry(id: &str, unix_secs: i64, program: &str, price: u64) -> RawActivity {
        RawActivity {
            id: id.to_string(),
            cursor: Cursor::Signature(id.to_string()),
            event_time: Utc.timestamp_opt(unix_secs, 0).single(),
            failed: false,
            detail: Some(TradeDetail {
                mint: format!("mint-{id}"),
                price,
                marketplace: None,
                account_keys: vec!["buyer".into(), "seller".into(), program.into()],
                pre_balances: vec![price + 5_000, 0, 0],
                post_balances: vec![0, price, 0],
                ..Default::default()
            }),
        }
    }

    fn sale(id: &str, unix_secs: i64) -> RawActivity {
        entry(id, unix_secs, MAGIC_EDEN, 1_000_000_000)
    }

    fn metadata() -> Arc<MockMetadataLookup> {
        let mut mock = MockMetadataLookup::new();
        mock.expect_nft_metadata().returning(|mint: &str| {
            Ok(NftInfo {
                name: format!("Bad Bromato {mint}"),
                symbol: "BROM".to_string(),
                metadata_uri: format!("https://arweave.net/{mint}"),
            })
        });
        Arc::new(mock)
    }

    fn settings(flush_threshold: usize) -> IngestSettings {
        IngestSettings {
            collection: "bad-bromatoes".to_string(),
            flush_threshold,
            entry_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            retry: RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(5)),
            noise_filter: NoiseFilter::new(HashMap::from([(Marketplace::Solsea, 90_000_000)])),
        }
    }

    fn engine(source: Arc<ScriptedSource>, store: Arc<dyn RecordStore>) -> IngestionEngine {
        IngestionEngine::new(source, metadata(), store, settings(500))
    }

    #[tokio::test]
    async fn test_stops_at_first_stored_entry() {
        let store = Arc::new(MemoryStore::with_records([sale_at("B", 4)]));
        let source = Arc::new(ScriptedSource::new(vec![vec![
            sale("A", 5),
            sale("B", 4),
            sale("C", 3),
        ]]));

        let report = engine(source.clone(), store.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::CaughtUp);
        assert_eq!(report.created, 1);
        assert_eq!(store.create_calls(), vec!["A"]);
        assert!(store.record("C").is_none());
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let feed = vec![sale("A", 5), sale("B", 4), sale("C", 3)];
        let source = Arc::new(ScriptedSource::new(vec![feed.clone(), vec![], feed]));
        let engine = engine(source.clone(), store.clone());

        let first = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.created, 3);
        assert_eq!(first.stop, StopReason::Exhausted);

        let second = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.stop, StopReason::CaughtUp);
        assert_eq!(store.create_calls().len(), 3);

        // the second run is bounded by the oldest stored sale
        let requests = source.requests();
        assert_eq!(requests[2].until, Some(Cursor::Signature("C".into())));
    }

    #[tokio::test]
    async fn test_unordered_page_is_sorted_before_dedup() {
        let store = Arc::new(MemoryStore::with_records([sale_at("B", 4)]));
        let source = Arc::new(ScriptedSource::new(vec![vec![
            sale("C", 3),
            sale("A", 5),
            sale("B", 4),
        ]]));

        engine(source, store.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.create_calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_cursor_advances_and_flush_is_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(ScriptedSource::new(vec![
            vec![sale("A", 5), sale("B", 4)],
            vec![sale("C", 3)],
        ]));

        let report = engine(source.clone(), store.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(store.create_calls(), vec!["C", "B", "A"]);

        let requests = source.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].before, None);
        assert_eq!(requests[0].until, None);
        assert_eq!(requests[1].before, Some(Cursor::Signature("B".into())));
        assert_eq!(requests[2].before, Some(Cursor::Signature("C".into())));

        let record = store.record("A").unwrap();
        assert!(record.created_at.is_some());
        assert_eq!(record.collection, "bad-bromatoes");
        assert_eq!(record.marketplace, Marketplace::MagicEden);
        assert_eq!(record.nft.name, "Bad Bromato mint-A");
        assert_eq!(record.buyer.as_deref(), Some("buyer"));
        assert_eq!(record.seller.as_deref(), Some("seller"));
        assert!(record.publish_details.is_none());
    }

    #[tokio::test]
    async fn test_unknown_marketplace_and_noise_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut failed = sale("F", 1);
        failed.failed = true;
        let source = Arc::new(ScriptedSource::new(vec![vec![
            entry("U", 5, "11111111111111111111111111111111", 1_000_000_000),
            entry("N", 4, SOLSEA, 10_000_000),
            entry("S", 3, SOLSEA, 500_000_000),
            failed,
        ]]));

        let report = engine(source, store.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, 3);
        assert_eq!(store.create_calls(), vec!["S"]);
        assert_eq!(store.record("S").unwrap().marketplace, Marketplace::Solsea);
    }

    #[tokio::test]
    async fn test_feed_counterparties_take_precedence() {
        let store = Arc::new(MemoryStore::new());
        let mut activity = sale("A", 5);
        if let Some(detail) = activity.detail.as_mut() {
            detail.marketplace = Some(Marketplace::AlphaArt);
            detail.account_keys.clear();
            detail.buyer = Some("feed-buyer".into());
            detail.seller = Some("feed-seller".into());
        }
        let source = Arc::new(ScriptedSource::new(vec![vec![activity]]));

        engine(source, store.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let record = store.record("A").unwrap();
        assert_eq!(record.marketplace, Marketplace::AlphaArt);
        assert_eq!(record.buyer.as_deref(), Some("feed-buyer"));
        assert_eq!(record.seller.as_deref(), Some("feed-seller"));
    }

    #[tokio::test]
    async fn test_flush_failure_aborts_run() {
        let mut store = MockRecordStore::new();
        store
            .expect_list()
            .returning(|_| Err(StoreError::NotFound("empty".into())));
        store
            .expect_get()
            .returning(|id: &str| Err(StoreError::NotFound(id.to_string())));
        store
            .expect_create()
            .times(2)
            .returning(|record: &SaleRecord| {
                if record.id == "A" {
                    Err(StoreError::Conflict(record.id.clone()))
                } else {
                    Ok(())
                }
            });

        let source = Arc::new(ScriptedSource::new(vec![
            vec![sale("A", 5), sale("B", 4)],
            vec![sale("C", 3)],
        ]));
        let engine = IngestionEngine::new(source.clone(), metadata(), Arc::new(store), settings(1));

        let error = engine.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            error,
            IngestError::Flush { ref id, created: 1, .. } if id == "A"
        ));
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_finishes_page_and_flushes() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let source = Arc::new(ScriptedSource {
            pages: Mutex::new(VecDeque::from([vec![sale("A", 5)], vec![sale("B", 4)]])),
            cancel_after: Some((1, cancel.clone())),
            ..Default::default()
        });

        let report = engine(source.clone(), store.clone())
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::Cancelled);
        assert_eq!(report.pages, 1);
        assert_eq!(report.created, 1);
        assert_eq!(store.create_calls(), vec!["A"]);
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_after_threshold_flush_keeps_older_sales() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let first_page = vec![sale("A", 5), sale("B", 4)];
        let source = Arc::new(ScriptedSource {
            pages: Mutex::new(VecDeque::from([
                first_page.clone(),
                vec![sale("C", 3)],
                first_page,
            ])),
            cancel_after: Some((2, cancel.clone())),
            ..Default::default()
        });
        let engine = IngestionEngine::new(source.clone(), metadata(), store.clone(), settings(1));

        let first = engine.run(&cancel).await.unwrap();
        assert_eq!(first.stop, StopReason::Cancelled);
        assert_eq!(store.create_calls(), vec!["B", "A", "C"]);

        // the next run stops at the newest stored sale and misses nothing
        let second = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.stop, StopReason::CaughtUp);
        assert_eq!(second.created, 0);
        for id in ["A", "B", "C"] {
            assert!(store.record(id).is_some(), "sale {id} was not ingested");
        }
    }

    #[tokio::test]
    async fn test_source_error_surfaces() {
        struct Broken;

        #[async_trait]
        impl ActivitySource for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn page_limit(&self) -> u32 {
                20
            }
            async fn fetch_page(&self, _: &PageRequest) -> Result<Vec<RawActivity>, SourceError> {
                Err(SourceError::Malformed("no history field".into()))
            }
            async fn load_detail(&self, _: &RawActivity) -> Result<Option<TradeDetail>, SourceError> {
                Ok(None)
            }
            fn cursor_for(&self, _: &SaleRecord) -> Option<Cursor> {
                None
            }
        }

        let engine = IngestionEngine::new(
            Arc::new(Broken),
            metadata(),
            Arc::new(MemoryStore::new()),
            settings(500),
        );
        let error = engine.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            error,
            IngestError::Source(RetryError::Failed(SourceError::Malformed(_)))
        ));
    }
}
