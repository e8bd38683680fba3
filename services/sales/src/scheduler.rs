//! Fixed-interval loops for ingestion and publication.
//!
//! The loops share nothing but the store. Cancellation is checked between
//! units of work; a unit that has started runs to completion (ingestion
//! additionally checks the token between pages).

use crate::ingest::IngestionEngine;
use crate::publish::Publisher;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Call `job` every `period` until `cancel` fires. The first call happens
/// immediately.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(loop_name = name, period_secs = period.as_secs_f64(), "Starting loop");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!(loop_name = name, "Tick");
        job().await;
    }

    info!(loop_name = name, "Loop stopped");
}

/// Ingestion loop. Errors are logged by the engine and retried next tick.
pub async fn run_ingestion(engine: Arc<IngestionEngine>, period: Duration, cancel: CancellationToken) {
    let token = cancel.clone();
    run_periodic("ingestion", period, cancel, || {
        let engine = engine.clone();
        let token = token.clone();
        async move {
            let _ = engine.run(&token).await;
        }
    })
    .await;
}

/// Publication loop, one attempt per tick.
pub async fn run_publication(publisher: Arc<Publisher>, period: Duration, cancel: CancellationToken) {
    run_periodic("publication", period, cancel, || {
        let publisher = publisher.clone();
        async move {
            let _ = publisher.run().await;
        }
    })
    .await;
}
