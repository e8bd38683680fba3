use anyhow::{Context, Result};
use sales_service::api::{start_api_server, AppState};
use sales_service::channel::{OAuthSigner, TwitterClient};
use sales_service::config::{Config, LogFormat, ServiceConfig, SourceKind};
use sales_service::media::HttpMediaResolver;
use sales_service::scheduler;
use sales_service::source::alpha_art::AlphaArtSource;
use sales_service::source::solana::{SolanaRpcClient, SolanaSource};
use sales_service::source::ActivitySource;
use sales_service::{
    IngestSettings, IngestionEngine, MessageTemplate, PostgresStore, PublishSettings, Publisher,
    RecordStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        source = ?config.source.kind,
        collection = %config.source.collection_id,
        "Starting Bromato Sales Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let postgres = PostgresStore::new(&config.database)
        .await
        .context("Failed to initialize record store")?;

    if config.database.run_migrations {
        postgres
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store: Arc<dyn RecordStore> = Arc::new(postgres);
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    if config.ingestion.enabled {
        let engine = Arc::new(build_ingestion(&config, store.clone())?);
        let period = config.ingestion.interval();
        handles.push(tokio::spawn(scheduler::run_ingestion(engine, period, cancel.clone())));
    }

    if config.publication.enabled {
        let publisher = Arc::new(build_publisher(&config, store.clone())?);
        let period = config.publication.interval();
        handles.push(tokio::spawn(scheduler::run_publication(
            publisher,
            period,
            cancel.clone(),
        )));
    }

    // Spawn API server task
    let api_state = AppState {
        store: store.clone(),
        cutoff: config.publication.cutoff,
    };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "API server error");
        }
    }));

    info!("Sales service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down sales service, waiting for in-flight work");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Task terminated abnormally");
        }
    }

    info!("Sales service stopped");

    Ok(())
}

fn build_ingestion(config: &Config, store: Arc<dyn RecordStore>) -> Result<IngestionEngine> {
    let source_config = &config.source;
    let rpc = Arc::new(
        SolanaRpcClient::new(
            &source_config.rpc_url,
            &source_config.commitment,
            source_config.request_timeout(),
        )
        .context("Failed to initialize Solana RPC client")?,
    );

    let source: Arc<dyn ActivitySource> = match source_config.kind {
        SourceKind::Solana => Arc::new(SolanaSource::new(
            rpc.clone(),
            &source_config.royalty_address,
            source_config.page_limit,
        )),
        SourceKind::AlphaArt => Arc::new(
            AlphaArtSource::new(
                &source_config.alpha_art_url,
                &source_config.collection_id,
                source_config.page_limit,
                source_config.request_timeout(),
            )
            .context("Failed to initialize Alpha Art client")?,
        ),
    };

    let settings = IngestSettings {
        collection: source_config.collection_id.clone(),
        flush_threshold: config.ingestion.flush_threshold,
        entry_delay: config.ingestion.entry_delay(),
        page_delay: config.ingestion.page_delay(),
        retry: config.ingestion.retry_policy(),
        noise_filter: config.ingestion.noise_filter(),
    };

    Ok(IngestionEngine::new(source, rpc, store, settings))
}

fn build_publisher(config: &Config, store: Arc<dyn RecordStore>) -> Result<Publisher> {
    let channel_config = &config.channel;
    let upload_url = Url::parse(&channel_config.upload_url).context("Invalid channel.upload_url")?;
    let post_url = Url::parse(&channel_config.post_url).context("Invalid channel.post_url")?;

    let twitter = Arc::new(
        TwitterClient::new(
            OAuthSigner::new(channel_config.credentials.clone()),
            upload_url,
            post_url,
            channel_config.request_timeout(),
        )
        .context("Failed to initialize channel client")?
        .with_chunk_size(channel_config.chunk_size),
    );

    let resolver = Arc::new(
        HttpMediaResolver::new(config.publication.download_timeout())
            .context("Failed to initialize media resolver")?,
    );

    let settings = PublishSettings {
        cutoff: config.publication.cutoff,
        template: MessageTemplate {
            headline: config.publication.headline.clone(),
            hashtag: config.publication.hashtag.clone(),
            explorer_url: config.publication.explorer_url.clone(),
            price_threshold: config.publication.price_threshold,
        },
    };

    Ok(Publisher::new(
        store,
        resolver,
        twitter.clone(),
        twitter,
        settings,
    ))
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match service.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
