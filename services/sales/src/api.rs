use crate::config::ApiConfig;
use crate::publish::next_candidate;
use crate::record::SaleRecord;
use crate::store::{RecordStore, StoreError};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    /// Publication cutoff, used to preview the next sale to publish
    pub cutoff: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn store_failure(e: StoreError) -> ApiError {
    error!(error = %e, "Record store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Failed to query sales".to_string(),
            code: "QUERY_ERROR".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/sales/next", get(next_sale))
        .route("/api/v1/sales/:sale_id", get(get_sale))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sales-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn get_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<String>,
) -> Result<Json<SaleRecord>, ApiError> {
    match state.store.get(&sale_id).await {
        Ok(record) => Ok(Json(record)),
        Err(e) if e.is_not_found() => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Sale not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
        Err(e) => Err(store_failure(e)),
    }
}

/// The sale the publisher would pick next; 204 when there is none.
#[instrument(skip(state))]
async fn next_sale(State(state): State<AppState>) -> Result<Response, ApiError> {
    let candidate = next_candidate(state.store.as_ref(), state.cutoff)
        .await
        .map_err(store_failure)?;

    Ok(match candidate {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting operational API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server error")?;

    Ok(())
}
