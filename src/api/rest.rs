// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The snapshot endpoint never touches
// the repository lock on the hot path: `/candles/latest` reads the published
// series straight from the lock-free cache. Range queries go to the
// repository. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::orchestrator::SyncOrchestrator;
use crate::series_cache::SeriesCache;
use crate::storage::TimeSeriesRepository;
use crate::types::{Candle, RepoMetadata, TimeRange};

/// Shared context handed to every handler.
pub struct ApiContext {
    pub cache: Arc<SeriesCache>,
    pub repo: Arc<TimeSeriesRepository>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub ws_feed: tokio::sync::broadcast::Sender<String>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/candles/latest", get(candles_latest))
        .route("/api/v1/candles/range", get(candles_range))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    snapshot_version: u64,
    server_time: i64,
}

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        snapshot_version: ctx.orchestrator.snapshot_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    backfilling: bool,
    live_gap: bool,
    snapshot_version: u64,
    repo: RepoMetadata,
}

async fn status(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(StatusResponse {
        backfilling: ctx.orchestrator.is_backfilling(),
        live_gap: ctx.orchestrator.has_live_gap(),
        snapshot_version: ctx.orchestrator.snapshot_version(),
        repo: ctx.repo.metadata(),
    })
}

// =============================================================================
// Candle queries
// =============================================================================

#[derive(Serialize)]
struct SeriesResponse {
    interval: String,
    first_open: i64,
    last_open: i64,
    count: usize,
    candles: Vec<Candle>,
}

#[derive(Deserialize)]
struct LatestQuery {
    count: Option<usize>,
}

/// Serve the latest published snapshot from the lock-free cache slot.
async fn candles_latest(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<LatestQuery>,
) -> impl IntoResponse {
    let snapshot = ctx.cache.snapshot();

    let count = query.count.unwrap_or(snapshot.len()).min(snapshot.len());
    let start = snapshot.len() - count;
    let candles = snapshot.data[start..].to_vec();

    Json(SeriesResponse {
        interval: snapshot.interval.label(),
        first_open: candles.first().map_or(0, |c| c.open_time),
        last_open: candles.last().map_or(0, |c| c.open_time),
        count: candles.len(),
        candles,
    })
}

#[derive(Deserialize)]
struct RangeQuery {
    start: i64,
    end: i64,
}

async fn candles_range(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    if query.end < query.start {
        return (StatusCode::BAD_REQUEST, "end must be >= start").into_response();
    }

    match ctx.repo.get_range(TimeRange {
        start: query.start,
        end: query.end,
    }) {
        Ok(series) => Json(SeriesResponse {
            interval: series.interval.label(),
            first_open: series.first_open,
            last_open: series.last_open,
            count: series.len(),
            candles: series.data,
        })
        .into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}
