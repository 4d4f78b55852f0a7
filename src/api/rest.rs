// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Subscription changes are accepted
// asynchronously: the handler publishes the request and answers 202 before
// the exchange has acknowledged anything. Cache reads are synchronous.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::MarketMirror;
use crate::health::HealthSnapshot;
use crate::types::{Interval, Subscription};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(mirror: Arc<MarketMirror>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Desired set ─────────────────────────────────────────────
        .route(
            "/api/v1/subscriptions",
            get(list_subscriptions)
                .post(request_subscribe)
                .delete(request_unsubscribe),
        )
        .route("/api/v1/refresh", post(force_refresh))
        // ── Cache reads ─────────────────────────────────────────────
        .route("/api/v1/tickers/:symbol", get(ticker))
        .route("/api/v1/candles/:symbol/:interval", get(candles))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(mirror)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    mirror: HealthSnapshot,
}

async fn health(State(mirror): State<Arc<MarketMirror>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        mirror: mirror.health(),
    })
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Serialize)]
struct SubscriptionView {
    #[serde(flatten)]
    subscription: Subscription,
    live: bool,
}

async fn list_subscriptions(State(mirror): State<Arc<MarketMirror>>) -> impl IntoResponse {
    let views: Vec<SubscriptionView> = mirror
        .subscriptions()
        .into_iter()
        .map(|subscription| SubscriptionView {
            live: mirror.is_live(&subscription),
            subscription,
        })
        .collect();
    Json(views)
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    symbol: String,
    #[serde(default)]
    interval: Option<Interval>,
}

impl SubscriptionRequest {
    /// Upper-case the symbol; reject blanks.
    fn normalise(self) -> Result<(String, Option<Interval>), ApiError> {
        let symbol = self.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(api_error(StatusCode::BAD_REQUEST, "symbol must not be empty"));
        }
        let interval = self
            .interval
            .map(|iv| iv.trim().to_string())
            .filter(|iv| !iv.is_empty());
        Ok((symbol, interval))
    }
}

#[derive(Serialize)]
struct AcceptedResponse {
    accepted: bool,
    action: &'static str,
    subscription: Subscription,
}

async fn request_subscribe(
    State(mirror): State<Arc<MarketMirror>>,
    Json(req): Json<SubscriptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (symbol, interval) = req.normalise()?;
    let subscription = Subscription {
        symbol: symbol.clone(),
        interval: interval.clone(),
    };
    info!(subscription = %subscription, "subscribe requested via API");
    mirror.request_subscribe(symbol, interval);

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            action: "subscribe",
            subscription,
        }),
    ))
}

async fn request_unsubscribe(
    State(mirror): State<Arc<MarketMirror>>,
    Query(req): Query<SubscriptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (symbol, interval) = req.normalise()?;
    let subscription = Subscription {
        symbol: symbol.clone(),
        interval: interval.clone(),
    };
    info!(subscription = %subscription, "unsubscribe requested via API");
    mirror.request_unsubscribe(symbol, interval);

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            action: "unsubscribe",
            subscription,
        }),
    ))
}

async fn force_refresh(State(mirror): State<Arc<MarketMirror>>) -> impl IntoResponse {
    let report = mirror.force_refresh().await;
    Json(serde_json::json!({
        "refreshed": report.refreshed,
        "failed": report.failed,
    }))
}

// =============================================================================
// Cache reads
// =============================================================================

async fn ticker(
    State(mirror): State<Arc<MarketMirror>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = symbol.to_uppercase();
    mirror
        .cached_ticker(&symbol)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no cached ticker for {symbol}")))
}

#[derive(Deserialize)]
struct CandleQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn candles(
    State(mirror): State<Arc<MarketMirror>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<CandleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = symbol.to_uppercase();
    let limit = query.limit.unwrap_or_else(|| mirror.candle_capacity());
    mirror
        .cached_candles(&symbol, &interval, limit)
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("no cached candles for {symbol}@{interval}"),
            )
        })
}

// =============================================================================
// Tests
// =============================================================================
