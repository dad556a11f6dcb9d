//! Forecasting API
//!
//! Commands and queries exposed to the presentation layer. The identity
//! collaborator upstream authenticates the caller and asserts target
//! ownership before owner-only routes are reached; the authenticated user id
//! arrives in the `x-user-id` header.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::coins::CoinLedger;
use crate::forecast::bets::{Bet, BetLedger, BetStatus, BettorStats, Direction};
use crate::forecast::periods::{Period, PeriodManager};
use crate::forecast::settings::{ForecastSettings, SettingsRegistry, TargetKind};
use crate::forecast::ForecastError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coins: Arc<CoinLedger>,
    pub settings: Arc<SettingsRegistry>,
    pub periods: Arc<PeriodManager>,
    pub bets: Arc<BetLedger>,
    pub signup_grant_coins: i64,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/targets/:id/settings", get(get_settings))
        .route("/api/targets/:id/enable", post(enable_forecasting))
        .route("/api/targets/:id/active", post(set_active))
        .route("/api/targets/:id/bounds", post(set_bounds))
        .route("/api/targets/:id/mrr", post(push_verified_mrr))
        .route("/api/targets/:id/disconnect", post(disconnect))
        .route("/api/targets/:id/periods", get(get_periods))
        .route("/api/bets", get(get_bet_history).post(place_bet))
        .route("/api/bets/:id/cancel", post(cancel_bet))
        .route("/api/me/stats", get(get_stats))
        .route("/api/me/balance", get(get_balance))
        .with_state(state)
}

/// Authenticated caller id, injected by the identity collaborator.
fn caller_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_settings(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
) -> Result<Json<ForecastSettings>, ApiError> {
    Ok(Json(state.settings.get(&target_id).await?))
}

async fn enable_forecasting(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<EnableRequest>,
) -> Result<Json<ForecastSettings>, ApiError> {
    caller_id(&headers)?;
    Ok(Json(state.settings.enable(&target_id, req.kind).await?))
}

async fn set_active(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<ForecastSettings>, ApiError> {
    caller_id(&headers)?;
    Ok(Json(state.settings.set_active(&target_id, req.is_active).await?))
}

async fn set_bounds(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetBoundsRequest>,
) -> Result<Json<ForecastSettings>, ApiError> {
    caller_id(&headers)?;
    Ok(Json(
        state
            .settings
            .set_stake_bounds(&target_id, req.min_stake, req.max_stake)
            .await?,
    ))
}

/// Push from the revenue-verification collaborator.
async fn push_verified_mrr(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    Json(req): Json<MrrPushRequest>,
) -> Result<StatusCode, ApiError> {
    let observed_at = req.observed_at.unwrap_or_else(Utc::now);
    state
        .settings
        .update_verified_mrr(&target_id, req.mrr_cents, observed_at)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disconnect(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.settings.on_disconnect(&target_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_periods(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    Query(params): Query<PeriodQuery>,
) -> Result<Json<PeriodsResponse>, ApiError> {
    let current = state.periods.live_period(&target_id).await?;
    let history = state
        .periods
        .history(&target_id, params.limit.unwrap_or(20).min(100))
        .await?;
    Ok(Json(PeriodsResponse { current, history }))
}

async fn place_bet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PlaceBetRequest>,
) -> Result<(StatusCode, Json<Bet>), ApiError> {
    let bettor = caller_id(&headers)?;
    // First forecasting interaction seeds the starter balance
    state
        .coins
        .grant_signup_coins(&bettor, state.signup_grant_coins)
        .await?;
    let bet = state
        .bets
        .place_bet(
            &bettor,
            &req.target_id,
            req.direction,
            req.target_pct,
            req.stake_coins,
            req.idempotency_key.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(bet)))
}

async fn cancel_bet(
    State(state): State<AppState>,
    Path(bet_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Bet>, ApiError> {
    let requester = caller_id(&headers)?;
    Ok(Json(state.bets.cancel_bet(&bet_id, &requester).await?))
}

async fn get_bet_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BetHistoryQuery>,
) -> Result<Json<BetHistoryResponse>, ApiError> {
    let bettor = caller_id(&headers)?;
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => Some(
            BetStatus::from_str(&s.to_ascii_uppercase())
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown bet status: {s}")))?,
        ),
    };
    let bets = state
        .bets
        .history(
            &bettor,
            status,
            params.limit.unwrap_or(50),
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(BetHistoryResponse {
        count: bets.len(),
        bets,
    }))
}

async fn get_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BettorStats>, ApiError> {
    let bettor = caller_id(&headers)?;
    Ok(Json(state.bets.stats(&bettor).await?))
}

async fn get_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = caller_id(&headers)?;
    let balance = state.coins.balance(&user).await?;
    Ok(Json(json!({ "user_id": user, "balance": balance })))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct EnableRequest {
    kind: TargetKind,
}

#[derive(Deserialize)]
struct SetActiveRequest {
    is_active: bool,
}

#[derive(Deserialize)]
struct SetBoundsRequest {
    min_stake: i64,
    max_stake: i64,
}

#[derive(Deserialize)]
struct MrrPushRequest {
    mrr_cents: i64,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct PeriodQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct PlaceBetRequest {
    target_id: String,
    direction: Direction,
    target_pct: f64,
    stake_coins: i64,
    /// Client-supplied key making retries safe against double debits.
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct BetHistoryQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct PeriodsResponse {
    current: Option<Period>,
    history: Vec<Period>,
}

#[derive(Serialize)]
struct BetHistoryResponse {
    count: usize,
    bets: Vec<Bet>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Forecast(ForecastError),
    Unauthorized,
    BadRequest(String),
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        ApiError::Forecast(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Missing or empty x-user-id header".to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Forecast(err) => match err {
                ForecastError::Storage(e) => {
                    tracing::error!("Database error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
                ForecastError::NotConfigured
                | ForecastError::BetNotFound
                | ForecastError::PeriodNotFound => (StatusCode::NOT_FOUND, err.to_string()),
                ForecastError::InsufficientBalance => {
                    (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
                }
                ForecastError::NotBettor => (StatusCode::FORBIDDEN, err.to_string()),
                e if e.is_conflict() => (StatusCode::CONFLICT, err.to_string()),
                _ => (StatusCode::BAD_REQUEST, err.to_string()),
            },
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_errors_map_to_409() {
        let resp = ApiError::Forecast(ForecastError::DuplicateBet).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::Forecast(ForecastError::AlreadyClaimed).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_errors_map_to_400() {
        let resp =
            ApiError::Forecast(ForecastError::StakeOutOfRange { min: 10, max: 100 }).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn insufficient_balance_maps_to_422() {
        let resp = ApiError::Forecast(ForecastError::InsufficientBalance).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
