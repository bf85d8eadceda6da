use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::error::EngineError;
use crate::livepool::{LivePoolEngine, PlacementReceipt, PoolShare, SettlementSummary, StopSummary};
use crate::models::{
    Answer, BadgeKind, Caller, LiveBet, LiveBetOption, OptionList, Prediction, RoundStatus,
    UserBadge, UserSeasonStats,
};
use crate::resolution::{ResolutionEngine, ResolveOutcome};
use crate::store::GameDb;
use crate::verify::{VerificationAgent, VerifyResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: GameDb,
    pub resolution: Arc<ResolutionEngine>,
    pub livepool: Arc<LivePoolEngine>,
    pub agent: Arc<VerificationAgent>,
    /// Shared bearer token gating admin routes. `None` means admin
    /// routes are disabled entirely.
    pub admin_token: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Player surface
        .route("/api/predictions", post(post_prediction))
        .route(
            "/api/users/:user_id/seasons/:season_id/stats",
            get(get_user_stats),
        )
        .route("/api/live-bets/:id", get(get_live_bet))
        .route("/api/live-bets/:id/placements", post(post_placement))
        // Admin surface (bearer token)
        .route("/api/seasons", post(post_season))
        .route("/api/rounds", post(post_round))
        .route("/api/rounds/:id/status", post(post_round_status))
        .route("/api/rounds/:id/resolve", post(post_resolve))
        .route("/api/questions", post(post_question))
        .route("/api/badges", post(post_badge_rule))
        .route("/api/verify/run", post(post_verify_run))
        .route("/api/live-bets", post(post_live_bet))
        .route("/api/live-bets/:id/lock", post(post_live_lock))
        .route("/api/live-bets/:id/resolve", post(post_live_resolve))
        .route("/api/live/emergency-stop", post(post_emergency_stop))
        .with_state(state)
}

/// Bearer-token capability check for admin routes. The engines re-check
/// the capability themselves; this is the HTTP boundary's half.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match supplied {
        Some(token) if token == expected => Ok(Caller::Admin),
        _ => Err(ApiError::Unauthorized),
    }
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn post_prediction(
    State(state): State<AppState>,
    Json(req): Json<PredictionRequest>,
) -> Result<Json<Prediction>, ApiError> {
    let prediction = state
        .db
        .upsert_prediction(
            &req.user_id,
            req.question_id,
            &req.option,
            req.is_risk,
            req.used_joker,
            Utc::now(),
        )
        .await?;
    Ok(Json(prediction))
}

async fn get_user_stats(
    State(state): State<AppState>,
    Path((user_id, season_id)): Path<(String, i64)>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .db
        .get_stats(&user_id, season_id)
        .await?
        .ok_or_else(|| {
            ApiError::from(EngineError::not_found(format!(
                "stats for user {user_id} in season {season_id}"
            )))
        })?;
    let badges = state.db.user_badges(&user_id, season_id).await?;
    Ok(Json(StatsResponse { stats, badges }))
}

async fn get_live_bet(
    State(state): State<AppState>,
    Path(bet_id): Path<i64>,
) -> Result<Json<LiveBetResponse>, ApiError> {
    let bet = state
        .db
        .get_live_bet(bet_id)
        .await?
        .ok_or_else(|| ApiError::from(EngineError::not_found(format!("live bet {bet_id}"))))?;
    let pool = state.livepool.pool_shares(bet_id).await?;
    Ok(Json(LiveBetResponse { bet, pool }))
}

async fn post_placement(
    State(state): State<AppState>,
    Path(bet_id): Path<i64>,
    Json(req): Json<PlacementRequest>,
) -> Result<Json<PlacementReceipt>, ApiError> {
    let receipt = state
        .livepool
        .place(&req.user_id, bet_id, &req.option, req.stake, Utc::now())
        .await?;
    Ok(Json(receipt))
}

async fn post_season(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SeasonRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let id = state.db.create_season(&req.name, &req.show_name).await?;
    Ok(Json(CreatedResponse { id }))
}

async fn post_round(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RoundRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let id = state
        .db
        .create_round(req.season_id, req.number, req.airs_at, req.locks_at)
        .await?;
    Ok(Json(CreatedResponse { id }))
}

async fn post_round_status(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<RoundStatusRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;
    let next = RoundStatus::parse(&req.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status {:?}", req.status)))?;
    state.db.advance_round_status(round_id, next).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_resolve(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveOutcome>, ApiError> {
    let caller = require_admin(&state, &headers)?;
    let outcome = state
        .resolution
        .resolve(&caller, round_id, &req.answers)
        .await?;
    Ok(Json(outcome))
}

async fn post_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QuestionRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let options = OptionList::new(req.options)?;
    let id = state
        .db
        .create_question(req.round_id, &req.prompt, &req.kind, req.odds, &options)
        .await?;
    Ok(Json(CreatedResponse { id }))
}

async fn post_badge_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BadgeRuleRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let kind = BadgeKind::parse(&req.kind)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown badge kind {:?}", req.kind)))?;
    let id = state.db.add_badge_rule(&req.name, kind, req.threshold).await?;
    Ok(Json(CreatedResponse { id }))
}

async fn post_verify_run(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<VerifyResult>>, ApiError> {
    require_admin(&state, &headers)?;
    let results = state.agent.verify_pending().await?;
    Ok(Json(results))
}

async fn post_live_bet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LiveBetRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let id = state
        .db
        .create_live_bet(
            &req.prompt,
            &req.category,
            &req.options,
            req.opens_at,
            req.locks_at,
            req.multiplier,
        )
        .await?;
    Ok(Json(CreatedResponse { id }))
}

async fn post_live_lock(
    State(state): State<AppState>,
    Path(bet_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<LiveBet>, ApiError> {
    let caller = require_admin(&state, &headers)?;
    let bet = state.livepool.lock(&caller, bet_id).await?;
    Ok(Json(bet))
}

async fn post_live_resolve(
    State(state): State<AppState>,
    Path(bet_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<LiveResolveRequest>,
) -> Result<Json<SettlementSummary>, ApiError> {
    let caller = require_admin(&state, &headers)?;
    let summary = state
        .livepool
        .settle(&caller, bet_id, &req.correct_option)
        .await?;
    Ok(Json(summary))
}

async fn post_emergency_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StopSummary>, ApiError> {
    let caller = require_admin(&state, &headers)?;
    let summary = state.livepool.emergency_stop(&caller).await?;
    Ok(Json(summary))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct PredictionRequest {
    user_id: String,
    question_id: i64,
    option: String,
    #[serde(default)]
    is_risk: bool,
    #[serde(default)]
    used_joker: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    stats: UserSeasonStats,
    badges: Vec<UserBadge>,
}

#[derive(Serialize)]
struct LiveBetResponse {
    bet: LiveBet,
    pool: Vec<PoolShare>,
}

#[derive(Deserialize)]
struct PlacementRequest {
    user_id: String,
    option: String,
    stake: i64,
}

#[derive(Deserialize)]
struct SeasonRequest {
    name: String,
    show_name: String,
}

#[derive(Deserialize)]
struct RoundRequest {
    season_id: i64,
    number: i64,
    airs_at: DateTime<Utc>,
    locks_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RoundStatusRequest {
    status: String,
}

#[derive(Deserialize)]
struct ResolveRequest {
    answers: Vec<Answer>,
}

#[derive(Deserialize)]
struct QuestionRequest {
    round_id: i64,
    prompt: String,
    kind: String,
    odds: i32,
    options: Vec<String>,
}

#[derive(Deserialize)]
struct BadgeRuleRequest {
    name: String,
    kind: String,
    threshold: i64,
}

#[derive(Deserialize)]
struct LiveBetRequest {
    prompt: String,
    category: String,
    options: Vec<LiveBetOption>,
    opens_at: DateTime<Utc>,
    locks_at: DateTime<Utc>,
    multiplier: f64,
}

#[derive(Deserialize)]
struct LiveResolveRequest {
    correct_option: String,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: i64,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Engine(EngineError),
    Unauthorized,
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unauthorized => ApiError::Unauthorized,
            other => ApiError::Engine(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Engine(EngineError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, msg.clone())
            }
            ApiError::Engine(EngineError::InvalidState(msg)) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            ApiError::Engine(EngineError::Upstream(msg)) => {
                tracing::warn!("upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            ApiError::Engine(err) => {
                tracing::error!("internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
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

    fn state_with_token(token: Option<&str>) -> AppState {
        let db = GameDb::in_memory().unwrap();
        let (events, _rx) = crate::events::channel(16);
        let resolution = Arc::new(ResolutionEngine::new(
            db.clone(),
            crate::scoring::StreakConfig::default(),
            3,
            events.clone(),
        ));
        let livepool = Arc::new(LivePoolEngine::new(db.clone(), events.clone()));
        let agent = Arc::new(VerificationAgent::new(
            db.clone(),
            resolution.clone(),
            Arc::new(DenySearch),
            Arc::new(DenyExtractor),
            crate::verify::VerifyConfig::default(),
        ));
        AppState {
            db,
            resolution,
            livepool,
            agent,
            admin_token: token.map(str::to_string),
        }
    }

    struct DenySearch;

    #[async_trait::async_trait]
    impl crate::verify::EvidenceSearch for DenySearch {
        async fn search(
            &self,
            _queries: &[String],
            _max_results: usize,
        ) -> Result<crate::verify::SearchResponse, EngineError> {
            Err(EngineError::upstream("not configured"))
        }
    }

    struct DenyExtractor;

    #[async_trait::async_trait]
    impl crate::verify::AnswerExtractor for DenyExtractor {
        async fn extract(
            &self,
            _evidence: &str,
            _questions: &[crate::verify::QuestionSpec],
            _show_context: &str,
        ) -> Result<Vec<crate::verify::ExtractedAnswer>, EngineError> {
            Err(EngineError::upstream("not configured"))
        }
    }

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn admin_check_accepts_matching_bearer_token() {
        let state = state_with_token(Some("s3cret"));
        let caller = require_admin(&state, &headers_with_bearer("s3cret")).unwrap();
        assert!(caller.is_admin());
    }

    #[test]
    fn admin_check_rejects_wrong_or_missing_token() {
        let state = state_with_token(Some("s3cret"));
        assert!(require_admin(&state, &headers_with_bearer("nope")).is_err());
        assert!(require_admin(&state, &HeaderMap::new()).is_err());
    }

    #[test]
    fn admin_routes_disabled_without_configured_token() {
        let state = state_with_token(None);
        assert!(require_admin(&state, &headers_with_bearer("anything")).is_err());
    }

    #[test]
    fn engine_errors_map_to_expected_status_codes() {
        let cases = [
            (
                ApiError::from(EngineError::not_found("round 1")),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(EngineError::invalid("round is locked")),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(EngineError::Unauthorized),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(EngineError::upstream("tavily 500")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::BadRequest("bad status".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
