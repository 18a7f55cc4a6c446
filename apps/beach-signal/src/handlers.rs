use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::auth::{extract_bearer, AuthError, TokenPair, VerifiedIdentity};
use crate::registry::SessionSummary;
use crate::signaling::{Identity, Role};
use crate::state::AppState;
use crate::websocket::websocket_handler;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(&'static str),
    BadRequest(String),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.to_string())),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        counter!("beach_signal_auth_failures_total", 1, "reason" => err.metric_label());
        debug!(error = %err, "rejected credential");
        ApiError::Unauthorized
    }
}

/// Verifies the request's bearer token.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<VerifiedIdentity, ApiError> {
    let token = extract_bearer(headers, None).ok_or(AuthError::MissingToken)?;
    Ok(state.verifier.verify(&token)?)
}

pub fn build_router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .route("/producers", get(list_producers))
        .route("/first", get(first_producer))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics));

    if state.issuer.is_some() {
        router = router
            .route("/tokens/:role", get(issue_tokens))
            // Path used by the bundled browser pages.
            .route("/create/:role", get(issue_tokens))
            .route("/refresh", post(refresh_token));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "beach-signal",
        "sessions": state.registry.len(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProducersResponse {
    pub producers: Vec<Identity>,
}

pub async fn list_producers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<ProducersResponse> {
    authorize(&state, &headers)?;
    let mut producers = state.registry.list_by_role(Role::Producer);
    producers.sort();
    Ok(Json(ProducersResponse { producers }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FirstProducerResponse {
    pub first: Identity,
}

pub async fn first_producer(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<FirstProducerResponse> {
    let caller = authorize(&state, &headers)?;
    state
        .registry
        .first_by_role(Role::Producer, Some(&caller.identity))
        .map(|session| {
            Json(FirstProducerResponse {
                first: session.identity().clone(),
            })
        })
        .ok_or(ApiError::NotFound("no producer connected"))
}

pub async fn issue_tokens(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> ApiResult<TokenPair> {
    let issuer = state
        .issuer
        .as_ref()
        .ok_or(ApiError::NotFound("token issuer disabled"))?;
    let role: Role = role
        .parse()
        .map_err(|err: crate::signaling::UnknownRole| ApiError::BadRequest(err.to_string()))?;

    let user_id = state.ids.next_id().map_err(|err| {
        error!(error = %err, "failed to generate user id");
        ApiError::Internal
    })?;
    let pair = issuer.issue_pair(user_id, role).map_err(|err| {
        error!(error = %err, "failed to sign token pair");
        ApiError::Internal
    })?;

    counter!("beach_signal_tokens_issued_total", 1, "role" => role.as_str());
    debug!(user_id, role = %role, "issued development token pair");
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> ApiResult<RefreshResponse> {
    let issuer = state
        .issuer
        .as_ref()
        .ok_or(ApiError::NotFound("token issuer disabled"))?;
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection, "invalid refresh request body");
        ApiError::BadRequest(rejection.body_text())
    })?;

    let access_token = issuer.refresh(&request.refresh_token)?;
    Ok(Json(RefreshResponse { access_token }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active: usize,
    pub producers: usize,
    pub consumers: usize,
    pub sessions: Vec<SessionSummary>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let sessions = state.registry.snapshot();
    let producers = sessions
        .iter()
        .filter(|s| s.role == Role::Producer)
        .count();
    Json(StatsResponse {
        active: sessions.len(),
        producers,
        consumers: sessions.len() - producers,
        sessions,
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::NotFound("metrics exporter not installed").into_response(),
    }
}
