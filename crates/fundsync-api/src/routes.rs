use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use fundsync_core::models::{ConflictResolution, PendingOfflineRecord, UserSyncSettings};
use fundsync_core::sync::{
    ClearReport, LastSync, PullReport, PullRequest, PushReport, PushRequest, ResolutionOutcome,
    SyncStatus,
};
use fundsync_core::util::user_fingerprint;
use fundsync_core::SyncService;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    sync: SyncService,
    jwt_verifier: Arc<JwtVerifier>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, sync: SyncService) -> Self {
        Self {
            sync,
            jwt_verifier: Arc::new(JwtVerifier::from_config(&config)),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/status", get(sync_status))
        .route("/sync/transactions", post(sync_transactions))
        .route("/sync/full", post(full_sync))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/resolve-conflicts", post(resolve_conflicts))
        .route("/sync/last-sync", get(last_sync))
        .route("/sync/clear", delete(clear_sync_data))
        .route("/sync/settings", get(get_settings).put(put_settings))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

/// Successful response body: `{"success": true, ...fields}`
#[derive(Debug, Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

const fn success<T>(data: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        data,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Success<SyncStatus>>, AppError> {
    let status = state.sync.status(&user.user_id).await?;
    Ok(success(status))
}

async fn sync_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<Success<PushReport>>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let report = state.sync.sync_transactions(&user.user_id, request).await?;
    tracing::info!(
        endpoint = "sync_transactions",
        user = user_fingerprint(&user.user_id),
        session = user.session_id.as_deref().unwrap_or("none"),
        sync_session_id = %report.session_id,
        results = report.outcome.results.len(),
        "Handled offline transaction push"
    );
    Ok(success(report))
}

async fn full_sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<Success<PullReport>>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPull, &user.user_id)
        .await?;

    let report = state.sync.full_sync(&user.user_id, request).await?;
    Ok(success(report))
}

#[derive(Debug, Serialize)]
struct ConflictList {
    count: usize,
    conflicts: Vec<PendingOfflineRecord>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Success<ConflictList>>, AppError> {
    let conflicts = state.sync.conflicts(&user.user_id).await?;
    Ok(success(ConflictList {
        count: conflicts.len(),
        conflicts,
    }))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolutions: Vec<ConflictResolution>,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    results: Vec<ResolutionOutcome>,
}

async fn resolve_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Success<ResolveResponse>>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let results = state
        .sync
        .resolve_conflicts(&user.user_id, &request.resolutions)
        .await?;
    Ok(success(ResolveResponse { results }))
}

#[derive(Debug, Deserialize)]
struct LastSyncQuery {
    device_id: String,
}

async fn last_sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<LastSyncQuery>,
) -> Result<Json<Success<LastSync>>, AppError> {
    let last = state.sync.last_sync(&user.user_id, &query.device_id).await?;
    Ok(success(last))
}

#[derive(Debug, Deserialize)]
struct ClearRequest {
    #[serde(default)]
    confirm: bool,
}

async fn clear_sync_data(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<ClearRequest>, JsonRejection>,
) -> Result<Json<Success<ClearReport>>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &user.user_id)
        .await?;

    let report = state.sync.clear(&user.user_id, request.confirm).await?;
    Ok(success(report))
}

async fn get_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Success<UserSyncSettings>>, AppError> {
    let settings = state.sync.settings(&user.user_id).await?;
    Ok(success(settings))
}

async fn put_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<UserSyncSettings>, JsonRejection>,
) -> Result<Json<Success<UserSyncSettings>>, AppError> {
    let Json(settings) = body?;
    let settings = state.sync.update_settings(&user.user_id, settings).await?;
    Ok(success(settings))
}
