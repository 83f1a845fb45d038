//! HTTP request handlers.

use super::AppState;
use crate::aggregate::{default_window_start, Bucket, SeriesKind, Uptime};
use crate::db::Failure;
use crate::engine::{Caller, NotifierUpdate, NotifierView, ServiceSpec, ServiceView};
use crate::error::CoreError;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Responses
// ============================================================================

/// Error shaped as `{"status":"error","error":...}`.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            // Hidden resources answer like a normal response with an error field
            CoreError::NotAuthenticated => StatusCode::OK,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotifierDelivery(_) => StatusCode::BAD_GATEWAY,
            CoreError::Storage(e) => {
                tracing::error!("Storage error while handling request: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "status": "error", "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ActionResponse<T> {
    status: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    method: &'static str,
    id: Value,
    output: T,
}

/// Success envelope for mutations.
fn action<T: Serialize>(kind: &'static str, method: &'static str, id: Value, output: T) -> Response {
    Json(ActionResponse {
        status: "success",
        kind,
        method,
        id,
        output,
    })
    .into_response()
}

// ============================================================================
// Callers
// ============================================================================

fn caller(state: &AppState, headers: &HeaderMap) -> Caller {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(t) if !state.config.api_secret.is_empty() && t == state.config.api_secret => Caller::Admin,
        _ => Caller::Anonymous,
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if caller(state, headers).is_admin() {
        Ok(())
    } else {
        Err(CoreError::NotAuthenticated.into())
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let events = state.engine.store().get_event_stats().map_err(CoreError::from)?;
    Ok(Json(json!({
        "status": "ok",
        "workers": state.engine.running_workers().await,
        "events": events,
    })))
}

// ============================================================================
// API: Services
// ============================================================================

pub async fn handle_list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ServiceView>>> {
    let services = state.engine.list_services(caller(&state, &headers)).await?;
    Ok(Json(services))
}

pub async fn handle_get_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServiceView>> {
    let service = state.engine.get_service(id, caller(&state, &headers)).await?;
    Ok(Json(service))
}

pub async fn handle_create_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    let service = state.engine.create_service(spec).await?;
    Ok(action("service", "create", json!(service.id), service))
}

pub async fn handle_update_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    let service = state.engine.update_service(id, spec).await?;
    Ok(action("service", "update", json!(id), service))
}

pub async fn handle_delete_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    state.engine.delete_service(id).await?;
    Ok(action("service", "delete", json!(id), Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct ReorderItem {
    pub service: i64,
    pub order: i64,
}

pub async fn handle_reorder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(items): Json<Vec<ReorderItem>>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    let orders: Vec<(i64, i64)> = items.iter().map(|i| (i.service, i.order)).collect();
    state.engine.reorder(&orders)?;
    Ok(action("service", "reorder", Value::Null, orders.len()))
}

// ============================================================================
// API: Failures and series
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

pub async fn handle_get_failures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<FailuresQuery>,
) -> ApiResult<Json<Vec<Failure>>> {
    let failures = state
        .engine
        .failures(id, query.limit, query.offset, caller(&state, &headers))?;
    Ok(Json(failures))
}

pub async fn handle_delete_failures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    let removed = state.engine.delete_failures(id)?;
    Ok(action("service", "delete_failures", json!(id), removed))
}

/// Window bounds in unix seconds. Defaults to the last 24 hours.
#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Event times are stored as text and only sort correctly for four-digit years.
const STORABLE_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

fn storable(time: Option<DateTime<Utc>>, name: &str) -> ApiResult<DateTime<Utc>> {
    time.filter(|t| STORABLE_YEARS.contains(&t.year()))
        .ok_or_else(|| CoreError::Validation(format!("{} is out of range", name)).into())
}

impl SeriesQuery {
    fn window(&self) -> ApiResult<(DateTime<Utc>, DateTime<Utc>)> {
        let end = match self.end {
            Some(secs) => storable(DateTime::from_timestamp(secs, 0), "end")?,
            None => Utc::now(),
        };
        let start = match self.start {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            None => default_window_start(end),
        };
        Ok((storable(start, "start")?, end))
    }
}

async fn series(
    state: AppState,
    headers: HeaderMap,
    id: i64,
    kind: SeriesKind,
    query: SeriesQuery,
) -> ApiResult<Json<Vec<Bucket>>> {
    let (start, end) = query.window()?;
    let buckets = state.engine.aggregate(
        id,
        kind,
        start,
        end,
        query.group.as_deref(),
        caller(&state, &headers),
    )?;
    Ok(Json(buckets))
}

pub async fn handle_hits_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<Vec<Bucket>>> {
    series(state, headers, id, SeriesKind::Hits, query).await
}

pub async fn handle_ping_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<Vec<Bucket>>> {
    series(state, headers, id, SeriesKind::Ping, query).await
}

pub async fn handle_failure_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<Vec<Bucket>>> {
    series(state, headers, id, SeriesKind::Failures, query).await
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Json<Uptime>> {
    let (start, end) = query.window()?;
    let uptime = state.engine.uptime(id, start, end, caller(&state, &headers))?;
    Ok(Json(uptime))
}

// ============================================================================
// API: Notifiers
// ============================================================================

pub async fn handle_list_notifiers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<NotifierView>>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.list_notifiers()?))
}

pub async fn handle_get_notifier(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(method): Path<String>,
) -> ApiResult<Json<NotifierView>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.get_notifier(&method)?))
}

pub async fn handle_update_notifier(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(method): Path<String>,
    Json(update): Json<NotifierUpdate>,
) -> ApiResult<Response> {
    require_admin(&state, &headers)?;
    let view = state.engine.update_notifier(&method, update).await?;
    Ok(action("notifier", "update", json!(method), view))
}

#[derive(Debug, Serialize)]
pub struct NotifierTestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handle_test_notifier(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(method): Path<String>,
    Json(candidate): Json<NotifierUpdate>,
) -> ApiResult<Json<NotifierTestResponse>> {
    require_admin(&state, &headers)?;
    let error = match state.engine.test_notifier(&method, candidate).await {
        Ok(()) => None,
        Err(e @ (CoreError::NotifierDelivery(_) | CoreError::Validation(_))) => Some(e.to_string()),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(NotifierTestResponse {
        success: error.is_none(),
        error,
    }))
}
