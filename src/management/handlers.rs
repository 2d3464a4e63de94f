//! Management API Handlers
//!
//! Each handler maps one operator action onto the `PacketHolder`.

use super::types::*;
use crate::controller::{PacketHolder, RelayStatus, StartMode};
use crate::error::HolderError;
use crate::holding::RuleInfo;
use crate::relay::PacketEvent;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::info;

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub holder: PacketHolder,
    /// Addresses used by `POST /start` when the request leaves them out
    pub default_bind: SocketAddr,
    pub default_upstream: SocketAddr,
    pub start_time: SystemTime,
}

impl AppState {
    pub fn new(holder: PacketHolder, default_bind: SocketAddr, default_upstream: SocketAddr) -> Self {
        Self {
            holder,
            default_bind,
            default_upstream,
            start_time: SystemTime::now(),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn failed<T>(error: HolderError) -> ApiResult<T> {
    let status = match &error {
        HolderError::InvalidRuleIndex { .. } => StatusCode::NOT_FOUND,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        e if e.is_lifecycle_misuse() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(error.to_string())))
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let uptime_seconds = SystemTime::now()
        .duration_since(state.start_time)
        .unwrap_or_default()
        .as_secs();
    let status = state.holder.status();

    let mut checks = HashMap::new();
    checks.insert(
        "relay".to_string(),
        CheckResult {
            status: if status.last_error.is_some() { "degraded" } else { "healthy" }.to_string(),
            message: Some(
                status
                    .last_error
                    .unwrap_or_else(|| format!("Relay is {:?}", status.state)),
            ),
        },
    );

    let overall = if checks.values().all(|c| c.status == "healthy") {
        "healthy"
    } else {
        "degraded"
    };

    Json(ApiResponse::success(HealthStatus {
        status: overall.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        checks,
    }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<RelayStatus>> {
    Json(ApiResponse::success(state.holder.status()))
}

pub async fn get_rules(State(state): State<AppState>) -> Json<ApiResponse<Vec<RuleInfo>>> {
    Json(ApiResponse::success(state.holder.rules()))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(index): Path<usize>,
    Json(request): Json<RuleUpdateRequest>,
) -> ApiResult<Vec<RuleInfo>> {
    match state.holder.configure_rule(
        index,
        &request.hold_keyword,
        request.release_type,
        &request.release_keyword,
        request.enabled,
    ) {
        Ok(()) => {
            info!("Rule {} updated via management API", index);
            ok(state.holder.rules())
        }
        Err(e) => failed(e),
    }
}

pub async fn register_keyword(
    State(state): State<AppState>,
    Json(request): Json<KeywordRequest>,
) -> ApiResult<Vec<RuleInfo>> {
    match state.holder.register_keyword(&request.keyword) {
        Ok(()) => {
            info!("Keyword '{}' registered via management API", request.keyword);
            ok(state.holder.rules())
        }
        Err(e) => failed(e),
    }
}

pub async fn clear_keywords(State(state): State<AppState>) -> ApiResult<Vec<RuleInfo>> {
    match state.holder.clear_keywords() {
        Ok(()) => ok(state.holder.rules()),
        Err(e) => failed(e),
    }
}

pub async fn set_keyword_holding(
    State(state): State<AppState>,
    Json(request): Json<HoldingSwitchRequest>,
) -> ApiResult<bool> {
    match state.holder.set_holding_enabled(request.enabled) {
        Ok(()) => ok(state.holder.holding_enabled()),
        Err(e) => failed(e),
    }
}

/// Start the relay in the background
pub async fn start_relay(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<RelayStatus> {
    let bind_addr = request.bind_addr.unwrap_or(state.default_bind);
    let upstream_addr = request.upstream_addr.unwrap_or(state.default_upstream);

    match state
        .holder
        .start(bind_addr, upstream_addr, StartMode::Background)
        .await
    {
        Ok(()) => ok(state.holder.status()),
        Err(e) => failed(e),
    }
}

pub async fn stop_relay(State(state): State<AppState>) -> ApiResult<RelayStatus> {
    match state.holder.stop().await {
        Ok(()) => ok(state.holder.status()),
        Err(e) => failed(e),
    }
}

pub async fn get_pending(State(state): State<AppState>) -> Json<ApiResponse<PendingInfo>> {
    Json(ApiResponse::success(PendingInfo {
        pending: state.holder.pending_count(),
        oldest_age_ms: state
            .holder
            .oldest_pending_age()
            .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
    }))
}

pub async fn flush_pending(State(state): State<AppState>) -> ApiResult<FlushResult> {
    match state.holder.flush_all_pending().await {
        Ok(released) => ok(FlushResult { released }),
        Err(e) => failed(e),
    }
}

pub async fn set_output(
    State(state): State<AppState>,
    Json(request): Json<OutputRequest>,
) -> Json<ApiResponse<RelayStatus>> {
    state.holder.set_output_verbosity(request.only_held);
    Json(ApiResponse::success(state.holder.status()))
}

/// Stream packet events as server-sent events
///
/// Events a slow reader missed are skipped.
pub async fn packet_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.holder.subscribe_events())
        .filter_map(|event| event.ok())
        .filter_map(|event: PacketEvent| {
            Event::default()
                .event(event.kind.as_str())
                .json_data(&event)
                .ok()
        })
        .map(Ok);

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.holder.metrics().export_prometheus(),
    )
}
