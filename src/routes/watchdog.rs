//! Watchdog status and control endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WatchdogUpdate;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

/// `GET /api/watchdog/status` — full supervisor snapshot.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.watchdog.status_snapshot().await)
}

/// `POST /api/watchdog/start` — start supervising, with optional config
/// overrides applied first.
pub async fn start(
    State(state): State<AppState>,
    body: Option<Json<WatchdogUpdate>>,
) -> Json<Value> {
    if let Some(Json(update)) = body {
        state.watchdog.reconfigure(&update).await;
    }
    state.watchdog.start().await;
    Json(json!({"running": true}))
}

/// `POST /api/watchdog/stop` — idempotent stop.
pub async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.watchdog.stop().await;
    Json(json!({"running": false}))
}

/// `GET /api/watchdog/history?limit=` — in-memory recent actions.
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    Json(json!({"entries": state.watchdog.history(limit).await}))
}

/// `POST /api/watchdog/reset/{modem_id}` — zero one modem's escalation.
pub async fn reset(
    State(state): State<AppState>,
    Path(modem_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.watchdog.reset_escalation(&modem_id).await {
        Ok(Json(json!({"reset": modem_id})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown modem '{modem_id}'")})),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct ForceActionRequest {
    pub modem_id: String,
    /// Escalation level 1 (SOFT) through 5 (MAXIMUM).
    pub level: u8,
}

/// `POST /api/watchdog/force-action` — dispatch one level immediately.
pub async fn force_action(
    State(state): State<AppState>,
    Json(request): Json<ForceActionRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state
        .watchdog
        .force_action(&request.modem_id, request.level)
        .await
    {
        Ok(outcome) => Ok(Json(json!({"dispatched": true, "result": outcome}))),
        Err(e) => Err((StatusCode::BAD_REQUEST, Json(json!({"error": e})))),
    }
}

/// `POST /api/watchdog/cleanup-smsdb` — trim the engine's SMS spool.
pub async fn cleanup_smsdb(State(state): State<AppState>) -> Json<Value> {
    let report = state.watchdog.cleanup_smsdb().await;
    Json(serde_json::to_value(report).unwrap_or(Value::Null))
}

/// `GET /api/watchdog/logs?limit=` — durable log stats plus recent entries.
pub async fn logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    Json(json!({
        "stats": state.watchdog.log_stats().await,
        "entries": state.watchdog.log_history(limit).await,
    }))
}

/// `DELETE /api/watchdog/logs` — drop the durable log and the memory ring.
pub async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    state.watchdog.clear_logs().await;
    Json(json!({"cleared": true}))
}

/// `PUT /api/watchdog/config` — merge a partial config; returns the result.
pub async fn put_config(
    State(state): State<AppState>,
    Json(update): Json<WatchdogUpdate>,
) -> Json<Value> {
    let config = state.watchdog.reconfigure(&update).await;
    Json(serde_json::to_value(config).unwrap_or(Value::Null))
}
