use crate::error::EngineError;
use crate::log_sink::LogEntry;
use crate::process::StatusSnapshot;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;

const DEFAULT_LOG_LINES: usize = 100;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_response(e: EngineError) -> ApiError {
    let status = match e {
        EngineError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::ProcessStartFailure { .. } | EngineError::Interrupted(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

/// 获取所有活动流的状态
pub async fn list_streams(State(state): State<SharedState>) -> Json<BTreeMap<String, StatusSnapshot>> {
    Json(state.engine.status_all())
}

/// 获取单个流的状态，没有活动进程时返回 404
pub async fn get_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, StatusCode> {
    state.engine.status(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// 手动启动流 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    state.engine.start(&id).await.map(Json).map_err(error_response)
}

/// 手动停止流 API
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = state.engine.stop(&id).await;
    Json(serde_json::json!({ "id": id, "stopped": stopped }))
}

/// 重启流 API
pub async fn handle_restart(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    state.engine.restart(&id).await.map(Json).map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

/// 读取流日志尾部
pub async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<LogEntry>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    Json(state.engine.logs(&id, lines).await)
}
