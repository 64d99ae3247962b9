pub mod admin;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 状态查询与控制接口，只输出 JSON
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/streams", get(admin::list_streams)) // 所有活动流状态
        .route("/streams/:id", get(admin::get_stream)) // 单个流状态
        .route("/streams/:id/start", post(admin::handle_start)) // 启动流
        .route("/streams/:id/stop", post(admin::handle_stop)) // 停止流
        .route("/streams/:id/restart", post(admin::handle_restart)) // 重启流
        .route("/streams/:id/logs", get(admin::get_logs)) // 日志尾部
        .with_state(state)
}
