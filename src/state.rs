use crate::engine::Engine;
use std::sync::Arc;

/// 全局应用上下文
pub struct AppState {
    /// 流编排器
    pub engine: Arc<Engine>,
}

pub type SharedState = Arc<AppState>;
