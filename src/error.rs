use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// 直接返回给调用方的错误；进程运行期间的异步故障只记日志
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stream configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("failed to start encoder for stream [{id}]: {source}")]
    ProcessStartFailure {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// 生命周期任务没有跑完 (运行时关闭或任务 panic)
    #[error("lifecycle task for stream [{0}] was interrupted")]
    Interrupted(String),
}
