//! 引擎发布的生命周期与进度事件

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::process::StatusSnapshot;
use crate::progress::ProgressStatistics;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 编码器进程已拉起
    Started(StatusSnapshot),
    /// 流被主动停止
    Stopped { id: String },
    /// 编码器自行退出；崩溃且仍启用时随后会自动重启
    Exited { id: String, exit_code: Option<i32> },
    /// 解析到新的进度采样
    Stats {
        id: String,
        stats: ProgressStatistics,
    },
}

/// 事件出口，实现不得阻塞
pub trait EventSink: Send + Sync {
    fn publish(&self, event: StreamEvent);
}

/// 基于 tokio broadcast 的广播
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<StreamEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: StreamEvent) {
        // 没有订阅者时直接丢弃
        let _ = self.sender.send(event);
    }
}

/// 订阅事件并写入 tracing 日志，直到通道关闭
pub async fn log_events(mut rx: broadcast::Receiver<StreamEvent>) {
    loop {
        match rx.recv().await {
            Ok(StreamEvent::Started(status)) => {
                info!("Event: stream [{}] started, pid {}", status.id, status.pid)
            }
            Ok(StreamEvent::Stopped { id }) => info!("Event: stream [{}] stopped", id),
            Ok(StreamEvent::Exited { id, exit_code }) => {
                info!("Event: stream [{}] exited ({:?})", id, exit_code)
            }
            Ok(StreamEvent::Stats { id, stats }) => {
                debug!(
                    "Event: stream [{}] frame {:?} fps {:?} {} kbps",
                    id,
                    stats.frame(),
                    stats.fps(),
                    stats.bitrate_kbps()
                )
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged, {} events dropped", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
