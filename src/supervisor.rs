use crate::engine::Engine;
use crate::events::StreamEvent;
use crate::log_sink::SOURCE_SYSTEM;
use crate::process::ProcessHandle;
use std::sync::Arc;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

/// 为每个启动的编码器进程挂一个监控任务
pub fn spawn_monitor(engine: Arc<Engine>, handle: Arc<ProcessHandle>, child: Child) {
    tokio::spawn(monitor(engine, handle, child));
}

/// 等待进程退出并执行重启策略
///
/// # 任务流程：
/// - 等待子进程退出，或收到强杀信号后结束进程
/// - 被主动停止的实例直接退出监控
/// - 配置仍启用且退出码非 0: 固定延迟后重启，延迟结束时再次确认未被停止
/// - 其余情况: 从任务表移除并发布退出事件
///
/// 崩溃重启没有次数上限也没有退避增长，持续崩溃的流会按固定间隔一直重试，
/// 直到被停止或禁用。
async fn monitor(engine: Arc<Engine>, handle: Arc<ProcessHandle>, mut child: Child) {
    let id = handle.id().to_string();
    let kill = handle.kill_token();

    let result = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!("Stream [{}] kill failed: {}", id, e);
            }
            child.wait().await
        }
    };

    let code = match result {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Process monitor error [{}]: {}", id, e);
            None
        }
    };
    // 先写日志再公布退出，等待退出的 stop 随后写入的停止尾总在其后
    handle
        .log_line(SOURCE_SYSTEM, &format!("Process exited with code {:?}", code))
        .await;
    handle.mark_exited(code);

    if handle.is_stopping() {
        debug!("Stream [{}] exited after stop request", id);
        return;
    }

    let enabled = engine.configs().get(&id).is_some_and(|cfg| cfg.enabled);
    let crashed = !handle.exit_info().is_some_and(|e| e.is_clean());

    if enabled && crashed {
        let delay = engine.settings().restart_delay;
        warn!(
            "Stream [{}] exited unexpectedly with {:?}. Restarting in {:?}",
            id, code, delay
        );
        engine.events().publish(StreamEvent::Exited {
            id: id.clone(),
            exit_code: code,
        });

        tokio::time::sleep(delay).await;

        let lock = engine.job_lock(&id);
        let _guard = lock.lock().await;
        // 延迟期间可能已被 stop 或被新的 start 替换
        if handle.is_stopping() || !engine.is_current(&handle) {
            info!("Stream [{}] restart cancelled", id);
            return;
        }

        info!("Supervisor: Attempting to restart stream [{}]", id);
        if let Err(e) = engine.start_locked(&id).await {
            error!("Restart failed [{}]: {}", id, e);
        }
        return;
    }

    {
        let lock = engine.job_lock(&id);
        let _guard = lock.lock().await;
        if !handle.is_stopping() && engine.remove_if_current(&handle) {
            info!("Stream [{}] exited with {:?}", id, code);
            handle.dispose().await;
            handle
                .log_line(SOURCE_SYSTEM, "=== Stream exited ===")
                .await;
            engine.events().publish(StreamEvent::Exited {
                id: id.clone(),
                exit_code: code,
            });
        }
    }
    engine.prune_job_lock(&id);
}
