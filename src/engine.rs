use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::command::{self, Platform};
use crate::config::{ConfigStore, ServerConfig};
use crate::error::{EngineError, Result};
use crate::events::{EventSink, StreamEvent};
use crate::log_sink::{self, LogEntry, SOURCE_STDERR, SOURCE_STDOUT, SOURCE_SYSTEM};
use crate::process::{pump_output, ProcessHandle, Spawned, StatusSnapshot};
use crate::supervisor;

/// 强杀之后等待进程被回收的上限
const KILL_WAIT: Duration = Duration::from_secs(5);

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ffmpeg_binary: String,
    pub log_dir: PathBuf,
    pub platform: Platform,
    pub grace_period: Duration,
    pub restart_delay: Duration,
    pub restart_pause: Duration,
}

impl EngineSettings {
    pub fn from_server(server: &ServerConfig) -> Self {
        Self {
            ffmpeg_binary: server.ffmpeg_binary.clone(),
            log_dir: PathBuf::from(&server.log_dir),
            platform: server.platform.unwrap_or_else(Platform::current),
            grace_period: server.grace_period(),
            restart_delay: server.restart_delay(),
            restart_pause: server.restart_pause(),
        }
    }
}

/// 清理句柄的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// 调用方主动停止，发布 Stopped
    Stop,
    /// start 发现旧进程已退出，清理后重新拉起；退出事件已由监控任务发布
    Clear,
}

/// 流编排器: 管理所有编码任务的进程句柄
///
/// 任务表只在插入、移除、查找时短暂加锁；同一任务的 start/stop 以及监控任务的
/// 退出处理由该任务自己的生命周期锁串行化，不同任务之间互不阻塞。
pub struct Engine {
    settings: EngineSettings,
    configs: Arc<dyn ConfigStore>,
    events: Arc<dyn EventSink>,
    handles: Mutex<HashMap<String, Arc<ProcessHandle>>>,
    job_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    processors: usize,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        configs: Arc<dyn ConfigStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            configs,
            events,
            handles: Mutex::new(HashMap::new()),
            job_locks: Mutex::new(HashMap::new()),
            processors: num_cpus::get(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 启动指定流
    ///
    /// 已在运行时直接返回当前状态；旧进程已退出时先完整清理再重新拉起。
    /// 启动序列在独立任务中执行，调用方被取消 (如 HTTP 客户端断开) 也会完整跑完。
    ///
    /// # 错误处理
    /// - 配置不存在返回 `ConfigNotFound`
    /// - 编码器无法启动返回 `ProcessStartFailure`
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<StatusSnapshot> {
        let engine = self.clone();
        let job = id.to_string();
        run_detached(id, async move { engine.start_serialized(&job).await })
            .await
            .unwrap_or_else(|| Err(EngineError::Interrupted(id.to_string())))
    }

    /// 停止指定流；没有句柄时返回 false，且不留下任何状态
    pub async fn stop(self: &Arc<Self>, id: &str) -> bool {
        if self.handle(id).is_none() {
            return false;
        }
        let engine = self.clone();
        let job = id.to_string();
        run_detached(id, async move { engine.stop_serialized(&job).await })
            .await
            .unwrap_or(false)
    }

    /// stop + 固定停顿 + start，非原子操作，整体在独立任务中执行
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<StatusSnapshot> {
        let engine = self.clone();
        let job = id.to_string();
        run_detached(id, async move {
            engine.stop_serialized(&job).await;
            tokio::time::sleep(engine.settings.restart_pause).await;
            engine.start_serialized(&job).await
        })
        .await
        .unwrap_or_else(|| Err(EngineError::Interrupted(id.to_string())))
    }

    pub fn status(&self, id: &str) -> Option<StatusSnapshot> {
        let handle = self.handle(id)?;
        Some(handle.snapshot(self.processors))
    }

    pub fn status_all(&self) -> BTreeMap<String, StatusSnapshot> {
        let handles: Vec<_> = self.handles.lock().values().cloned().collect();
        handles
            .into_iter()
            .map(|h| (h.id().to_string(), h.snapshot(self.processors)))
            .collect()
    }

    /// 读取日志尾部；没有活动句柄时读取该任务最近一次的日志文件
    pub async fn logs(&self, id: &str, lines: usize) -> Vec<LogEntry> {
        let path = match self.handle(id) {
            Some(handle) => Some(handle.log().path().to_path_buf()),
            None => match log_sink::latest_for(&self.settings.log_dir, id).await {
                Ok(path) => path,
                Err(e) => {
                    warn!("Stream [{}] log lookup failed: {}", id, e);
                    None
                }
            },
        };

        let Some(path) = path else {
            return Vec::new();
        };
        match log_sink::tail(&path, lines).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Stream [{}] log read {:?} failed: {}", id, path, e);
                Vec::new()
            }
        }
    }

    /// 启动所有 enabled 且 auto_start 的流
    pub async fn autostart(self: &Arc<Self>) {
        for cfg in self.configs.list() {
            if !cfg.enabled || !cfg.auto_start {
                continue;
            }
            if let Err(e) = self.start(&cfg.id).await {
                error!("Auto-start failed [{}]: {}", cfg.id, e);
            }
        }
    }

    /// 并发停止所有流，用于服务退出
    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.handles.lock().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} stream(s)", ids.len());
        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    pub(crate) fn configs(&self) -> &dyn ConfigStore {
        self.configs.as_ref()
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    pub(crate) fn job_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.job_locks
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// 任务已没有句柄且没有其他持有者时回收它的生命周期锁
    pub(crate) fn prune_job_lock(&self, id: &str) {
        let mut locks = self.job_locks.lock();
        let idle = locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1);
        if idle && !self.handles.lock().contains_key(id) {
            locks.remove(id);
        }
    }

    fn handle(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.lock().get(id).cloned()
    }

    /// 任务表中登记的是否仍是这个句柄
    pub(crate) fn is_current(&self, handle: &Arc<ProcessHandle>) -> bool {
        self.handles
            .lock()
            .get(handle.id())
            .is_some_and(|h| Arc::ptr_eq(h, handle))
    }

    /// 仅当登记的仍是这个句柄时移除，返回是否移除
    pub(crate) fn remove_if_current(&self, handle: &Arc<ProcessHandle>) -> bool {
        let mut handles = self.handles.lock();
        match handles.get(handle.id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                handles.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    async fn start_serialized(self: &Arc<Self>, id: &str) -> Result<StatusSnapshot> {
        // 未配置的 id 不建锁
        if self.configs.get(id).is_none() {
            return Err(EngineError::ConfigNotFound(id.to_string()));
        }
        let lock = self.job_lock(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    async fn stop_serialized(&self, id: &str) -> bool {
        if self.handle(id).is_none() {
            return false;
        }
        let stopped = {
            let lock = self.job_lock(id);
            let _guard = lock.lock().await;
            match self.handle(id) {
                Some(handle) => {
                    self.teardown(&handle, Teardown::Stop).await;
                    true
                }
                None => false,
            }
        };
        self.prune_job_lock(id);
        stopped
    }

    /// 调用方必须持有该任务的生命周期锁
    pub(crate) async fn start_locked(self: &Arc<Self>, id: &str) -> Result<StatusSnapshot> {
        let cfg = self
            .configs
            .get(id)
            .ok_or_else(|| EngineError::ConfigNotFound(id.to_string()))?;

        if let Some(existing) = self.handle(id) {
            if existing.is_alive() {
                return Ok(existing.snapshot(self.processors));
            }
            info!("Stream [{}] previous process is gone, clearing it", id);
            self.teardown(&existing, Teardown::Clear).await;
        }

        let args = command::build(&cfg, self.settings.platform);
        let command_line = command::display_command_line(&self.settings.ffmpeg_binary, &args);
        info!("Starting stream [{}]: {}", id, command_line);

        let Spawned {
            handle,
            child,
            stdout,
            stderr,
        } = ProcessHandle::spawn(
            &self.settings.ffmpeg_binary,
            &args,
            cfg.clone(),
            &self.settings.log_dir,
        )
        .map_err(|source| {
            error!("Failed to spawn FFmpeg process for [{}]: {}", id, source);
            EngineError::ProcessStartFailure {
                id: id.to_string(),
                source,
            }
        })?;

        self.handles.lock().insert(id.to_string(), handle.clone());

        // 启动头先于任何进程输出写入
        handle
            .log_line(
                SOURCE_SYSTEM,
                &format!("=== Stream {} ({}) starting ===", id, cfg.display_name()),
            )
            .await;
        handle
            .log_line(SOURCE_SYSTEM, &format!("PID: {}", handle.pid()))
            .await;
        handle
            .log_line(SOURCE_SYSTEM, &format!("Command: {}", command_line))
            .await;

        if let Some(out) = stdout {
            handle.attach_pump(tokio::spawn(pump_output(
                out,
                SOURCE_STDOUT,
                handle.clone(),
                self.events.clone(),
            )));
        }
        if let Some(err) = stderr {
            handle.attach_pump(tokio::spawn(pump_output(
                err,
                SOURCE_STDERR,
                handle.clone(),
                self.events.clone(),
            )));
        }

        supervisor::spawn_monitor(self.clone(), handle.clone(), child);

        let status = handle.snapshot(self.processors);
        info!("Stream [{}] started, pid {}", id, status.pid);
        self.events.publish(StreamEvent::Started(status.clone()));
        Ok(status)
    }

    /// 停止序列: 置停止标记 -> `q` -> 宽限期 -> 强杀 -> 移出任务表 -> 释放 -> 写尾 -> 发布
    ///
    /// 中途的错误只记日志，不影响强杀与清理。
    async fn teardown(&self, handle: &Arc<ProcessHandle>, reason: Teardown) {
        let id = handle.id();
        handle.mark_stopping();

        if handle.is_alive() {
            info!("Stopping stream [{}] (pid {})", id, handle.pid());
            match handle.request_quit().await {
                Ok(()) => {
                    if handle
                        .wait_exit_timeout(self.settings.grace_period)
                        .await
                        .is_none()
                    {
                        warn!(
                            "Stream [{}] did not exit within {:?}, killing",
                            id, self.settings.grace_period
                        );
                        handle
                            .log_line(SOURCE_SYSTEM, "Graceful stop timed out, killing process")
                            .await;
                    }
                }
                Err(e) => warn!("Stream [{}] quit signal failed: {}", id, e),
            }

            if handle.is_alive() {
                handle.force_kill();
                if handle.wait_exit_timeout(KILL_WAIT).await.is_none() {
                    error!("Stream [{}] still running after kill", id);
                }
            }
        }

        // 先移除再写尾和发布，监控任务据此判断退出是否已被处理
        self.remove_if_current(handle);
        handle.dispose().await;

        let footer = match reason {
            Teardown::Stop => "=== Stream stopped ===",
            Teardown::Clear => "=== Stream cleared for restart ===",
        };
        handle.log_line(SOURCE_SYSTEM, footer).await;

        if reason == Teardown::Stop {
            info!("Stream [{}] stopped.", id);
            self.events.publish(StreamEvent::Stopped { id: id.to_string() });
        }
    }
}

/// 在独立任务中跑完整个生命周期序列；任务没有跑完时返回 None
async fn run_detached<T, F>(id: &str, sequence: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(sequence).await {
        Ok(out) => Some(out),
        Err(e) => {
            error!("Stream [{}] lifecycle task failed: {}", id, e);
            None
        }
    }
}

#[cfg(all(test, unix))]
#[path = "engine_tests.rs"]
mod tests;
