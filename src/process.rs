use chrono::{DateTime, Local};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::events::{EventSink, StreamEvent};
use crate::log_sink::LogSink;
use crate::progress::{self, ProgressStatistics};

/// 单行输出的上限，超过后停止解析，剩余输出直接丢弃
const MAX_LINE_BYTES: usize = 64 * 1024;
/// 释放句柄时等待输出泵读完剩余内容的时间
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// 按需计算的状态视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub pid: u32,
    pub started_at: DateTime<Local>,
    pub uptime_secs: u64,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub bitrate_kbps: u64,
    pub last_updated: DateTime<Local>,
}

/// 进程退出信息，`code` 为 None 表示被信号终止或等待失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub at: Instant,
}

impl ExitInfo {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// 一次 CPU 时间采样
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub cpu_time_ms: u64,
    pub at: Instant,
}

/// 两次采样之间的 CPU 占用率，按核心数归一到 0..=100
pub fn cpu_percent(prev: CpuSample, cur: CpuSample, processors: usize) -> f64 {
    let wall = cur.at.saturating_duration_since(prev.at).as_secs_f64();
    if wall <= 0.0 || processors == 0 {
        return 0.0;
    }
    let cpu = cur.cpu_time_ms.saturating_sub(prev.cpu_time_ms) as f64 / 1000.0;
    (cpu / wall / processors as f64 * 100.0).clamp(0.0, 100.0)
}

/// 操作系统给出的进程资源占用
#[derive(Debug, Clone, Copy)]
pub struct ProcessUsage {
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
}

/// 读取指定进程的累计 CPU 时间与常驻内存，进程不存在时返回 None
pub fn probe_usage(pid: u32) -> Option<ProcessUsage> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_cpu().with_memory(),
    );
    sys.process(pid).map(|p| ProcessUsage {
        cpu_time_ms: p.accumulated_cpu_time(),
        memory_bytes: p.memory(),
    })
}

#[derive(Debug, Default)]
struct UsageState {
    sample: Option<CpuSample>,
    cpu_percent: f64,
    memory_bytes: u64,
}

/// 一个正在运行 (或刚退出) 的编码器进程
///
/// 子进程本身 (`Child`) 归监控任务所有；句柄持有 pid、stdin、强杀信号和退出状态，
/// 以及用于状态计算的采样数据。
pub struct ProcessHandle {
    id: String,
    config: StreamConfig,
    pid: u32,
    started_at: DateTime<Local>,
    started_instant: Instant,
    log: LogSink,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: CancellationToken,
    exit: watch::Sender<Option<ExitInfo>>,
    /// 一旦置位不再清除
    stopping: AtomicBool,
    usage: Mutex<UsageState>,
    last_stats: Mutex<Option<(ProgressStatistics, DateTime<Local>)>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// `ProcessHandle::spawn` 的产物: 句柄、交给监控任务的子进程，以及两路输出流
pub struct Spawned {
    pub handle: Arc<ProcessHandle>,
    pub child: Child,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    /// 启动编码器进程，三路标准流全部重定向
    pub fn spawn(
        executable: &str,
        args: &[String],
        config: StreamConfig,
        log_dir: &Path,
    ) -> io::Result<Spawned> {
        let mut cmd = Command::new(executable);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let started_at = Local::now();
        let (exit, _) = watch::channel(None);

        let handle = Arc::new(ProcessHandle {
            id: config.id.clone(),
            pid: child.id().unwrap_or(0),
            log: LogSink::new(log_dir, &config.id, started_at),
            config,
            started_at,
            started_instant: Instant::now(),
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            kill: CancellationToken::new(),
            exit,
            stopping: AtomicBool::new(false),
            usage: Mutex::new(UsageState::default()),
            last_stats: Mutex::new(None),
            pumps: Mutex::new(Vec::new()),
        });

        Ok(Spawned {
            handle,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// 追加日志，失败只告警
    pub async fn log_line(&self, source: &str, message: &str) {
        if let Err(e) = self.log.append(source, message).await {
            warn!(
                "Stream [{}] log write to {:?} failed: {}",
                self.id,
                self.log.path(),
                e
            );
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// 置位停止标记，返回之前是否已置位
    pub fn mark_stopping(&self) -> bool {
        self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 向 stdin 写入 `q\n`，请求编码器刷新并退出
    pub async fn request_quit(&self) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(pipe) => {
                pipe.write_all(b"q\n").await?;
                pipe.flush().await
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed")),
        }
    }

    /// 通知监控任务强制结束子进程
    pub fn force_kill(&self) {
        self.kill.cancel();
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// 由监控任务在子进程退出后调用
    pub(crate) fn mark_exited(&self, code: Option<i32>) {
        self.exit.send_replace(Some(ExitInfo {
            code,
            at: Instant::now(),
        }));
    }

    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(info) = *rx.borrow_and_update() {
                return info;
            }
            // 发送端归 self 所有，正常情况下不会失败
            if rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    at: Instant::now(),
                };
            }
        }
    }

    pub async fn wait_exit_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait_exit()).await.ok()
    }

    pub(crate) fn attach_pump(&self, task: JoinHandle<()>) {
        self.pumps.lock().push(task);
    }

    /// 释放 stdin 与输出泵；泵在限定时间内读完剩余输出，超时则中止
    pub async fn dispose(&self) {
        self.stdin.lock().await.take();

        let pumps: Vec<_> = self.pumps.lock().drain(..).collect();
        for mut pump in pumps {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump)
                .await
                .is_err()
            {
                debug!("Stream [{}] output pump did not drain, aborting", self.id);
                pump.abort();
            }
        }
    }

    /// 每一行子进程输出的处理入口: 写日志，解析进度并发布
    pub async fn handle_output(&self, source: &str, line: &str, events: &dyn EventSink) {
        self.log_line(source, line).await;

        if let Some(stats) = progress::parse_progress(line).filter(|s| !s.is_empty()) {
            *self.last_stats.lock() = Some((stats.clone(), Local::now()));
            events.publish(StreamEvent::Stats {
                id: self.id.clone(),
                stats,
            });
        }
    }

    /// 记录新的 CPU 采样并返回相对上一次采样的占用率；首次采样为 0
    pub fn sample_cpu(&self, cpu_time_ms: u64, at: Instant, processors: usize) -> f64 {
        let mut usage = self.usage.lock();
        let current = CpuSample { cpu_time_ms, at };
        let pct = usage
            .sample
            .map(|prev| cpu_percent(prev, current, processors))
            .unwrap_or(0.0);
        usage.sample = Some(current);
        usage.cpu_percent = pct;
        pct
    }

    /// 计算当前状态。会调用系统接口采样，调用方不得持有任务表锁
    pub fn snapshot(&self, processors: usize) -> StatusSnapshot {
        let exit = self.exit_info();
        let running = exit.is_none();

        if running {
            if let Some(usage) = probe_usage(self.pid) {
                self.sample_cpu(usage.cpu_time_ms, Instant::now(), processors);
                self.usage.lock().memory_bytes = usage.memory_bytes;
            }
        }

        let (cpu_percent, memory_bytes) = {
            let usage = self.usage.lock();
            (usage.cpu_percent, usage.memory_bytes)
        };

        let until = exit.map(|e| e.at).unwrap_or_else(Instant::now);
        let (bitrate_kbps, last_updated) = match self.last_stats.lock().as_ref() {
            Some((stats, at)) => (stats.bitrate_kbps(), *at),
            None => (0, self.started_at),
        };

        StatusSnapshot {
            id: self.id.clone(),
            name: self.config.display_name().to_string(),
            running,
            pid: if running { self.pid } else { 0 },
            started_at: self.started_at,
            uptime_secs: until.saturating_duration_since(self.started_instant).as_secs(),
            cpu_percent,
            memory_bytes,
            bitrate_kbps,
            last_updated,
        }
    }
}

/// 逐行读取子进程输出 (按 `\r` 或 `\n` 分行，ffmpeg 的进度行以 `\r` 结尾)
pub async fn pump_output<R>(
    reader: R,
    source: &'static str,
    handle: Arc<ProcessHandle>,
    events: Arc<dyn EventSink>,
) where
    R: AsyncRead + Unpin,
{
    let codec = AnyDelimiterCodec::new_with_max_length(
        b"\r\n".to_vec(),
        b"\n".to_vec(),
        MAX_LINE_BYTES,
    );
    let mut frames = FramedRead::new(reader, codec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(chunk) => {
                let line = String::from_utf8_lossy(&chunk);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                handle.handle_output(source, line, events.as_ref()).await;
            }
            Err(e) => {
                warn!("Stream [{}] {} output unreadable: {}", handle.id(), source, e);
                break;
            }
        }
    }

    // 出错后继续排空管道，避免编码器因写阻塞而卡住
    let mut reader = frames.into_inner();
    if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        debug!("Stream [{}] {} drain ended: {}", handle.id(), source, e);
    }
}
