use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LINE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const FILE_TS_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// 日志来源标签
pub const SOURCE_SYSTEM: &str = "system";
pub const SOURCE_STDOUT: &str = "stdout";
pub const SOURCE_STDERR: &str = "stderr";

/// 从日志文件回读的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub source: String,
    pub message: String,
}

/// 单次进程运行对应的追加式日志文件
///
/// 同一个任务的所有写入 (stdout/stderr 泵、启动头、停止尾) 经由同一把锁串行化，
/// 不同任务之间互不影响。
pub struct LogSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LogSink {
    pub fn new(log_dir: &Path, job_id: &str, started_at: DateTime<Local>) -> Self {
        let file_name = format!("{}_{}.log", job_id, started_at.format(FILE_TS_FORMAT));
        Self {
            path: log_dir.join(file_name),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一行 `[时间] [来源] 内容`，目录不存在时先创建
    pub async fn append(&self, source: &str, message: &str) -> io::Result<()> {
        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format(LINE_TS_FORMAT),
            source,
            message.replace(['\r', '\n'], " ")
        );

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// 读取日志文件最后 `lines` 行；格式不符的行直接丢弃
pub async fn tail(path: &Path, lines: usize) -> io::Result<Vec<LogEntry>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().filter_map(|l| parse_line(l)).collect())
}

/// 查找某个任务最近一次运行的日志文件
pub async fn latest_for(log_dir: &Path, job_id: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(log_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let prefix = format!("{job_id}_");
    let mut latest: Option<String> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".log"))
        else {
            continue;
        };
        // 避免 id 为 "cam" 时误匹配 "cam_2_..." 的文件
        if !is_file_stamp(stamp) {
            continue;
        }
        if latest.as_deref().map_or(true, |l| name.as_str() > l) {
            latest = Some(name);
        }
    }

    Ok(latest.map(|name| log_dir.join(name)))
}

fn is_file_stamp(stamp: &str) -> bool {
    // 20261018_120000_123
    stamp.len() == 19
        && stamp.char_indices().all(|(i, c)| match i {
            8 | 15 => c == '_',
            _ => c.is_ascii_digit(),
        })
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let rest = line.strip_prefix('[')?;
    let (ts, rest) = rest.split_once("] ")?;
    let timestamp = NaiveDateTime::parse_from_str(ts, LINE_TS_FORMAT).ok()?;

    let tagged = rest
        .strip_prefix('[')
        .and_then(|r| r.split_once("] "))
        .filter(|(tag, _)| !tag.is_empty() && !tag.contains(char::is_whitespace));

    let (source, message) = match tagged {
        Some((tag, msg)) => (tag.to_string(), msg.to_string()),
        None => (SOURCE_SYSTEM.to_string(), rest.to_string()),
    };

    Some(LogEntry {
        timestamp,
        source,
        message,
    })
}
