use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::command::Platform;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,

    /// 每次启动生成一个日志文件: <log_dir>/<id>_<时间戳>.log
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 发送 `q` 之后等待编码器自行退出的时间，超时则强制结束
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// 编码器异常退出后，自动重启前的固定等待时间
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// 手动重启时 stop 与 start 之间的停顿
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,

    /// 覆盖采集子系统的平台判断 (默认按编译目标)
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// 单个编码任务的配置，由外部配置存储提供，运行时只读
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 服务启动时是否自动拉起
    #[serde(default)]
    pub auto_start: bool,
    pub input: InputConfig,
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: Option<AudioConfig>,
    pub output: OutputConfig,

    /// 额外的编码器参数，按声明顺序原样追加
    #[serde(default)]
    pub advanced_options: IndexMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Device,
    File,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InputConfig {
    pub kind: InputKind,
    /// 设备路径 (/dev/video0, "video=USB Camera", desktop) 或文件路径
    pub path: String,
    /// 像素 / 输入格式，仅对采集设备生效
    #[serde(default)]
    pub format: Option<String>,
    /// 形如 1920x1080
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VideoConfig {
    pub codec: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub tune: Option<String>,
    /// 带单位后缀的码率，如 "5000k" / "4M"
    pub bitrate: String,
    pub gop_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub bitrate: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// 组播地址
    pub address: String,
    pub port: u16,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    /// 容器格式 (mpegts)
    #[serde(default = "default_output_format")]
    pub format: String,
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,
    #[serde(default = "default_socket_buffer")]
    pub buffer_size: u32,
}

impl StreamConfig {
    /// 展示用名称，未配置时回退到 id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

fn default_restart_pause_ms() -> u64 {
    1_000
}

fn default_ttl() -> u8 {
    16
}

fn default_output_format() -> String {
    "mpegts".to_string()
}

fn default_packet_size() -> u32 {
    1316
}

fn default_socket_buffer() -> u32 {
    65_536
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 配置进入编排器之前的最低限度校验
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.trim().is_empty() {
                bail!("stream with empty id");
            }
            // id 会成为日志文件名的一部分
            if !is_file_safe_id(&stream.id) {
                bail!("stream id [{}] must not contain path separators", stream.id);
            }
            if !seen.insert(stream.id.as_str()) {
                bail!("duplicate stream id [{}]", stream.id);
            }
            if stream.output.port == 0 {
                bail!("stream [{}] has output port 0", stream.id);
            }
        }
        Ok(())
    }
}

fn is_file_safe_id(id: &str) -> bool {
    id != "."
        && id != ".."
        && !id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
}

/// 编排器读取流配置的入口，配置的增删改由外部存储负责
pub trait ConfigStore: Send + Sync {
    fn get(&self, id: &str) -> Option<StreamConfig>;
    fn list(&self) -> Vec<StreamConfig>;
}

/// 由配置文件加载的只读存储
pub struct StaticConfigStore {
    streams: Vec<StreamConfig>,
}

impl StaticConfigStore {
    pub fn new(streams: Vec<StreamConfig>) -> Self {
        Self { streams }
    }
}

impl ConfigStore for StaticConfigStore {
    fn get(&self, id: &str) -> Option<StreamConfig> {
        self.streams.iter().find(|s| s.id == id).cloned()
    }

    fn list(&self) -> Vec<StreamConfig> {
        self.streams.clone()
    }
}
