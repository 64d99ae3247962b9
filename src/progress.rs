//! FFmpeg 进度行解析
//!
//! 例: `frame=  120 fps= 30 q=28.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1x`
//! 没有固定语法，尽力解析: 要么得到行内的 `key=value`，要么什么都没有。

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 单个进度行中的计数项，保持原始顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressStatistics {
    fields: IndexMap<String, String>,
}

impl ProgressStatistics {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn frame(&self) -> Option<u64> {
        self.get("frame")?.parse().ok()
    }

    pub fn fps(&self) -> Option<f64> {
        self.get("fps")?.parse().ok()
    }

    /// 输出码率 (kbps)，缺失或无法解析 (`N/A`) 时为 0
    pub fn bitrate_kbps(&self) -> u64 {
        self.get("bitrate").and_then(parse_kbps).unwrap_or(0)
    }
}

/// 解析一行编码器输出，非进度行返回 None
pub fn parse_progress(line: &str) -> Option<ProgressStatistics> {
    if !line.contains("frame=") || !line.contains("fps=") {
        return None;
    }

    let mut fields = IndexMap::new();
    for token in collapse_padding(line).split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), value.to_string());
    }

    Some(ProgressStatistics { fields })
}

/// FFmpeg 会右对齐数值 (`frame=  10`)，去掉 `=` 后的空白
fn collapse_padding(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut after_eq = false;
    for c in line.chars() {
        if after_eq && c.is_whitespace() {
            continue;
        }
        after_eq = c == '=';
        out.push(c);
    }
    out
}

/// `2450.0kbits/s` -> 2450, `2.45Mbits/s` -> 2450
fn parse_kbps(value: &str) -> Option<u64> {
    let lower = value.trim().to_ascii_lowercase();
    let (number, scale) = if let Some(n) = lower.strip_suffix("kbits/s") {
        (n, 1.0)
    } else if let Some(n) = lower.strip_suffix("mbits/s") {
        (n, 1_000.0)
    } else {
        return None;
    };

    let n: f64 = number.trim().parse().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some((n * scale).round() as u64)
}
