use serde::{Deserialize, Serialize};

use crate::config::{InputKind, StreamConfig};

/// 采集子系统所在的平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// v4l2 采集 + alsa 音频
    Linux,
    /// dshow 设备采集，gdigrab 屏幕采集
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

const VIDEO_MARKER: &str = "video=";
const AUDIO_MARKER: &str = "audio=";

/// 码率字符串转为 bit/s: `5000k`、`4M`、`1500`，后缀不区分大小写；空串或非数字为 0
pub fn parse_bitrate(value: &str) -> u64 {
    let value = value.trim().to_ascii_lowercase();
    let (number, multiplier) = if let Some(n) = value.strip_suffix('k') {
        (n, 1_000.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 1_000_000.0)
    } else {
        (value.as_str(), 1.0)
    };

    match number.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => (n * multiplier).round() as u64,
        _ => 0,
    }
}

/// 由流配置生成编码器参数列表，纯函数，不做任何 I/O
pub fn build(config: &StreamConfig, platform: Platform) -> Vec<String> {
    let mut args = Args::default();
    args.push("-hide_banner").push("-y");

    push_input(&mut args, config, platform);
    push_video(&mut args, config);
    push_audio(&mut args, config);

    // 高级参数原样透传，不做校验
    for (key, value) in &config.advanced_options {
        args.push(key).push(value);
    }

    args.push("-f").push(&config.output.format);
    args.push(output_url(config));
    args.0
}

/// 供日志头使用的可读命令行，含空白的参数加引号
pub fn display_command_line(executable: &str, args: &[String]) -> String {
    std::iter::once(executable)
        .chain(args.iter().map(String::as_str))
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, arg: impl Into<String>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    fn push_opt(&mut self, flag: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.push(flag).push(v);
        }
        self
    }
}

fn push_input(args: &mut Args, config: &StreamConfig, platform: Platform) {
    let input = &config.input;

    if input.kind == InputKind::File {
        // 文件输入按实时速率读取，否则组播会被瞬间灌满
        args.push("-re").push("-i").push(&input.path);
        return;
    }

    let frame_rate = input.frame_rate.map(|f| f.to_string());
    match platform {
        Platform::Linux => {
            args.push("-f").push("v4l2");
            args.push_opt("-input_format", input.format.as_deref());
            args.push_opt("-video_size", input.resolution.as_deref());
            args.push_opt("-framerate", frame_rate.as_deref());
            args.push("-i").push(&input.path);
        }
        Platform::Windows if is_display_capture(&input.path) => {
            args.push("-f").push("gdigrab");
            args.push_opt("-video_size", input.resolution.as_deref());
            args.push_opt("-framerate", frame_rate.as_deref());
            args.push("-i").push(strip_marker(&input.path));
        }
        Platform::Windows => {
            args.push("-f").push("dshow");
            args.push_opt("-pixel_format", input.format.as_deref());
            args.push_opt("-video_size", input.resolution.as_deref());
            args.push_opt("-framerate", frame_rate.as_deref());
            args.push("-i").push(with_marker(&input.path, VIDEO_MARKER));
        }
    }

    let audio_device = config
        .audio
        .as_ref()
        .filter(|a| a.enabled)
        .and_then(|a| a.device.as_deref())
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if let Some(device) = audio_device {
        match platform {
            Platform::Linux => {
                args.push("-f").push("alsa").push("-i").push(device);
            }
            Platform::Windows => {
                args.push("-f")
                    .push("dshow")
                    .push("-i")
                    .push(with_marker(device, AUDIO_MARKER));
            }
        }
    }
}

fn push_video(args: &mut Args, config: &StreamConfig) {
    let video = &config.video;
    let bufsize = parse_bitrate(&video.bitrate) / 2 / 1_000;
    let gop = video.gop_size.to_string();

    args.push("-c:v").push(&video.codec);
    args.push_opt("-preset", video.preset.as_deref());
    args.push_opt("-tune", video.tune.as_deref());
    args.push("-b:v").push(&video.bitrate);
    args.push("-maxrate").push(&video.bitrate);
    args.push("-bufsize").push(format!("{bufsize}k"));
    args.push("-g").push(&gop);
    args.push("-keyint_min").push(&gop);
    args.push("-sc_threshold").push("0");
}

fn push_audio(args: &mut Args, config: &StreamConfig) {
    let audio = config.audio.as_ref().filter(|a| a.enabled);
    let codec = audio
        .and_then(|a| a.codec.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty());

    match (audio, codec) {
        (Some(audio), Some(codec)) => {
            args.push("-c:a").push(codec);
            args.push_opt("-b:a", audio.bitrate.as_deref());
            args.push("-ac").push("2");
        }
        _ => {
            args.push("-an");
        }
    }
}

fn output_url(config: &StreamConfig) -> String {
    let output = &config.output;
    let host = if output.address.contains(':') && !output.address.starts_with('[') {
        format!("[{}]", output.address)
    } else {
        output.address.clone()
    };

    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("pkt_size", &output.packet_size.to_string())
        .append_pair("buffer_size", &output.buffer_size.to_string())
        .append_pair("ttl", &output.ttl.to_string())
        .finish();

    format!("udp://{}:{}?{}", host, output.port, query)
}

/// gdigrab 的采集目标: desktop 或 title=<窗口标题>
fn is_display_capture(path: &str) -> bool {
    let bare = strip_marker(path);
    bare.eq_ignore_ascii_case("desktop") || bare.to_ascii_lowercase().starts_with("title=")
}

fn has_marker(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with(VIDEO_MARKER) || lower.starts_with(AUDIO_MARKER)
}

fn with_marker(path: &str, marker: &str) -> String {
    if has_marker(path) {
        path.to_string()
    } else {
        format!("{marker}{path}")
    }
}

fn strip_marker(path: &str) -> &str {
    if has_marker(path) {
        // 两种前缀长度相同
        &path[VIDEO_MARKER.len()..]
    } else {
        path
    }
}
