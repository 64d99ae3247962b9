mod command;
mod config;
mod engine;
mod error;
mod events;
mod log_sink;
mod process;
mod progress;
mod state;
mod supervisor;
mod web;

use clap::Parser;
use config::{AppConfig, StaticConfigStore};
use engine::{Engine, EngineSettings};
use events::BroadcastSink;
use state::AppState;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// VTX Mcast - 组播编码任务守护进程
/// 解析命令行参数，加载配置，拉起自动启动的流并提供状态查询接口
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-mcast.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可用 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    let settings = EngineSettings::from_server(&config.server);
    info!(
        "VTX Mcast initialized. {} stream(s), encoder: {}, logs: {:?}, platform: {:?}",
        config.streams.len(),
        settings.ffmpeg_binary,
        settings.log_dir,
        settings.platform
    );

    // 事件广播，附带一个日志订阅者
    let broadcast = BroadcastSink::new(256);
    tokio::spawn(events::log_events(broadcast.subscribe()));

    let store = Arc::new(StaticConfigStore::new(config.streams.clone()));
    let engine = Arc::new(Engine::new(settings, store, Arc::new(broadcast)));

    // 拉起配置为自动启动的流
    engine.autostart().await;

    let state = Arc::new(AppState {
        engine: engine.clone(),
    });
    let app = web::router(state);

    // 启动HTTP服务，收到退出信号后停止所有编码进程
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.stop_all().await;
    info!("VTX Mcast shut down.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
