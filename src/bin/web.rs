//! castle-web：战斗模拟客户端使用的 HTTP 接口
//!
//! 运行: `cargo run --features web --bin castle-web`
//! 地址取自 [server]，可用 CASTLE__SERVER__PORT 等环境变量覆盖。

#![cfg(feature = "web")]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

use castle::config::load_config;
use castle::AgentRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    castle::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("Invalid server address {}:{}", cfg.server.host, cfg.server.port))?;
    tracing::info!(provider = %cfg.llm.provider, model = %cfg.llm.model, "model loads on first command");

    castle::server::serve(AgentRuntime::new(cfg), addr).await
}
