//! castle - 战斗指令代码 Agent
//!
//! 战斗模拟客户端发来战场快照与自然语言指令，代码 Agent 让模型写出调用游戏内命令的代码，
//! 在沙箱中执行后把命令列表返回给客户端。
//!
//! 模块划分：
//! - **agent**: 无头运行时（CLI 与 HTTP 服务共用，持有共享模型）
//! - **castle**: 战场实体解码、游戏内命令、CastleAgent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 步骤错误分类与恢复提示
//! - **llm**: LLM 客户端抽象与实现（Ollama / OpenAI 兼容 / Mock）、共享模型句柄
//! - **memory**: 模型消息与按步骤追加的 Agent 记忆
//! - **observability**: tracing 初始化
//! - **react**: 代码提取、prompt 渲染、答案校验、代码 Agent 主循环
//! - **sandbox**: 受限 Python 子集解释器
//! - **server**: HTTP 接口（feature `web`）
//! - **tools**: 能力注册表与函数调用 Schema

pub mod agent;
pub mod castle;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
#[cfg(feature = "web")]
pub mod server;
pub mod tools;

pub use agent::{AgentRuntime, CommandError};
pub use castle::CastleAgent;
pub use react::CodeAgent;
