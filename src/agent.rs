//! Headless Agent 运行时
//!
//! 供 CLI 与 HTTP 服务共用：持有配置与进程级模型句柄，每条命令构建一个新的 CastleAgent，
//! 模型在第一次使用时才加载，之后所有请求共享。

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::castle::{decode_battlefield, pretty_list, CastleAgent, CommandsWellFormed, DecodeError};
use crate::config::AppConfig;
use crate::llm::{create_client_from_config, LlmClient, LlmError, ModelHandle};
use crate::react::{AgentSettings, ReactEvent, SharedCheck};

/// 单条命令的失败原因（步数用尽不算失败，结果为 None）
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("invalid game objects: {0}")]
    Decode(#[from] DecodeError),

    #[error("model unavailable: {0}")]
    Model(#[from] LlmError),

    #[error("prompt rendering failed: {0}")]
    Prompt(#[from] minijinja::Error),
}

/// 运行时：配置 + 共享模型
#[derive(Clone)]
pub struct AgentRuntime {
    config: Arc<AppConfig>,
    model: ModelHandle,
}

impl AgentRuntime {
    /// 模型按 [llm] 配置懒加载
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            model: ModelHandle::new(),
        }
    }

    /// 直接注入已构建的模型（测试、离线演示）
    pub fn with_client(config: AppConfig, client: Arc<dyn LlmClient>) -> Self {
        Self {
            config: Arc::new(config),
            model: ModelHandle::with_client(client),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn settings(&self) -> AgentSettings {
        AgentSettings::from_config(&self.config)
    }

    /// 取得共享模型，首次调用时构建
    pub async fn llm(&self) -> Result<Arc<dyn LlmClient>, LlmError> {
        if self.model.is_loaded() {
            tracing::debug!("found existing model");
        }
        let config = Arc::clone(&self.config);
        self.model
            .get_or_init(|| async move { create_client_from_config(&config.llm) })
            .await
    }

    /// 解码战场并执行一条玩家请求；最终答案必须是格式正确的命令列表
    pub async fn process_command(
        &self,
        records: &[serde_json::Value],
        command: &str,
        event_tx: Option<mpsc::UnboundedSender<ReactEvent>>,
    ) -> Result<Option<serde_json::Value>, CommandError> {
        let objects = decode_battlefield(records)?;
        tracing::info!("got game_objects\n{}", pretty_list(&objects));

        let llm = self.llm().await?;
        let checks: Vec<SharedCheck> = vec![Arc::new(CommandsWellFormed::default())];
        let mut agent = CastleAgent::new(llm, self.settings())?.with_checks(checks);
        if let Some(tx) = event_tx {
            agent = agent.with_event_tx(tx);
        }
        tracing::info!("running command \"{}\"", command);
        Ok(agent.run_battle_command(&objects, command).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_process_command_with_mock_fallback() {
        let mut config = AppConfig::default();
        config.llm.provider = "mock".into();
        let runtime = AgentRuntime::new(config);
        assert!(!runtime.model().is_loaded());
        let result = runtime
            .process_command(
                &[json!({"id": 1, "type": "structure", "position": {"x": 0, "y": 0}, "ally": true})],
                "hold position",
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, Some(json!([])));
        assert!(runtime.model().is_loaded());
    }

    #[tokio::test]
    async fn test_process_command_rejects_bad_records() {
        let runtime = AgentRuntime::with_client(AppConfig::default(), Arc::new(MockLlmClient::default()));
        let err = runtime
            .process_command(&[json!({"id": 1, "type": "unit", "position": [0, 0]})], "go", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_model_error() {
        let mut config = AppConfig::default();
        config.llm.provider = "unknown".into();
        let runtime = AgentRuntime::new(config);
        let err = runtime.process_command(&[], "go", None).await.unwrap_err();
        assert!(matches!(err, CommandError::Model(LlmError::Init(_))));
    }
}
