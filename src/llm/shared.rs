//! 进程级共享模型
//!
//! - SerializedLlmClient：异步互斥包装，多个并发 run 轮流调用同一后端
//! - ModelHandle：懒加载句柄，首次使用时构建，并发首次调用下工厂也只执行一次
//! - create_client_from_config：按 `[llm]` 配置选择后端

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::config::LlmSection;
use crate::llm::{
    Completion, GenerateOptions, LlmClient, LlmError, MockLlmClient, OllamaClient, OpenAiClient, TokenUsage,
};
use crate::memory::Message;

/// 串行化包装：同一时刻只有一个请求进入后端
pub struct SerializedLlmClient {
    inner: Arc<dyn LlmClient>,
    gate: Mutex<()>,
}

impl SerializedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl LlmClient for SerializedLlmClient {
    async fn complete(&self, messages: &[Message], options: &GenerateOptions) -> Result<Completion, LlmError> {
        let _turn = self.gate.lock().await;
        self.inner.complete(messages, options).await
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn total_usage(&self) -> TokenUsage {
        self.inner.total_usage()
    }
}

/// 懒加载的共享模型句柄（克隆后共享同一个单元）
#[derive(Clone, Default)]
pub struct ModelHandle {
    cell: Arc<OnceCell<Arc<dyn LlmClient>>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先放入已构建的客户端（测试或 CLI 直接注入）
    pub fn with_client(client: Arc<dyn LlmClient>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(client))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// 取得模型；未加载时运行 factory。factory 失败时单元保持为空，下次调用会重试
    pub async fn get_or_init<F, Fut>(&self, factory: F) -> Result<Arc<dyn LlmClient>, LlmError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn LlmClient>, LlmError>>,
    {
        let client = self
            .cell
            .get_or_try_init(|| async move {
                tracing::info!("Loading model backend");
                let client = factory().await?;
                Ok::<_, LlmError>(Arc::new(SerializedLlmClient::new(client)) as Arc<dyn LlmClient>)
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

/// 根据配置选择后端（ollama / openai / mock）
pub fn create_client_from_config(cfg: &LlmSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    let provider = cfg.provider.to_lowercase();
    match provider.as_str() {
        "ollama" => {
            tracing::info!("Using Ollama LLM ({})", cfg.model);
            Ok(Arc::new(OllamaClient::new(cfg.base_url.as_deref(), &cfg.model)))
        }
        "openai" => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
            Ok(Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, None)))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM, every command resolves to an empty list");
            Ok(Arc::new(MockLlmClient::default()))
        }
        other => Err(LlmError::Init(format!("unknown llm provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_model_handle_initializes_once_under_concurrency() {
        let handle = ModelHandle::new();
        let built = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            let built = Arc::clone(&built);
            tasks.push(tokio::spawn(async move {
                handle
                    .get_or_init(|| async move {
                        built.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(Arc::new(MockLlmClient::default()) as Arc<dyn LlmClient>)
                    })
                    .await
                    .map(|c| c.model_id().to_string())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "mock");
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(handle.is_loaded());
    }

    #[tokio::test]
    async fn test_model_handle_retries_after_failed_init() {
        let handle = ModelHandle::new();
        let first = handle
            .get_or_init(|| async { Err(LlmError::Init("no backend".into())) })
            .await;
        assert!(first.is_err());
        assert!(!handle.is_loaded());
        let second = handle
            .get_or_init(|| async { Ok(Arc::new(MockLlmClient::default()) as Arc<dyn LlmClient>) })
            .await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_create_client_from_config() {
        let mut cfg = LlmSection::default();
        cfg.provider = "Mock".into();
        assert_eq!(create_client_from_config(&cfg).unwrap().model_id(), "mock");
        cfg.provider = "ollama".into();
        cfg.model = "qwen2.5-coder:7b".into();
        assert_eq!(create_client_from_config(&cfg).unwrap().model_id(), "qwen2.5-coder:7b");
        cfg.provider = "llamafile".into();
        assert!(matches!(create_client_from_config(&cfg), Err(LlmError::Init(_))));
    }
}
