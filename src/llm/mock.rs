//! Mock LLM 客户端（用于测试与离线演示，无需模型服务）
//!
//! 按顺序返回预设脚本，脚本用尽后返回固定回复；记录每次收到的消息，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Completion, GenerateOptions, LlmClient, LlmError, TokenUsage};
use crate::memory::Message;

/// 脚本用尽后的默认回复：直接给出空命令列表
pub const MOCK_FALLBACK_RESPONSE: &str =
    "Thought: No model is configured, so I will not issue any command.\nCode:\n```py\nfinal_answer([])\n```<end_code>";

/// Mock 客户端：脚本化回复
#[derive(Debug)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::from_script(Vec::new())
    }
}

impl MockLlmClient {
    /// 按顺序返回这些回复
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_script(responses.into_iter().map(|r| Ok(r.into())).collect())
    }

    /// 脚本中可以包含错误，用于模拟生成失败
    pub fn from_script(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: MOCK_FALLBACK_RESPONSE.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// 已收到的请求（每次调用的完整消息序列）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], _options: &GenerateOptions) -> Result<Completion, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let text = match next {
            Some(result) => result?,
            None => self.fallback.clone(),
        };
        let input_tokens = messages.iter().map(|m| m.content.split_whitespace().count() as u64).sum();
        let output_tokens = text.split_whitespace().count() as u64;
        Ok(Completion {
            text,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
        })
    }

    fn model_id(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_script_then_fallback() {
        let mock = MockLlmClient::from_script(vec![
            Ok("first<end_code>ignored".to_string()),
            Err(LlmError::Request("down".into())),
        ])
        .with_fallback("done");
        let options = GenerateOptions {
            stop_sequences: vec!["<end_code>".into()],
            max_new_tokens: 10,
        };
        let msgs = vec![Message::user("hi")];
        let first = mock.generate(&msgs, &options, None).await.unwrap();
        assert_eq!(first.content, "first");
        assert!(mock.generate(&msgs, &options, None).await.is_err());
        assert_eq!(mock.generate(&msgs, &options, None).await.unwrap().content, "done");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.requests()[0][0].content, "hi");
    }
}
