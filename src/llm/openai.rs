//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；`stop` 与 `max_tokens`
//! 随请求下发，返回后仍由 generate 做一次截断。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{Completion, GenerateOptions, LlmClient, LlmError, TokenUsage, UsageMeter};
use crate::memory::{Message, Role};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// OpenAI 接口最多接受 4 个停止序列
const MAX_API_STOP_SEQUENCES: usize = 4;

fn invalid_request(e: impl std::fmt::Display) -> LlmError {
    LlmError::Request(format!("invalid request: {}", e))
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: UsageMeter,
}

impl OpenAiClient {
    /// api_key 未传入时由 OpenAIConfig 读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let base_url = base_url.unwrap_or(DEFAULT_OPENAI_URL).trim_end_matches('/');
        let mut config = OpenAIConfig::new().with_api_base(base_url);
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: UsageMeter::default(),
        }
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let content = m.content.clone();
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(invalid_request)?,
                    ),
                    Role::User | Role::ToolResponse => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(invalid_request)?,
                    ),
                    Role::Assistant | Role::ToolCall => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(invalid_request)?,
                    ),
                })
            })
            .collect()
    }

    #[allow(deprecated)]
    fn build_request(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .max_tokens(options.max_new_tokens);
        if !options.stop_sequences.is_empty() {
            let stops: Vec<String> = options
                .stop_sequences
                .iter()
                .take(MAX_API_STOP_SEQUENCES)
                .cloned()
                .collect();
            args.stop(stops);
        }
        args.build().map_err(invalid_request)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message], options: &GenerateOptions) -> Result<Completion, LlmError> {
        let request = self.build_request(messages, options)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                input_tokens: u64::from(u.prompt_tokens),
                output_tokens: u64::from(u.completion_tokens),
            })
            .unwrap_or_default();
        self.usage.add(usage);
        tracing::debug!(
            model = %self.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "openai completion"
        );

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response has no message content".to_string()))?;
        Ok(Completion { text, usage })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn total_usage(&self) -> TokenUsage {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_carries_limits() {
        let client = OpenAiClient::new(Some("http://localhost:8000/v1/"), "gpt", Some("k"));
        let request = client
            .build_request(
                &[Message::system("rules"), Message::user("hi"), Message::assistant("ok")],
                &GenerateOptions {
                    stop_sequences: vec!["<end_code>".into(), "Observation:".into()],
                    max_new_tokens: 64,
                },
            )
            .unwrap();
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "gpt");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stop"], json!(["<end_code>", "Observation:"]));
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_stop_sequences_are_capped() {
        let client = OpenAiClient::new(None, "gpt", None);
        let stops: Vec<String> = (0..6).map(|i| format!("<s{}>", i)).collect();
        let request = client
            .build_request(
                &[Message::user("hi")],
                &GenerateOptions {
                    stop_sequences: stops,
                    max_new_tokens: 8,
                },
            )
            .unwrap();
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["stop"].as_array().unwrap().len(), MAX_API_STOP_SEQUENCES);
        assert_eq!(client.model_id(), "gpt");
    }
}
