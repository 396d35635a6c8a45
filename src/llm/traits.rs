//! LLM 客户端抽象
//!
//! 所有后端（Ollama / OpenAI 兼容 / Mock）实现 LlmClient::complete；generate 在其上统一做
//! 停止序列截断，并在传入能力列表时走函数调用路径（解析单个 JSON 调用）。

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::memory::{Message, ToolCallRecord};
use crate::tools::{tool_call_schema_json, CapabilityRegistry};

/// LLM 层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    /// 函数调用路径：输出中没有合法的 JSON 调用
    #[error("{0}")]
    MalformedToolCall(String),

    #[error("model initialization failed: {0}")]
    Init(String),
}

/// 单次调用的 token 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 累计 token 计数（各后端内部持有）
#[derive(Debug, Default)]
pub struct UsageMeter {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl UsageMeter {
    pub fn add(&self, usage: TokenUsage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

/// 生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// 按顺序排列的停止序列；输出截断在最早出现的那个之前
    pub stop_sequences: Vec<String>,
    /// 生成长度硬上限（token）
    pub max_new_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            stop_sequences: Vec::new(),
            max_new_tokens: 1000,
        }
    }
}

/// 后端原始补全结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// 一条 assistant 消息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantMessage {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub token_usage: TokenUsage,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 原始补全；实现应遵守 max_new_tokens，可在流中提前停止
    async fn complete(&self, messages: &[Message], options: &GenerateOptions) -> Result<Completion, LlmError>;

    fn model_id(&self) -> &str;

    /// 累计 token 使用量，默认不统计
    fn total_usage(&self) -> TokenUsage {
        TokenUsage::default()
    }

    /// 生成一条 assistant 消息：停止序列截断、token 计数；传入 capabilities 时解析为结构化调用
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        capabilities: Option<&CapabilityRegistry>,
    ) -> Result<AssistantMessage, LlmError> {
        let Some(capabilities) = capabilities else {
            let completion = self.complete(messages, options).await?;
            return Ok(AssistantMessage {
                content: remove_stop_sequences(&completion.text, &options.stop_sequences),
                tool_calls: Vec::new(),
                token_usage: completion.usage,
            });
        };

        let mut with_tools = Vec::with_capacity(messages.len() + 1);
        with_tools.push(Message::system(tool_call_prompt(capabilities)));
        with_tools.extend_from_slice(messages);
        let completion = self.complete(&with_tools, options).await?;
        let text = remove_stop_sequences(&completion.text, &options.stop_sequences);
        let call = parse_tool_call(&text)?;
        Ok(AssistantMessage {
            content: String::new(),
            tool_calls: vec![call],
            token_usage: completion.usage,
        })
    }
}

/// 截断在最早出现的停止序列之前
pub fn remove_stop_sequences(text: &str, stop_sequences: &[String]) -> String {
    match find_stop(text, stop_sequences) {
        Some(idx) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// 最早出现的停止序列的字节位置
pub fn find_stop(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

fn tool_call_prompt(capabilities: &CapabilityRegistry) -> String {
    let descriptors = serde_json::to_string_pretty(&capabilities.descriptors()).unwrap_or_default();
    format!(
        "You can call exactly one of these tools:\n{}\n\nAnswer with a single JSON object matching this schema:\n{}",
        descriptors,
        tool_call_schema_json()
    )
}

/// 函数调用路径：去掉 `Action:` 前缀，取第一个 `{` 到最后一个 `}` 解析为 `{name, arguments}`
pub fn parse_tool_call(output: &str) -> Result<ToolCallRecord, LlmError> {
    let output = match output.split_once("Action:") {
        Some((_, rest)) => rest.trim(),
        None => output,
    };
    let (start, end) = match (output.find('{'), output.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(LlmError::MalformedToolCall("No json blob found in output!".to_string())),
    };
    let blob = &output[start..=end];
    let parsed: serde_json::Value = serde_json::from_str(blob).map_err(|e| {
        LlmError::MalformedToolCall(format!("Tool call '{}' has an invalid JSON structure: {}", blob, e))
    })?;
    let name = parsed
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| LlmError::MalformedToolCall(format!("Tool call '{}' has no name", blob)))?;
    Ok(ToolCallRecord {
        name: name.to_string(),
        arguments: parsed.get("arguments").cloned().unwrap_or(serde_json::Value::Null),
        id: format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    })
}
