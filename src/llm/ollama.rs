//! Ollama 本地模型客户端（流式 `/api/chat`）
//!
//! 边接收边检测停止序列，命中后立即截断并丢弃剩余流；`num_predict` 作为生成长度硬上限。
//! token 计数取自最终块的 `prompt_eval_count` / `eval_count`。

use futures_util::StreamExt;
use serde_json::json;

use async_trait::async_trait;

use crate::llm::{find_stop, Completion, GenerateOptions, LlmClient, LlmError, TokenUsage, UsageMeter};
use crate::memory::Message;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    usage: UsageMeter,
}

impl OllamaClient {
    pub fn new(base_url: Option<&str>, model: &str) -> Self {
        Self {
            base_url: base_url.unwrap_or(DEFAULT_OLLAMA_URL).trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
            usage: UsageMeter::default(),
        }
    }

    fn request_body(&self, messages: &[Message], options: &GenerateOptions) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let mut msg = json!({ "role": m.role.api_role(), "content": m.content });
                if !m.images.is_empty() {
                    msg["images"] = json!(m.images);
                }
                msg
            })
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": {
                "num_predict": options.max_new_tokens,
                "stop": options.stop_sequences,
            },
        })
    }
}

/// 流式累积状态
#[derive(Default)]
struct StreamState {
    text: String,
    usage: TokenUsage,
    done: bool,
    /// 尚未凑成整行的原始字节；多字节字符可能被拆在两个块之间
    pending: Vec<u8>,
}

impl StreamState {
    /// 处理一个网络块：只解码完整的行；返回 true 表示应停止读取
    fn feed_bytes(&mut self, bytes: &[u8], stop_sequences: &[String]) -> Result<bool, LlmError> {
        self.pending.extend_from_slice(bytes);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            if self.feed_line(&line, stop_sequences)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 流结束后处理没有换行结尾的最后一行
    fn finish(&mut self, stop_sequences: &[String]) -> Result<(), LlmError> {
        if self.done || self.pending.is_empty() {
            return Ok(());
        }
        let raw = std::mem::take(&mut self.pending);
        self.feed_line(&String::from_utf8_lossy(&raw), stop_sequences)?;
        Ok(())
    }

    /// 处理一行 NDJSON；返回 true 表示应停止读取
    fn feed_line(&mut self, line: &str, stop_sequences: &[String]) -> Result<bool, LlmError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }
        let data: serde_json::Value =
            serde_json::from_str(line).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if let Some(err) = data.get("error").and_then(|e| e.as_str()) {
            return Err(LlmError::Request(err.to_string()));
        }
        if let Some(token) = data["message"]["content"].as_str() {
            self.text.push_str(token);
        }
        if data["done"].as_bool() == Some(true) {
            self.usage = TokenUsage {
                input_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0),
                output_tokens: data["eval_count"].as_u64().unwrap_or(0),
            };
            self.done = true;
            return Ok(true);
        }
        if let Some(idx) = find_stop(&self.text, stop_sequences) {
            self.text.truncate(idx);
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, messages: &[Message], options: &GenerateOptions) -> Result<Completion, LlmError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&self.request_body(messages, options))
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let mut bytes_stream = response.bytes_stream();
        let mut state = StreamState::default();
        let mut stopped = false;
        // 一个块可能包含多行，也可能只有半行
        while let Some(chunk) = bytes_stream.next().await {
            let bytes = chunk.map_err(|e| LlmError::Request(e.to_string()))?;
            if state.feed_bytes(&bytes, &options.stop_sequences)? {
                stopped = true;
                break;
            }
        }
        if !stopped {
            state.finish(&options.stop_sequences)?;
        }

        tracing::debug!(
            model = %self.model,
            input_tokens = state.usage.input_tokens,
            output_tokens = state.usage.output_tokens,
            "ollama completion"
        );
        self.usage.add(state.usage);
        Ok(Completion {
            text: state.text,
            usage: state.usage,
        })
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

    #[test]
    fn test_stream_state_stops_on_stop_sequence() {
        let stops = vec!["<end_code>".to_string()];
        let mut state = StreamState::default();
        assert!(!state
            .feed_line(r#"{"message":{"content":"```py\nx = 1\n```"},"done":false}"#, &stops)
            .unwrap());
        // 停止序列跨块到达
        assert!(!state
            .feed_line(r#"{"message":{"content":"<end_"},"done":false}"#, &stops)
            .unwrap());
        assert!(state
            .feed_line(r#"{"message":{"content":"code> trailing"},"done":false}"#, &stops)
            .unwrap());
        assert_eq!(state.text, "```py\nx = 1\n```");
    }

    #[test]
    fn test_multibyte_characters_split_across_chunks() {
        let stream = "{\"message\":{\"content\":\"charge 中路 é\"},\"done\":false}\n{\"message\":{\"content\":\"!\"},\"done\":false}";
        let bytes = stream.as_bytes();
        let mut state = StreamState::default();
        // 每个块 3 字节，必然切开多字节字符
        for chunk in bytes.chunks(3) {
            assert!(!state.feed_bytes(chunk, &[]).unwrap());
        }
        assert_eq!(state.text, "charge 中路 é");
        state.finish(&[]).unwrap();
        assert_eq!(state.text, "charge 中路 é!");
        assert!(!state.text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_stream_state_reads_final_counts() {
        let mut state = StreamState::default();
        let done = state
            .feed_line(r#"{"message":{"content":""},"done":true,"prompt_eval_count":12,"eval_count":3}"#, &[])
            .unwrap();
        assert!(done);
        assert_eq!(state.usage, TokenUsage { input_tokens: 12, output_tokens: 3 });
    }

    #[test]
    fn test_stream_state_surfaces_errors() {
        let mut state = StreamState::default();
        assert!(matches!(
            state.feed_line(r#"{"error":"model not found"}"#, &[]),
            Err(LlmError::Request(m)) if m == "model not found"
        ));
    }

    #[test]
    fn test_request_body_carries_limits() {
        let client = OllamaClient::new(None, "qwen");
        let body = client.request_body(
            &[Message::system("s"), Message::user("u")],
            &GenerateOptions {
                stop_sequences: vec!["<end_code>".into()],
                max_new_tokens: 42,
            },
        );
        assert_eq!(body["options"]["num_predict"], 42);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], true);
    }
}
