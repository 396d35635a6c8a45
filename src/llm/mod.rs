//! LLM 层：客户端抽象与实现（Ollama / OpenAI 兼容 / Mock）与进程级共享句柄

pub mod mock;
pub mod ollama;
pub mod openai;
pub mod shared;
pub mod traits;

pub use mock::{MockLlmClient, MOCK_FALLBACK_RESPONSE};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use shared::{create_client_from_config, ModelHandle, SerializedLlmClient};
pub use traits::{
    find_stop, parse_tool_call, remove_stop_sequences, AssistantMessage, Completion, GenerateOptions, LlmClient,
    LlmError, TokenUsage, UsageMeter,
};
