//! 记忆层：模型消息与按步骤追加的 Agent 记忆

pub mod message;
pub mod steps;

pub use message::{Message, Role};
pub use steps::{ActionStep, AgentMemory, MemoryStep, TaskStep, ToolCallRecord};
