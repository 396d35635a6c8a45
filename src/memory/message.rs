//! 发送给模型的消息

use serde::{Deserialize, Serialize};

/// 消息角色；ToolCall / ToolResponse 发送时分别折叠为 assistant / user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResponse,
}

impl Role {
    /// 聊天接口使用的角色名
    pub fn api_role(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User | Role::ToolResponse => "user",
            Role::Assistant | Role::ToolCall => "assistant",
        }
    }
}

/// 单条消息；images 为图片引用（base64 或路径），仅多模态后端使用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_roles_fold_into_chat_roles() {
        assert_eq!(Role::ToolCall.api_role(), "assistant");
        assert_eq!(Role::ToolResponse.api_role(), "user");
        assert_eq!(Role::System.api_role(), "system");
    }
}
