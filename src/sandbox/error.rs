//! 沙箱错误类型
//!
//! ImportDenied 单独成类，便于编排层给出「未授权导入」的专门纠正提示。

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpreterError {
    #[error("Code parsing failed on line {line} due to: {message}")]
    Syntax { line: usize, message: String },

    #[error("Import of {module} is not allowed. Authorized imports are: {}", format_authorized(.authorized))]
    ImportDenied {
        module: String,
        authorized: Vec<String>,
    },

    #[error("Code execution failed at line {line} due to: {message}")]
    Runtime { line: usize, message: String },

    /// 操作数 / 递归深度等资源上限
    #[error("{0}")]
    Limit(String),
}

impl InterpreterError {
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        InterpreterError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn is_import_denied(&self) -> bool {
        matches!(self, InterpreterError::ImportDenied { .. })
    }
}

fn format_authorized(authorized: &[String]) -> String {
    let quoted: Vec<String> = authorized.iter().map(|m| format!("'{}'", m)).collect();
    format!("[{}]", quoted.join(", "))
}
