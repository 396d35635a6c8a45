//! Agent 错误类型
//!
//! 所有错误都是步骤内的：记录在 ActionStep 中，并在下一轮 prompt 中展示给模型；
//! 配合 RecoveryEngine 生成纠正提示。

use thiserror::Error;

use crate::sandbox::InterpreterError;

/// 单步可能出现的错误（生成、解析、执行、未授权导入、最终答案校验）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Error in generating model output:\n{0}")]
    Generation(String),

    #[error("Error in code parsing:\n{0}\nMake sure to provide correct code blobs.")]
    Parsing(String),

    #[error("{0}")]
    Execution(String),

    /// 执行失败的子类：导入了授权列表之外的模块
    #[error("Import of {module} is not allowed. Authorized imports are: {}", quote_all(.authorized))]
    ImportDenied {
        module: String,
        authorized: Vec<String>,
    },

    #[error("Check {check} failed with error: {reason}")]
    ValidationFailure { check: String, reason: String },
}

fn quote_all(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|m| format!("'{}'", m)).collect();
    format!("[{}]", quoted.join(", "))
}

impl AgentError {
    /// 简短类别名，用于日志与事件
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Generation(_) => "generation",
            AgentError::Parsing(_) => "parsing",
            AgentError::Execution(_) => "execution",
            AgentError::ImportDenied { .. } => "import_denied",
            AgentError::ValidationFailure { .. } => "validation",
        }
    }
}

impl From<InterpreterError> for AgentError {
    fn from(e: InterpreterError) -> Self {
        match e {
            InterpreterError::ImportDenied { module, authorized } => {
                AgentError::ImportDenied { module, authorized }
            }
            other => AgentError::Execution(other.to_string()),
        }
    }
}

/// 记录在 ActionStep 中的错误：错误本身 + 展示给模型的纠正提示
#[derive(Debug, Clone, PartialEq)]
pub struct StepError {
    pub error: AgentError,
    pub hint: String,
}

impl StepError {
    /// 下一轮 prompt 中的错误描述
    pub fn render(&self) -> String {
        format!("Error:\n{}\n{}\n", self.error, self.hint)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_denied_converts_from_interpreter_error() {
        let err: AgentError = InterpreterError::ImportDenied {
            module: "os".into(),
            authorized: vec!["math".into(), "statistics".into()],
        }
        .into();
        assert_eq!(err.kind(), "import_denied");
        assert_eq!(
            err.to_string(),
            "Import of os is not allowed. Authorized imports are: ['math', 'statistics']"
        );
    }

    #[test]
    fn test_runtime_error_becomes_execution_error() {
        let err: AgentError = InterpreterError::Runtime {
            line: 3,
            message: "NameError: The variable `y` is not defined.".into(),
        }
        .into();
        assert!(matches!(err, AgentError::Execution(ref m) if m.contains("line 3")));
    }

    #[test]
    fn test_validation_failure_message() {
        let err = AgentError::ValidationFailure {
            check: "commands_well_formed".into(),
            reason: "answer is not a list".into(),
        };
        assert_eq!(
            err.to_string(),
            "Check commands_well_formed failed with error: answer is not a list"
        );
    }
}
