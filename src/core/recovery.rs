//! 错误恢复引擎
//!
//! 根据 AgentError 给出纠正提示，随错误一起写入 ActionStep，下一轮由模型读取后自行修正。
//! 循环内没有额外重试：恢复只发生在下一次迭代。

use crate::core::{AgentError, StepError};

/// 通用重试提示
pub const RETRY_HINT: &str = "Now let's retry: take care not to repeat previous errors! If you have retried several times, try a completely different approach.";

/// 语义化错误恢复：将错误映射为纠正提示
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn hint(&self, err: &AgentError) -> String {
        match err {
            AgentError::ImportDenied { authorized, .. } => format!(
                "Do not import that module again: only the authorized imports {:?} and the provided commands are available. {}",
                authorized, RETRY_HINT
            ),
            AgentError::Parsing(_) => format!(
                "Your code must be wrapped in a ```py ... ``` block ending with <end_code>. {}",
                RETRY_HINT
            ),
            AgentError::ValidationFailure { .. } => format!(
                "The final answer was rejected, fix it before calling final_answer again. {}",
                RETRY_HINT
            ),
            AgentError::Generation(_) | AgentError::Execution(_) => RETRY_HINT.to_string(),
        }
    }

    /// 错误 + 提示，写入 ActionStep
    pub fn handle(&self, err: AgentError) -> StepError {
        let hint = self.hint(&err);
        StepError { error: err, hint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_import_denied_names_authorized_imports() {
        let engine = RecoveryEngine::new();
        let step_error = engine.handle(AgentError::ImportDenied {
            module: "os".into(),
            authorized: vec!["math".into()],
        });
        assert!(step_error.hint.contains("[\"math\"]"));
        assert!(step_error.hint.ends_with(RETRY_HINT));
    }

    #[test]
    fn test_recovery_generic_hint() {
        let engine = RecoveryEngine::new();
        let step_error = engine.handle(AgentError::Execution("boom".into()));
        assert_eq!(step_error.hint, RETRY_HINT);
        assert_eq!(
            step_error.render(),
            format!("Error:\nboom\n{}\n", RETRY_HINT)
        );
    }

    #[test]
    fn test_recovery_parsing_hint() {
        let engine = RecoveryEngine::new();
        let hint = engine.hint(&AgentError::Parsing("no code".into()));
        assert!(hint.contains("```py"));
    }
}
