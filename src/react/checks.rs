//! 最终答案校验
//!
//! 得到最终答案后依次运行；任一校验返回 false 或报错时丢弃答案，记为该步的 ValidationFailure。

use std::sync::Arc;

use crate::memory::AgentMemory;

/// 校验 trait：输入为最终答案与当前记忆
pub trait FinalAnswerCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Ok(true) 通过；Ok(false) 或 Err(原因) 均视为失败
    fn check(&self, answer: &serde_json::Value, memory: &AgentMemory) -> Result<bool, String>;
}

type CheckFn = dyn Fn(&serde_json::Value, &AgentMemory) -> Result<bool, String> + Send + Sync;

/// 闭包形式的校验
pub struct FnCheck {
    name: String,
    f: Box<CheckFn>,
}

impl FnCheck {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&serde_json::Value, &AgentMemory) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl FinalAnswerCheck for FnCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, answer: &serde_json::Value, memory: &AgentMemory) -> Result<bool, String> {
        (self.f)(answer, memory)
    }
}

pub type SharedCheck = Arc<dyn FinalAnswerCheck>;

/// 依次运行校验；返回第一个失败的 (校验名, 原因)
pub fn run_checks(
    checks: &[SharedCheck],
    answer: &serde_json::Value,
    memory: &AgentMemory,
) -> Result<(), (String, String)> {
    for check in checks {
        match check.check(answer, memory) {
            Ok(true) => {}
            Ok(false) => return Err((check.name().to_string(), "check returned false".to_string())),
            Err(reason) => return Err((check.name().to_string(), reason)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_checks_reports_first_failure() {
        let checks: Vec<SharedCheck> = vec![
            Arc::new(FnCheck::new("is_list", |a, _| Ok(a.is_array()))),
            Arc::new(FnCheck::new("non_empty", |a, _| {
                if a.as_array().map(|l| l.is_empty()).unwrap_or(true) {
                    Err("answer is empty".into())
                } else {
                    Ok(true)
                }
            })),
        ];
        let memory = AgentMemory::new("sys");
        assert!(run_checks(&checks, &serde_json::json!([1]), &memory).is_ok());
        assert_eq!(
            run_checks(&checks, &serde_json::json!("x"), &memory),
            Err(("is_list".to_string(), "check returned false".to_string()))
        );
        assert_eq!(
            run_checks(&checks, &serde_json::json!([]), &memory),
            Err(("non_empty".to_string(), "answer is empty".to_string()))
        );
    }
}
