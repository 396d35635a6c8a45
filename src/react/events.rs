//! Agent 过程事件：用于 CLI / 前端实时展示每一步的模型输出、代码、观察与结果

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 第几步开始
    StepStarted { step: usize, max_steps: usize },
    /// 模型原始输出（已按停止序列截断）
    ModelOutput { step: usize, text: String },
    /// 解析出的待执行代码
    CodeParsed { step: usize, code: String },
    /// 执行观察（日志 + 最后输出）
    Observation { step: usize, text: String, is_final_answer: bool },
    /// 步骤失败（生成 / 解析 / 执行 / 校验）
    StepFailed { step: usize, kind: String, message: String },
    /// 得到最终答案
    FinalAnswer { step: usize, answer: serde_json::Value },
    /// 步数用尽仍无答案
    NoAnswer { steps: usize },
    /// Token 使用统计（本步 + 累计）
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        cumulative_input: u64,
        cumulative_output: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = ReactEvent::StepFailed {
            step: 2,
            kind: "import_denied".into(),
            message: "Import of os is not allowed.".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["kind"], "import_denied");
    }
}
