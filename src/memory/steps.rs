//! 步骤记忆：按执行顺序追加的 TaskStep / ActionStep 日志
//!
//! 渲染为消息序列是纯投影，不修改记忆；summary 模式省略 system prompt、模型原始输出与代码，
//! 观察结果只保留预览。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::StepError;
use crate::llm::TokenUsage;
use crate::memory::{Message, Role};
use crate::sandbox::truncate_content;

/// summary 模式下观察结果的保留长度
const SUMMARY_OBSERVATION_CHARS: usize = 500;

/// 执行代码的调用记录（name 固定为 python_interpreter，arguments 为代码文本）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub id: String,
}

/// 任务步骤：每次 run 恰好一个
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStep {
    pub task: String,
    pub task_images: Vec<String>,
}

impl TaskStep {
    pub fn new(task: impl Into<String>, task_images: Vec<String>) -> Self {
        Self {
            task: task.into(),
            task_images,
        }
    }

    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::user(format!("New task:\n{}", self.task)).with_images(self.task_images.clone())]
    }
}

/// 动作步骤：一次迭代的完整记录
#[derive(Debug, Clone)]
pub struct ActionStep {
    /// 从 1 开始
    pub step_number: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub model_input_messages: Vec<Message>,
    pub model_output: Option<String>,
    pub tool_call: Option<ToolCallRecord>,
    pub observations: Option<String>,
    pub observation_images: Vec<String>,
    pub action_output: Option<serde_json::Value>,
    pub error: Option<StepError>,
    pub token_usage: Option<TokenUsage>,
}

impl ActionStep {
    pub fn new(step_number: usize, observation_images: Vec<String>) -> Self {
        Self {
            step_number,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            model_input_messages: Vec::new(),
            model_output: None,
            tool_call: None,
            observations: None,
            observation_images,
            action_output: None,
            error: None,
            token_usage: None,
        }
    }

    /// 记录错误；带错误的步骤没有有效输出
    pub fn fail(&mut self, error: StepError) {
        self.action_output = None;
        self.error = Some(error);
    }

    /// 写入结束时间与耗时
    pub fn finish(&mut self) {
        let end = Utc::now();
        self.duration = Some((end - self.start_time).to_std().unwrap_or_default());
        self.end_time = Some(end);
    }

    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = Vec::new();
        if !summary_mode {
            if let Some(output) = &self.model_output {
                messages.push(Message::assistant(output.trim()));
            }
            if let Some(call) = &self.tool_call {
                let calls = serde_json::to_string(&[call]).unwrap_or_default();
                messages.push(Message::new(Role::ToolCall, format!("Calling tools:\n{}", calls)));
            }
        }
        if !self.observation_images.is_empty() {
            messages.push(Message::user("Here are the observed images:").with_images(self.observation_images.clone()));
        }
        if let Some(observations) = &self.observations {
            let body = if summary_mode {
                truncate_content(observations, SUMMARY_OBSERVATION_CHARS)
            } else {
                observations.clone()
            };
            messages.push(Message::new(Role::ToolResponse, format!("Observation:\n{}", body)));
        }
        if let Some(error) = &self.error {
            let mut content = match &self.tool_call {
                Some(call) => format!("Call id: {}\n", call.id),
                None => String::new(),
            };
            content.push_str(&error.render());
            messages.push(Message::new(Role::ToolResponse, content));
        }
        messages
    }
}

#[derive(Debug, Clone)]
pub enum MemoryStep {
    Task(TaskStep),
    Action(ActionStep),
}

impl MemoryStep {
    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        match self {
            MemoryStep::Task(step) => step.to_messages(),
            MemoryStep::Action(step) => step.to_messages(summary_mode),
        }
    }
}

/// Agent 记忆：system prompt + 只追加的步骤日志
#[derive(Debug, Clone)]
pub struct AgentMemory {
    pub system_prompt: String,
    steps: Vec<MemoryStep>,
}

impl AgentMemory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            steps: Vec::new(),
        }
    }

    pub fn append(&mut self, step: MemoryStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[MemoryStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn reset(&mut self) {
        self.steps.clear();
    }

    pub fn action_steps(&self) -> impl Iterator<Item = &ActionStep> {
        self.steps.iter().filter_map(|s| match s {
            MemoryStep::Action(a) => Some(a),
            MemoryStep::Task(_) => None,
        })
    }

    /// 扁平消息序列：system prompt（summary 模式省略）+ 各步骤消息
    pub fn to_message_sequence(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = Vec::new();
        if !summary_mode {
            messages.push(Message::system(self.system_prompt.clone()));
        }
        for step in &self.steps {
            messages.extend(step.to_messages(summary_mode));
        }
        messages
    }

    /// 人类可读的完整回放
    pub fn replay(&self) -> String {
        let mut out = String::from("Replaying the agent's steps:\n");
        for step in &self.steps {
            match step {
                MemoryStep::Task(task) => {
                    out.push_str(&format!("━━ New task ━━\n{}\n", task.task));
                }
                MemoryStep::Action(action) => {
                    out.push_str(&format!("━━ Step {} ━━\n", action.step_number));
                    if let Some(output) = &action.model_output {
                        out.push_str(&format!("Output message of the LLM:\n{}\n", output.trim()));
                    }
                    if let Some(call) = &action.tool_call {
                        let code = call.arguments.as_str().unwrap_or_default();
                        out.push_str(&format!("Executed code ({}):\n{}\n", call.id, code));
                    }
                    if let Some(obs) = &action.observations {
                        out.push_str(&format!("Observations:\n{}\n", obs.trim_end()));
                    }
                    if let Some(err) = &action.error {
                        out.push_str(&format!("Error: {}\n", err));
                    }
                    if let Some(d) = action.duration {
                        out.push_str(&format!("Duration: {:.2}s\n", d.as_secs_f64()));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentError, RecoveryEngine};

    fn action(n: usize) -> ActionStep {
        let mut step = ActionStep::new(n, Vec::new());
        step.model_output = Some("Thought: add\nCode:\n```py\nx = 1\n```".into());
        step.tool_call = Some(ToolCallRecord {
            name: "python_interpreter".into(),
            arguments: serde_json::Value::String("x = 1".into()),
            id: format!("call_{}", n),
        });
        step.observations = Some("Execution logs:\nLast output from code snippet:\nNone".into());
        step
    }

    #[test]
    fn test_message_sequence_order() {
        let mut memory = AgentMemory::new("system");
        memory.append(MemoryStep::Task(TaskStep::new("attack", Vec::new())));
        memory.append(MemoryStep::Action(action(1)));
        let messages = memory.to_message_sequence(false);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::ToolCall, Role::ToolResponse]
        );
        assert_eq!(messages[1].content, "New task:\nattack");
        assert!(messages[3].content.contains("\"name\":\"python_interpreter\""));
        assert!(messages[4].content.starts_with("Observation:\nExecution logs:"));
    }

    #[test]
    fn test_error_step_renders_call_id_and_hint() {
        let mut step = action(2);
        step.observations = None;
        step.fail(RecoveryEngine::new().handle(AgentError::Execution("boom".into())));
        let messages = step.to_messages(false);
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::ToolResponse);
        assert!(last.content.starts_with("Call id: call_2\nError:\nboom\nNow let's retry"));
        assert!(step.action_output.is_none());
    }

    #[test]
    fn test_summary_mode_omits_system_and_code() {
        let mut memory = AgentMemory::new("system");
        memory.append(MemoryStep::Task(TaskStep::new("attack", Vec::new())));
        let mut step = action(1);
        step.observations = Some("o".repeat(2000));
        memory.append(MemoryStep::Action(step));
        let messages = memory.to_message_sequence(true);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[1].content.contains("truncated"));
        // 纯投影：再次渲染结果一致
        assert_eq!(memory.to_message_sequence(true), messages);
    }

    #[test]
    fn test_finish_records_duration_and_replay() {
        let mut memory = AgentMemory::new("system");
        memory.append(MemoryStep::Task(TaskStep::new("attack", Vec::new())));
        let mut step = action(1);
        step.finish();
        assert!(step.end_time.is_some());
        assert!(step.duration.is_some());
        memory.append(MemoryStep::Action(step));
        let replay = memory.replay();
        assert!(replay.contains("━━ Step 1 ━━"));
        assert!(replay.contains("Executed code (call_1):\nx = 1"));
        assert_eq!(memory.action_steps().count(), 1);
    }
}
