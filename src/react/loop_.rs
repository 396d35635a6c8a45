//! 代码 Agent 主循环
//!
//! 每一步：渲染记忆 -> 调用模型 -> 提取代码 -> 沙箱执行（持久作用域）-> 记录 ActionStep。
//! 所有错误都是步骤内的，写入 ActionStep 后由下一步的 prompt 带给模型；步数用尽返回 None。
//! 步数上限 max_steps 时最多执行 max_steps - 1 个动作步骤。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{GenerateOptions, LlmClient, LlmError};
use crate::memory::{ActionStep, AgentMemory, MemoryStep, TaskStep, ToolCallRecord};
use crate::react::checks::{run_checks, SharedCheck};
use crate::react::parse::{extract_code, fix_final_answer_code};
use crate::react::prompts::PromptEngine;
use crate::react::ReactEvent;
use crate::sandbox::{
    truncate_content, ExecutionFault, ExecutionOutput, InterpreterError, LocalExecutor, Scope,
    MAX_LENGTH_TRUNCATE_CONTENT,
};
use crate::tools::CapabilityRegistry;

/// 代码执行在记忆中登记的工具名
pub const PYTHON_INTERPRETER: &str = "python_interpreter";

/// Agent 运行参数（通常来自 [agent] 与 [llm] 配置段）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub stop_sequences: Vec<String>,
    pub max_new_tokens: u32,
    /// 单次模型调用超时
    pub request_timeout: Duration,
    pub max_print_outputs_length: usize,
    pub max_operations: usize,
    /// 单次沙箱执行的墙钟上限
    pub execution_timeout: Duration,
    /// 追加的授权导入
    pub authorized_imports: Vec<String>,
    /// 为 true 时模型输出按 info 级别记录
    pub verbose: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl AgentSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_steps: cfg.agent.max_steps,
            stop_sequences: cfg.agent.stop_sequences.clone(),
            max_new_tokens: cfg.llm.max_new_tokens,
            request_timeout: Duration::from_secs(cfg.llm.timeouts.request),
            max_print_outputs_length: cfg.agent.max_print_outputs_length,
            max_operations: cfg.agent.max_operations,
            execution_timeout: Duration::from_secs(cfg.agent.execution_timeout),
            authorized_imports: cfg.agent.authorized_imports.clone(),
            verbose: cfg.agent.verbose,
        }
    }
}

/// 单步结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 没有最终答案，继续下一步
    Continuing,
    /// 得到最终答案（尚未校验）
    Final(serde_json::Value),
    /// 步骤失败，错误写入 ActionStep
    Failed(AgentError),
}

fn send_event(tx: &Option<UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 代码 Agent：持有模型、沙箱执行器、记忆与持久作用域
pub struct CodeAgent {
    llm: Arc<dyn LlmClient>,
    executor: LocalExecutor,
    recovery: RecoveryEngine,
    memory: AgentMemory,
    scope: Scope,
    settings: AgentSettings,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl CodeAgent {
    /// system prompt 由内置 code_agent 模板按能力列表与授权导入渲染
    pub fn new(
        llm: Arc<dyn LlmClient>,
        capabilities: Arc<CapabilityRegistry>,
        settings: AgentSettings,
    ) -> Result<Self, minijinja::Error> {
        let executor = LocalExecutor::new(Arc::clone(&capabilities), &settings.authorized_imports)
            .with_max_print_outputs_length(settings.max_print_outputs_length)
            .with_max_operations(settings.max_operations)
            .with_time_limit(settings.execution_timeout);
        let system_prompt =
            PromptEngine::new()?.render_system_prompt(&capabilities, executor.authorized_imports())?;
        Ok(Self {
            llm,
            executor,
            recovery: RecoveryEngine::new(),
            memory: AgentMemory::new(system_prompt),
            scope: Scope::new(),
            settings,
            event_tx: None,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.memory.system_prompt = system_prompt.into();
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// 替换作用域（下一次 run 之前调用）
    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    pub fn executor(&self) -> &LocalExecutor {
        &self.executor
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 运行任务直到得到（通过校验的）最终答案，或步数用尽返回 None
    pub async fn run(
        &mut self,
        task: &str,
        images: Vec<String>,
        max_steps: Option<usize>,
        checks: &[SharedCheck],
    ) -> Option<serde_json::Value> {
        let max_steps = max_steps.unwrap_or(self.settings.max_steps);
        let span = tracing::info_span!("agent_run", model = %self.llm.model_id(), max_steps);
        self.run_steps(task, images, max_steps, checks).instrument(span).await
    }

    async fn run_steps(
        &mut self,
        task: &str,
        images: Vec<String>,
        max_steps: usize,
        checks: &[SharedCheck],
    ) -> Option<serde_json::Value> {
        self.memory
            .append(MemoryStep::Task(TaskStep::new(task, images.clone())));

        let mut final_answer = None;
        let mut step_number = 1;
        while final_answer.is_none() && step_number < max_steps {
            let mut action = ActionStep::new(step_number, images.clone());
            send_event(&self.event_tx, ReactEvent::StepStarted { step: step_number, max_steps });
            tracing::info!("Step {}", step_number);

            let outcome = self
                .step(&mut action)
                .instrument(tracing::info_span!("step", step = step_number))
                .await;
            match outcome {
                StepOutcome::Final(answer) => match run_checks(checks, &answer, &self.memory) {
                    Ok(()) => {
                        send_event(
                            &self.event_tx,
                            ReactEvent::FinalAnswer {
                                step: step_number,
                                answer: answer.clone(),
                            },
                        );
                        final_answer = Some(answer);
                    }
                    Err((check, reason)) => {
                        self.record_failure(&mut action, AgentError::ValidationFailure { check, reason });
                    }
                },
                StepOutcome::Failed(err) => self.record_failure(&mut action, err),
                StepOutcome::Continuing => {}
            }

            action.finish();
            self.memory.append(MemoryStep::Action(action));
            step_number += 1;
        }

        if final_answer.is_none() {
            let steps = max_steps.saturating_sub(1);
            tracing::warn!("No answer after {} steps", steps);
            send_event(&self.event_tx, ReactEvent::NoAnswer { steps });
        }
        final_answer
    }

    /// 沙箱执行在阻塞线程池上进行；作用域移入后随结果一起取回
    async fn execute_code(&mut self, code: String) -> Result<ExecutionOutput, ExecutionFault> {
        let executor = self.executor.clone();
        let mut scope = std::mem::take(&mut self.scope);
        let task = tokio::task::spawn_blocking(move || {
            let result = executor.execute(&code, &mut scope);
            (scope, result)
        });
        match task.await {
            Ok((scope, result)) => {
                self.scope = scope;
                result
            }
            Err(e) => {
                tracing::error!("sandbox task failed: {}", e);
                Err(ExecutionFault {
                    error: InterpreterError::Runtime {
                        line: 0,
                        message: format!("sandbox task failed: {}", e),
                    },
                    logs: String::new(),
                })
            }
        }
    }

    fn record_failure(&self, action: &mut ActionStep, err: AgentError) {
        tracing::warn!(step = action.step_number, kind = err.kind(), "{}", err);
        send_event(
            &self.event_tx,
            ReactEvent::StepFailed {
                step: action.step_number,
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        );
        action.fail(self.recovery.handle(err));
    }

    /// 执行一步；写入 action 的输入、输出、工具调用与观察，错误由调用方记录
    pub async fn step(&mut self, action: &mut ActionStep) -> StepOutcome {
        let step = action.step_number;
        let messages = self.memory.to_message_sequence(false);
        action.model_input_messages = messages.clone();

        let options = GenerateOptions {
            stop_sequences: self.settings.stop_sequences.clone(),
            max_new_tokens: self.settings.max_new_tokens,
        };
        let timeout = self.settings.request_timeout;
        let response = match tokio::time::timeout(timeout, self.llm.generate(&messages, &options, None)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return StepOutcome::Failed(AgentError::Generation(e.to_string())),
            Err(_) => {
                let e = LlmError::Timeout(timeout.as_secs());
                return StepOutcome::Failed(AgentError::Generation(e.to_string()));
            }
        };

        action.token_usage = Some(response.token_usage);
        action.model_output = Some(response.content.clone());
        if self.settings.verbose {
            tracing::info!("LLM output message:\n{}", response.content);
        } else {
            tracing::debug!("LLM output message:\n{}", response.content);
        }
        send_event(
            &self.event_tx,
            ReactEvent::ModelOutput {
                step,
                text: response.content.clone(),
            },
        );
        let cumulative = self.llm.total_usage();
        send_event(
            &self.event_tx,
            ReactEvent::TokenUsage {
                input_tokens: response.token_usage.input_tokens,
                output_tokens: response.token_usage.output_tokens,
                cumulative_input: cumulative.input_tokens,
                cumulative_output: cumulative.output_tokens,
            },
        );

        let code = match extract_code(&response.content) {
            Ok(code) => fix_final_answer_code(&code),
            Err(e) => return StepOutcome::Failed(e),
        };
        action.tool_call = Some(ToolCallRecord {
            name: PYTHON_INTERPRETER.to_string(),
            arguments: serde_json::Value::String(code.clone()),
            id: format!("call_{}", self.memory.len()),
        });
        tracing::info!("Executing parsed code:\n{}", code);
        send_event(&self.event_tx, ReactEvent::CodeParsed { step, code: code.clone() });

        match self.execute_code(code).await {
            Ok(out) => {
                let truncated = truncate_content(&out.output.to_string(), MAX_LENGTH_TRUNCATE_CONTENT);
                let observation = format!(
                    "Execution logs:\n{}Last output from code snippet:\n{}",
                    out.logs, truncated
                );
                tracing::info!(
                    "{}: {}",
                    if out.is_final_answer { "Out - Final answer" } else { "Out" },
                    truncated
                );
                send_event(
                    &self.event_tx,
                    ReactEvent::Observation {
                        step,
                        text: observation.clone(),
                        is_final_answer: out.is_final_answer,
                    },
                );
                action.observations = Some(observation);
                let output = out.output.to_json();
                action.action_output = Some(output.clone());
                // final_answer(None) 视为没有答案
                if out.is_final_answer && !output.is_null() {
                    StepOutcome::Final(output)
                } else {
                    StepOutcome::Continuing
                }
            }
            Err(fault) => {
                if !fault.logs.is_empty() {
                    tracing::info!("Execution logs:\n{}", fault.logs);
                    action.observations = Some(format!("Execution logs:\n{}", fault.logs));
                }
                if fault.error.is_import_denied() {
                    tracing::warn!(
                        "Code execution failed due to an unauthorized import. Consider adding it to agent.authorized_imports in the configuration."
                    );
                }
                StepOutcome::Failed(AgentError::from(fault.error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RETRY_HINT;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;
    use crate::react::checks::FnCheck;
    use crate::sandbox::Value;

    fn code_reply(code: &str) -> String {
        format!("Thought: ok\nCode:\n```py\n{}\n```<end_code>", code)
    }

    fn agent(mock: Arc<MockLlmClient>) -> CodeAgent {
        CodeAgent::new(mock, Arc::new(CapabilityRegistry::new()), AgentSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_seeded_scope_and_final_answer() {
        let mock = Arc::new(MockLlmClient::new([code_reply("x = x + 1\nfinal_answer(x)")]));
        let mut scope = Scope::new();
        scope.insert("x".into(), Value::Int(5));
        let mut agent = agent(Arc::clone(&mock)).with_scope(scope);
        let answer = agent.run("increment x", Vec::new(), None, &[]).await;
        assert_eq!(answer, Some(serde_json::json!(6)));
        assert_eq!(agent.memory().len(), 2);
        let step = agent.memory().action_steps().next().unwrap();
        assert_eq!(step.action_output, Some(serde_json::json!(6)));
        assert_eq!(
            step.observations.as_deref(),
            Some("Execution logs:\nLast output from code snippet:\n6")
        );
        let call = step.tool_call.as_ref().unwrap();
        assert_eq!(call.name, PYTHON_INTERPRETER);
        assert_eq!(call.id, "call_1");
        assert!(step.duration.is_some());
    }

    #[tokio::test]
    async fn test_scope_persists_between_steps() {
        let mock = Arc::new(MockLlmClient::new([
            code_reply("total = 40\nprint('stored')"),
            code_reply("final_answer(total + 2)"),
        ]));
        let mut agent = agent(Arc::clone(&mock));
        let answer = agent.run("compute", Vec::new(), None, &[]).await;
        assert_eq!(answer, Some(serde_json::json!(42)));
        // 第二次请求中带有第一步的观察
        let second = &mock.requests()[1];
        assert!(second
            .iter()
            .any(|m| m.role == Role::ToolResponse && m.content.starts_with("Observation:\nExecution logs:\nstored\n")));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_none_after_max_steps_minus_one() {
        let mock = Arc::new(MockLlmClient::default().with_fallback(code_reply("print('thinking')")));
        let mut agent = agent(Arc::clone(&mock));
        let answer = agent.run("never finishes", Vec::new(), Some(6), &[]).await;
        assert_eq!(answer, None);
        assert_eq!(agent.memory().len(), 6);
        assert_eq!(agent.memory().action_steps().count(), 5);
        assert_eq!(mock.call_count(), 5);
    }

    #[tokio::test]
    async fn test_import_denied_is_recorded_with_hint() {
        let mock = Arc::new(MockLlmClient::new([
            code_reply("import os\nfinal_answer(os.getcwd())"),
            code_reply("final_answer('recovered')"),
        ]));
        let mut agent = agent(Arc::clone(&mock));
        let answer = agent.run("where am i", Vec::new(), None, &[]).await;
        assert_eq!(answer, Some(serde_json::json!("recovered")));
        let first = agent.memory().action_steps().next().unwrap();
        let err = first.error.as_ref().unwrap();
        assert_eq!(err.error.kind(), "import_denied");
        assert!(err.hint.contains("Do not import that module again"));
        assert!(first.action_output.is_none());
        // 错误出现在下一轮 prompt 中
        let second = &mock.requests()[1];
        let last = second.last().unwrap();
        assert!(last.content.starts_with("Call id: call_1\nError:\nImport of os is not allowed."));
    }

    #[tokio::test]
    async fn test_execution_time_limit_is_step_local() {
        let mock = Arc::new(MockLlmClient::new([
            code_reply("kept = 7\nwhile True:\n    pass"),
            code_reply("final_answer(kept)"),
        ]));
        let settings = AgentSettings {
            max_operations: usize::MAX,
            execution_timeout: Duration::from_millis(50),
            ..AgentSettings::default()
        };
        let mut agent = CodeAgent::new(mock, Arc::new(CapabilityRegistry::new()), settings).unwrap();
        let answer = agent.run("spin", Vec::new(), None, &[]).await;
        // 超时前写入的变量保留在作用域中
        assert_eq!(answer, Some(serde_json::json!(7)));
        let first = agent.memory().action_steps().next().unwrap();
        let err = first.error.as_ref().unwrap();
        assert!(err.error.to_string().contains("time limit"), "{}", err.error);
    }

    #[tokio::test]
    async fn test_generation_and_parsing_errors_are_step_local() {
        let mock = Arc::new(MockLlmClient::from_script(vec![
            Err(LlmError::Request("connection refused".into())),
            Ok("I would move the knights.".to_string()),
            Ok(code_reply("final_answer([])")),
        ]));
        let mut agent = agent(Arc::clone(&mock));
        let answer = agent.run("attack", Vec::new(), None, &[]).await;
        assert_eq!(answer, Some(serde_json::json!([])));
        let kinds: Vec<&str> = agent
            .memory()
            .action_steps()
            .map(|s| s.error.as_ref().map(|e| e.error.kind()).unwrap_or("none"))
            .collect();
        assert_eq!(kinds, vec!["generation", "parsing", "none"]);
        let generation = agent.memory().action_steps().next().unwrap();
        assert!(generation.model_output.is_none());
        assert!(generation.tool_call.is_none());
    }

    #[tokio::test]
    async fn test_failed_check_discards_answer() {
        let mock = Arc::new(MockLlmClient::new([
            code_reply("final_answer('bad')"),
            code_reply("final_answer('good')"),
        ]));
        let checks: Vec<SharedCheck> = vec![Arc::new(FnCheck::new("is_good", |answer, _| {
            Ok(answer == &serde_json::json!("good"))
        }))];
        let mut agent = agent(Arc::clone(&mock));
        let answer = agent.run("answer well", Vec::new(), None, &checks).await;
        assert_eq!(answer, Some(serde_json::json!("good")));
        let first = agent.memory().action_steps().next().unwrap();
        let err = first.error.as_ref().unwrap();
        assert_eq!(err.error.to_string(), "Check is_good failed with error: check returned false");
        assert!(first.action_output.is_none());
        assert!(err.hint.ends_with(RETRY_HINT));
    }

    #[tokio::test]
    async fn test_final_answer_none_keeps_looping() {
        let mock = Arc::new(MockLlmClient::new([
            code_reply("final_answer(None)"),
            code_reply("final_answer(1)"),
        ]));
        let mut agent = agent(Arc::clone(&mock));
        assert_eq!(agent.run("t", Vec::new(), None, &[]).await, Some(serde_json::json!(1)));
        assert_eq!(agent.memory().action_steps().count(), 2);
    }

    #[tokio::test]
    async fn test_final_answer_is_executed_once() {
        let mock = Arc::new(MockLlmClient::new([code_reply(
            "print('before')\nfinal_answer('done')\nprint('after')",
        )]));
        let mut agent = agent(Arc::clone(&mock));
        assert_eq!(agent.run("t", Vec::new(), None, &[]).await, Some(serde_json::json!("done")));
        let step = agent.memory().action_steps().next().unwrap();
        let obs = step.observations.as_deref().unwrap();
        assert!(obs.contains("before"));
        assert!(!obs.contains("after"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_events_are_streamed() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mock = Arc::new(MockLlmClient::new([code_reply("final_answer(3)")]));
        let mut agent = agent(Arc::clone(&mock)).with_event_tx(tx);
        agent.run("t", Vec::new(), None, &[]).await;
        let mut types = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            types.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            types,
            vec!["step_started", "model_output", "token_usage", "code_parsed", "observation", "final_answer"]
        );
    }
}
