//! 代码沙箱：在受限、持久的作用域中执行模型生成的代码
//!
//! 语言为 Python 子集（lexer -> parser -> interpreter）。名称解析仅限安全内置函数、
//! 授权导入与能力（游戏命令）；`final_answer(...)` 调用立即短路并标记为最终答案。
//! 每次执行输出结构化审计日志（JSON）。

mod ast;
mod builtins;
mod error;
mod interpreter;
mod lexer;
mod ops;
mod parser;
mod value;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use error::InterpreterError;
pub use value::{Dict, Value};

use interpreter::{Interpreter, Unwind};

use crate::tools::CapabilityRegistry;

/// 默认可导入模块（与调用方追加的授权导入合并）
pub const BASE_AUTHORIZED_IMPORTS: &[&str] = &["math", "statistics"];

/// print 输出默认上限（字符）
pub const DEFAULT_MAX_PRINT_OUTPUTS_LENGTH: usize = 50_000;

/// 单次执行默认操作数上限
pub const DEFAULT_MAX_OPERATIONS: usize = 10_000_000;

/// 执行线程的栈大小：深层嵌套的代码在此栈上递归求值
const EXECUTION_STACK_SIZE: usize = 256 * 1024 * 1024;

/// 输出截断默认上限（字符）
pub const MAX_LENGTH_TRUNCATE_CONTENT: usize = 20_000;

/// 持久作用域：变量名 -> 值，由编排层持有，跨步骤不重置
pub type Scope = HashMap<String, Value>;

/// 由 JSON 绑定构造作用域（如 `{"battle_state": [...]}`）
pub fn scope_from_json(bindings: &serde_json::Map<String, serde_json::Value>) -> Scope {
    bindings
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect()
}

/// 一次成功执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub output: Value,
    pub logs: String,
    pub is_final_answer: bool,
}

/// 执行失败：错误 + 失败前已捕获的 print 输出
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFault {
    pub error: InterpreterError,
    pub logs: String,
}

/// 本地解释执行器
#[derive(Clone)]
pub struct LocalExecutor {
    capabilities: Arc<CapabilityRegistry>,
    authorized_imports: Vec<String>,
    max_print_outputs_length: usize,
    max_operations: usize,
    time_limit: Option<Duration>,
}

impl LocalExecutor {
    /// `additional_imports` 追加到基础授权列表之后（去重）
    pub fn new(capabilities: Arc<CapabilityRegistry>, additional_imports: &[String]) -> Self {
        let mut authorized_imports: Vec<String> =
            BASE_AUTHORIZED_IMPORTS.iter().map(|s| s.to_string()).collect();
        for module in additional_imports {
            if !authorized_imports.contains(module) {
                authorized_imports.push(module.clone());
            }
        }
        Self {
            capabilities,
            authorized_imports,
            max_print_outputs_length: DEFAULT_MAX_PRINT_OUTPUTS_LENGTH,
            max_operations: DEFAULT_MAX_OPERATIONS,
            time_limit: None,
        }
    }

    pub fn with_max_print_outputs_length(mut self, max: usize) -> Self {
        self.max_print_outputs_length = max;
        self
    }

    pub fn with_max_operations(mut self, max: usize) -> Self {
        self.max_operations = max;
        self
    }

    /// 单次执行的墙钟上限，超时按资源上限错误处理
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn authorized_imports(&self) -> &[String] {
        &self.authorized_imports
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// 执行代码；作用域原地读写，失败前的写入同样保留
    pub fn execute(&self, code: &str, scope: &mut Scope) -> Result<ExecutionOutput, ExecutionFault> {
        let start = Instant::now();
        let result = self.run(code, scope);

        let outcome = match &result {
            Ok(out) if out.is_final_answer => "final_answer",
            Ok(_) => "ok",
            Err(fault) if fault.error.is_import_denied() => "import_denied",
            Err(ExecutionFault {
                error: InterpreterError::Syntax { .. },
                ..
            }) => "syntax_error",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "code_audit",
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "code_preview": code_preview(code),
        });
        tracing::info!(audit = %audit.to_string(), "sandbox");
        result
    }

    /// 在独立的大栈线程上执行，调用方线程的栈深度不受代码嵌套影响
    fn run(&self, code: &str, scope: &mut Scope) -> Result<ExecutionOutput, ExecutionFault> {
        let thread_fault = |message: String| ExecutionFault {
            error: InterpreterError::Runtime { line: 0, message },
            logs: String::new(),
        };
        std::thread::scope(|s| {
            let worker = std::thread::Builder::new()
                .name("castle-sandbox".to_string())
                .stack_size(EXECUTION_STACK_SIZE)
                .spawn_scoped(s, move || self.run_inline(code, scope));
            match worker {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    tracing::error!("sandbox thread panicked");
                    Err(thread_fault("sandbox execution aborted".to_string()))
                }),
                Err(e) => Err(thread_fault(format!("failed to start sandbox thread: {}", e))),
            }
        })
    }

    fn run_inline(&self, code: &str, scope: &mut Scope) -> Result<ExecutionOutput, ExecutionFault> {
        let body = parser::parse(code).map_err(|error| ExecutionFault {
            error,
            logs: String::new(),
        })?;
        let mut interp = Interpreter::new(
            scope,
            &self.capabilities,
            &self.authorized_imports,
            self.max_print_outputs_length,
            self.max_operations,
        );
        if let Some(limit) = self.time_limit {
            interp = interp.with_time_limit(limit);
        }
        let result = interp.run_module(&body);
        let line = interp.current_line();
        let logs = interp.print.into_logs();
        match result {
            Ok(output) => Ok(ExecutionOutput {
                output,
                logs,
                is_final_answer: false,
            }),
            Err(Unwind::Final(output)) => Ok(ExecutionOutput {
                output,
                logs,
                is_final_answer: true,
            }),
            Err(Unwind::Raise(exc)) => Err(ExecutionFault {
                error: InterpreterError::Runtime {
                    line: exc.line.unwrap_or(line),
                    message: exc.render(),
                },
                logs,
            }),
            Err(Unwind::Fatal(InterpreterError::Runtime { line: 0, message })) => Err(ExecutionFault {
                error: InterpreterError::Runtime { line, message },
                logs,
            }),
            Err(Unwind::Fatal(error)) => Err(ExecutionFault { error, logs }),
        }
    }
}

fn code_preview(code: &str) -> String {
    if code.chars().count() > 200 {
        format!("{}...", code.chars().take(200).collect::<String>())
    } else {
        code.to_string()
    }
}

/// 超长内容保留首尾各一半，中间替换为截断标记
pub fn truncate_content(content: &str, max_length: usize) -> String {
    let total = content.chars().count();
    if total <= max_length {
        return content.to_string();
    }
    let half = max_length / 2;
    let head: String = content.chars().take(half).collect();
    let tail: String = content.chars().skip(total - half).collect();
    format!(
        "{}\n..._This content has been truncated to stay below {} characters_...\n{}",
        head, max_length, tail
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ArgSpec, CommandCapability};

    fn executor() -> LocalExecutor {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CommandCapability::new("move_to_target", "Move units towards a target")
                .arg(ArgSpec::required("unit_ids", "ids of units"))
                .arg(ArgSpec::required("target_id", "id of the target")),
        );
        LocalExecutor::new(Arc::new(registry), &[])
    }

    #[test]
    fn test_scope_persists_and_final_answer() {
        let exec = executor();
        let mut scope = Scope::new();
        scope.insert("x".into(), Value::Int(5));
        let out = exec.execute("x = x + 1", &mut scope).unwrap();
        assert!(!out.is_final_answer);
        assert_eq!(scope.get("x"), Some(&Value::Int(6)));
        let out = exec.execute("final_answer(x)", &mut scope).unwrap();
        assert!(out.is_final_answer);
        assert_eq!(out.output, Value::Int(6));
    }

    #[test]
    fn test_capability_returns_command_record() {
        let exec = executor();
        let mut scope = Scope::new();
        let out = exec
            .execute("cmds = [move_to_target([1, 2], target_id=9)]\nfinal_answer(cmds)", &mut scope)
            .unwrap();
        assert_eq!(
            out.output.to_json(),
            serde_json::json!([{"name": "move_to_target", "args": {"unit_ids": [1, 2], "target_id": 9}}])
        );
    }

    #[test]
    fn test_capability_name_cannot_be_overwritten() {
        let exec = executor();
        let mut scope = Scope::new();
        let fault = exec.execute("move_to_target = 1", &mut scope).unwrap_err();
        assert!(fault.error.to_string().contains("would erase the existing tool"));
    }

    #[test]
    fn test_import_denied_is_distinguishable() {
        let exec = executor();
        let mut scope = Scope::new();
        let fault = exec.execute("print('hi')\nimport os", &mut scope).unwrap_err();
        assert!(fault.error.is_import_denied());
        assert_eq!(fault.logs, "hi\n");
        assert!(fault.error.to_string().contains("'math'"));
    }

    #[test]
    fn test_additional_imports_extend_base_list() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CommandCapability::new("noop", "Nothing"));
        let exec = LocalExecutor::new(Arc::new(registry), &["random".to_string(), "math".to_string()]);
        assert_eq!(exec.authorized_imports(), &["math", "statistics", "random"]);
    }

    #[test]
    fn test_runtime_error_reports_line_and_message() {
        let exec = executor();
        let mut scope = Scope::new();
        let fault = exec.execute("a = 1\nb = [1][3]", &mut scope).unwrap_err();
        assert_eq!(
            fault.error,
            InterpreterError::Runtime {
                line: 2,
                message: "IndexError: list index out of range".into()
            }
        );
        assert_eq!(scope.get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_syntax_error() {
        let exec = executor();
        let fault = exec.execute("x = (1,", &mut Scope::new()).unwrap_err();
        assert!(matches!(fault.error, InterpreterError::Syntax { .. }));
    }

    #[test]
    fn test_dunder_error_gets_current_line() {
        let exec = executor();
        let fault = exec.execute("x = 1\ny = x.__dict__", &mut Scope::new()).unwrap_err();
        assert!(matches!(fault.error, InterpreterError::Runtime { line: 2, .. }));
    }

    #[test]
    fn test_deeply_nested_code_fails_cleanly() {
        let exec = executor();
        let mut scope = Scope::new();
        for code in [
            format!("x = {}0{}", "[".repeat(200), "]".repeat(200)),
            format!("x = {}1{}", "(".repeat(200), ")".repeat(200)),
            format!("x = {}1", "- ".repeat(200)),
        ] {
            let fault = exec.execute(&code, &mut scope).unwrap_err();
            assert!(matches!(fault.error, InterpreterError::Syntax { .. }), "{:?}", fault.error);
        }
        let out = exec
            .execute(&format!("1{}", " + 1".repeat(200)), &mut scope)
            .unwrap();
        assert_eq!(out.output, Value::Int(201));
    }

    #[test]
    fn test_deep_recursion_through_functions_is_a_runtime_error() {
        let exec = executor();
        let code = format!(
            "def f(n):\n    return {}f(n - 1){} if n else 0\nf(60)",
            "[".repeat(20),
            "]".repeat(20)
        );
        let fault = exec.execute(&code, &mut Scope::new()).unwrap_err();
        assert!(
            fault.error.to_string().contains("RecursionError"),
            "{}",
            fault.error
        );
    }

    #[test]
    fn test_large_allocations_count_against_the_budget() {
        let exec = executor().with_max_operations(200);
        let mut scope = Scope::new();
        for code in [
            "a = [[0] * 10000000 for i in range(3)]",
            "b = list(range(1000))",
            "c = 'ab' * 5000",
            "d = sorted([1] * 150 + [2] * 150)",
        ] {
            let fault = exec.execute(code, &mut scope).unwrap_err();
            assert!(matches!(fault.error, InterpreterError::Limit(_)), "{}: {:?}", code, fault.error);
        }
        assert!(exec.execute("e = [0] * 50", &mut scope).is_ok());
    }

    #[test]
    fn test_time_limit_stops_long_runs() {
        let exec = executor()
            .with_max_operations(usize::MAX)
            .with_time_limit(Duration::from_millis(50));
        let fault = exec.execute("while True:\n    pass", &mut Scope::new()).unwrap_err();
        match fault.error {
            InterpreterError::Limit(message) => assert!(message.contains("time limit")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scope_from_json() {
        let bindings = serde_json::json!({"battle_state": [{"object_id": 1}]});
        let scope = scope_from_json(bindings.as_object().unwrap());
        let exec = executor();
        let mut scope = scope;
        let out = exec.execute("battle_state[0]['object_id']", &mut scope).unwrap();
        assert_eq!(out.output, Value::Int(1));
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        let long = "a".repeat(10) + &"b".repeat(10);
        let out = truncate_content(&long, 10);
        assert!(out.starts_with("aaaaa\n..._This content has been truncated to stay below 10 characters_...\n"));
        assert!(out.ends_with("bbbbb"));
    }
}
