//! 认知层：代码提取、prompt 渲染、最终答案校验与代码 Agent 主循环

pub mod checks;
pub mod events;
pub mod loop_;
pub mod parse;
pub mod prompts;

pub use checks::{run_checks, FinalAnswerCheck, FnCheck, SharedCheck};
pub use events::ReactEvent;
pub use loop_::{AgentSettings, CodeAgent, StepOutcome, PYTHON_INTERPRETER};
pub use parse::{extract_code, fix_final_answer_code};
pub use prompts::{authorized_imports_text, capability_context, CapabilityContext, PromptEngine};
