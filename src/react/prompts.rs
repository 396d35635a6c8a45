//! Prompt 渲染（minijinja）
//!
//! 模板内嵌在二进制中，变量按名传入；变量值中的 `{...}` 不会被再次解释。

use minijinja::{context, Environment};
use serde::Serialize;

use crate::tools::CapabilityRegistry;

const CODE_AGENT_TEMPLATE: &str = include_str!("prompts/code_agent.j2");

/// 模板中单个能力的展示字段
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityContext {
    pub name: String,
    pub description: String,
    /// 参数描述 `{arg: {description, required}}` 的紧凑 JSON
    pub args_json: String,
}

/// 按注册顺序生成模板上下文
pub fn capability_context(registry: &CapabilityRegistry) -> Vec<CapabilityContext> {
    registry
        .iter()
        .map(|c| {
            let descriptor = c.descriptor();
            CapabilityContext {
                name: c.name().to_string(),
                description: c.description().to_string(),
                args_json: descriptor["args"].to_string(),
            }
        })
        .collect()
}

/// 授权模块列表的展示形式：`['math', 'statistics']`
pub fn authorized_imports_text(imports: &[String]) -> String {
    let quoted: Vec<String> = imports.iter().map(|m| format!("'{}'", m)).collect();
    format!("[{}]", quoted.join(", "))
}

/// minijinja 环境包装
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    /// 注册内置的 code_agent 模板
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template("code_agent", CODE_AGENT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn add_template(&mut self, name: &'static str, source: &'static str) -> Result<(), minijinja::Error> {
        self.env.add_template(name, source)
    }

    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(ctx)
    }

    /// 通用代码 Agent 的 system prompt
    pub fn render_system_prompt(
        &self,
        capabilities: &CapabilityRegistry,
        authorized_imports: &[String],
    ) -> Result<String, minijinja::Error> {
        self.render(
            "code_agent",
            context! {
                tools => capability_context(capabilities),
                authorized_imports => authorized_imports_text(authorized_imports),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ArgSpec, CommandCapability};

    #[test]
    fn test_system_prompt_lists_tools_and_imports() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CommandCapability::new("move_to_target", "all units in unit_ids will move to the target object.")
                .arg(ArgSpec::required("unit_ids", "ids"))
                .arg(ArgSpec::required("target_id", "target")),
        );
        let engine = PromptEngine::new().unwrap();
        let prompt = engine
            .render_system_prompt(&registry, &["math".to_string(), "statistics".to_string()])
            .unwrap();
        assert!(prompt.contains("- move_to_target: all units in unit_ids will move to the target object."));
        assert!(prompt.contains(r#"{"unit_ids":{"description":"ids","required":true}"#));
        assert!(prompt.contains("only from the following list of modules: ['math', 'statistics']"));
    }

    #[test]
    fn test_system_prompt_without_tools() {
        let engine = PromptEngine::new().unwrap();
        let prompt = engine.render_system_prompt(&CapabilityRegistry::new(), &[]).unwrap();
        assert!(!prompt.contains("you only have access to these tools"));
        assert!(prompt.contains("- final_answer:"));
        assert!(prompt.contains("list of modules: []"));
    }

    #[test]
    fn test_braces_in_values_are_not_reinterpreted() {
        let mut engine = PromptEngine::new().unwrap();
        engine.add_template("echo", "value = {{ value }}").unwrap();
        let out = engine.render("echo", context! { value => "{user-request} {{ x }}" }).unwrap();
        assert_eq!(out, "value = {user-request} {{ x }}");
    }
}
