//! CastleAgent：把战场快照与玩家请求交给代码 Agent
//!
//! 作用域注入 `battle_state`，system prompt 列出游戏内命令，任务 prompt 附上战场 JSON、命令描述与请求原文。

use std::sync::Arc;

use minijinja::context;
use tokio::sync::mpsc::UnboundedSender;

use crate::castle::commands::game_commands;
use crate::castle::game_objects::{battle_state, GameObject};
use crate::llm::LlmClient;
use crate::react::{
    authorized_imports_text, capability_context, AgentSettings, CodeAgent, PromptEngine, ReactEvent, SharedCheck,
};
use crate::sandbox::scope_from_json;
use crate::tools::CapabilityRegistry;

const CASTLE_AGENT_TEMPLATE: &str = include_str!("prompts/castle_agent.j2");
const BATTLE_COMMAND_TEMPLATE: &str = include_str!("prompts/battle_command.j2");

pub struct CastleAgent {
    agent: CodeAgent,
    commands: Arc<CapabilityRegistry>,
    prompts: PromptEngine,
    checks: Vec<SharedCheck>,
}

impl CastleAgent {
    pub fn new(llm: Arc<dyn LlmClient>, settings: AgentSettings) -> Result<Self, minijinja::Error> {
        let commands = Arc::new(game_commands());
        let mut prompts = PromptEngine::new()?;
        prompts.add_template("castle_agent", CASTLE_AGENT_TEMPLATE)?;
        prompts.add_template("battle_command", BATTLE_COMMAND_TEMPLATE)?;

        let agent = CodeAgent::new(llm, Arc::clone(&commands), settings)?;
        let system_prompt = prompts.render(
            "castle_agent",
            context! {
                in_game_commands => capability_context(&commands),
                authorized_imports => authorized_imports_text(agent.executor().authorized_imports()),
            },
        )?;
        Ok(Self {
            agent: agent.with_system_prompt(system_prompt),
            commands,
            prompts,
            checks: Vec::new(),
        })
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.agent = self.agent.with_event_tx(tx);
        self
    }

    /// 最终答案校验（如 commands_well_formed）
    pub fn with_checks(mut self, checks: Vec<SharedCheck>) -> Self {
        self.checks = checks;
        self
    }

    pub fn agent(&self) -> &CodeAgent {
        &self.agent
    }

    pub fn commands(&self) -> &CapabilityRegistry {
        &self.commands
    }

    /// 任务 prompt：战场状态（缩进 2 的 JSON）、命令描述、请求原文
    pub fn render_task(&self, state: &[serde_json::Value], user_request: &str) -> Result<String, minijinja::Error> {
        let battle_state = serde_json::to_string_pretty(state).unwrap_or_else(|_| "[]".to_string());
        let commands = serde_json::to_string_pretty(&self.commands.descriptors()).unwrap_or_default();
        self.prompts.render(
            "battle_command",
            context! {
                battle_state => battle_state,
                commands => commands,
                user_request => user_request,
            },
        )
    }

    /// 对当前战场执行一条玩家请求；返回命令记录列表，步数用尽时为 None
    pub async fn run_battle_command(
        &mut self,
        objects: &[GameObject],
        user_request: &str,
    ) -> Result<Option<serde_json::Value>, minijinja::Error> {
        let state = battle_state(objects);
        let mut bindings = serde_json::Map::new();
        bindings.insert("battle_state".into(), serde_json::Value::Array(state.clone()));
        self.agent.set_scope(scope_from_json(&bindings));

        let task = self.render_task(&state, user_request)?;
        tracing::info!(request = %user_request, objects = objects.len(), "running battle command");
        Ok(self.agent.run(&task, Vec::new(), None, &self.checks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castle::commands::CommandsWellFormed;
    use crate::castle::game_objects::decode_battlefield;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn objects() -> Vec<GameObject> {
        decode_battlefield(&[
            json!({"id": 1, "type": "structure", "position": {"x": 0, "y": 0}, "ally": true}),
            json!({"id": 2, "type": "structure", "position": {"x": 20, "y": 0}, "ally": false}),
            json!({"id": 3, "type": "unit", "position": {"x": 1, "y": 0}, "ally": true, "name": "Lancelot", "isRanged": false, "fighterType": "knight"}),
            json!({"id": 4, "type": "unit", "position": {"x": 1, "y": 1}, "ally": true, "name": "Robin", "isRanged": true, "fighterType": "archer"}),
        ])
        .unwrap()
    }

    #[test]
    fn test_task_prompt_frame() {
        let agent = CastleAgent::new(Arc::new(MockLlmClient::default()), AgentSettings::default()).unwrap();
        let task = agent
            .render_task(&[json!({"object_id": 1, "object_type": "structure"})], "All units attack {enemy} castle")
            .unwrap();
        assert!(task.starts_with(
            "This is the current battleground state:\nbattle_state = [\n  {\n    \"object_id\": 1,"
        ));
        assert!(task.contains("<commands>\n[\n  {\n    \"name\": \"move_in_direction\""));
        assert!(task.ends_with("Please provide the command(s) for my request:\nAll units attack {enemy} castle"));
    }

    #[test]
    fn test_system_prompt_lists_game_commands() {
        let agent = CastleAgent::new(Arc::new(MockLlmClient::default()), AgentSettings::default()).unwrap();
        let prompt = &agent.agent().memory().system_prompt;
        assert!(prompt.contains("- move_in_direction: all units in unit_ids will move x_delta tiles"));
        assert!(prompt.contains("- move_to_target: all units in unit_ids will move to the target object."));
    }

    #[tokio::test]
    async fn test_run_battle_command_returns_command_records() {
        let reply = "Thought: send allied units to the enemy castle.\nCode:\n```py\n\
            mine = [o[\"object_id\"] for o in battle_state if o[\"object_type\"] == \"unit\" and o[\"ally\"]]\n\
            target = [o[\"object_id\"] for o in battle_state if o[\"object_type\"] == \"structure\" and o[\"ally\"] == False][0]\n\
            final_answer([move_to_target(unit_ids=mine, target_id=target)])\n```<end_code>";
        let mock = Arc::new(MockLlmClient::new([reply]));
        let mut agent = CastleAgent::new(mock.clone(), AgentSettings::default())
            .unwrap()
            .with_checks(vec![Arc::new(CommandsWellFormed::default())]);
        let result = agent.run_battle_command(&objects(), "All units attack enemy castle").await.unwrap();
        assert_eq!(
            result,
            Some(json!([{"name": "move_to_target", "args": {"unit_ids": [3, 4], "target_id": 2}}]))
        );
        let first_request = &mock.requests()[0];
        assert!(first_request[1].content.starts_with("New task:\nThis is the current battleground state:"));
    }

    #[tokio::test]
    async fn test_malformed_commands_are_rejected_then_recovered() {
        let mock = Arc::new(MockLlmClient::new([
            "Code:\n```py\nfinal_answer({'name': 'charge'})\n```<end_code>",
            "Code:\n```py\nfinal_answer([move_in_direction([3], 0, 2.5)])\n```<end_code>",
        ]));
        let mut agent = CastleAgent::new(mock, AgentSettings::default())
            .unwrap()
            .with_checks(vec![Arc::new(CommandsWellFormed::default())]);
        let result = agent.run_battle_command(&objects(), "knight moves up").await.unwrap();
        assert_eq!(
            result,
            Some(json!([{"name": "move_in_direction", "args": {"unit_ids": [3], "x_delta": 0, "y_delta": 2.5}}]))
        );
        let first = agent.agent().memory().action_steps().next().unwrap();
        assert_eq!(first.error.as_ref().unwrap().error.kind(), "validation");
    }
}
