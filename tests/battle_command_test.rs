//! 端到端：战场快照 + 指令 -> 代码 Agent -> 命令列表

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use castle::config::AppConfig;
use castle::llm::MockLlmClient;
use castle::react::ReactEvent;
use castle::AgentRuntime;

fn battlefield() -> Vec<Value> {
    vec![
        json!({"id": "c1", "type": "structure", "position": {"x": 0, "y": 0}, "ally": true}),
        json!({"id": "c2", "type": "structure", "position": {"x": 30, "y": 0}, "ally": false}),
        json!({"id": "u1", "type": "unit", "position": {"x": 2, "y": 0}, "ally": true, "name": "Gawain", "isRanged": false, "fighterType": "knight"}),
        json!({"id": "u2", "type": "unit", "position": {"x": 28, "y": 0}, "ally": false, "name": "Mordred", "isRanged": false, "fighterType": "knight"}),
    ]
}

#[tokio::test]
async fn test_recovers_from_sandbox_error() {
    let mock = Arc::new(MockLlmClient::new([
        "Thought: pick my knights.\nCode:\n```py\nknights = [o['object_id'] for o in battlefield]\n```<end_code>",
        "Thought: the state is called battle_state.\nCode:\n```py\nknights = [o['object_id'] for o in battle_state if o['object_type'] == 'unit' and o['ally']]\nprint(knights)\n```<end_code>",
        "Code:\n```py\nfinal_answer([move_in_direction(unit_ids=knights, x_delta=5, y_delta=0)])\n```<end_code>",
    ]));
    let runtime = AgentRuntime::with_client(AppConfig::default(), mock.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = runtime
        .process_command(&battlefield(), "Move my knight 5 tiles right", Some(tx))
        .await
        .unwrap();
    assert_eq!(
        result,
        Some(json!([{"name": "move_in_direction", "args": {"unit_ids": ["u1"], "x_delta": 5, "y_delta": 0}}]))
    );
    assert_eq!(mock.call_count(), 3);

    let second_request = &mock.requests()[1];
    assert!(second_request.iter().any(|m| m.content.contains("Error:\n")));
    let third_request = &mock.requests()[2];
    assert!(third_request.iter().any(|m| m.content.contains("['u1']")));

    let mut failed_kinds = Vec::new();
    let mut final_step = None;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            ReactEvent::StepFailed { kind, .. } => failed_kinds.push(kind),
            ReactEvent::FinalAnswer { step, .. } => final_step = Some(step),
            _ => {}
        }
    }
    assert_eq!(failed_kinds, vec!["execution".to_string()]);
    assert_eq!(final_step, Some(3));
}

#[tokio::test]
async fn test_no_answer_when_steps_run_out() {
    let mut config = AppConfig::default();
    config.agent.max_steps = 3;
    let mock = Arc::new(MockLlmClient::new(Vec::<String>::new()).with_fallback("I am not sure what to do."));
    let runtime = AgentRuntime::with_client(config, mock.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = runtime.process_command(&battlefield(), "Retreat", Some(tx)).await.unwrap();
    assert_eq!(result, None);

    let mut parsing_failures = 0;
    let mut gave_up = false;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            ReactEvent::StepFailed { kind, .. } if kind == "parsing" => parsing_failures += 1,
            ReactEvent::NoAnswer { .. } => gave_up = true,
            _ => {}
        }
    }
    assert_eq!(parsing_failures, mock.call_count());
    assert!(gave_up);
}
