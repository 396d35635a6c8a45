//! 游戏内命令
//!
//! 命令在沙箱中是可调用函数，调用后返回命令记录 `{"name": ..., "args": {...}}`；
//! 最终答案为命令记录列表，由客户端逐条执行。

use serde_json::Value;

use crate::memory::AgentMemory;
use crate::react::FinalAnswerCheck;
use crate::tools::{ArgSpec, Capability, CapabilityRegistry, CommandCapability};

pub const MOVE_IN_DIRECTION: &str = "move_in_direction";
pub const MOVE_TO_TARGET: &str = "move_to_target";

const UNIT_IDS_DESCRIPTION: &str = "a list of object_ids of the units you are selecting";

/// 两个移动命令，按固定顺序注册
pub fn game_commands() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        CommandCapability::new(
            MOVE_IN_DIRECTION,
            "all units in unit_ids will move x_delta tiles to the right and y_delta tiles up. use this when moving to an empty space on the battlefield.",
        )
        .arg(ArgSpec::required("unit_ids", UNIT_IDS_DESCRIPTION))
        .arg(ArgSpec::required(
            "x_delta",
            "floating point number of how far right units will move (can be negative)",
        ))
        .arg(ArgSpec::required(
            "y_delta",
            "floating point number of how far up units will move (can be negative)",
        )),
    );
    registry.register(
        CommandCapability::new(
            MOVE_TO_TARGET,
            "all units in unit_ids will move to the target object. use this to move directly to a structure or unit.",
        )
        .arg(ArgSpec::required("unit_ids", UNIT_IDS_DESCRIPTION))
        .arg(ArgSpec::required(
            "target_id",
            "the object_id of the target (can be structure or another unit)",
        )),
    );
    registry
}

/// 最终答案必须是命令记录列表，且只引用已知命令、参数齐全
pub struct CommandsWellFormed {
    commands: CapabilityRegistry,
}

impl CommandsWellFormed {
    pub fn new(commands: CapabilityRegistry) -> Self {
        Self { commands }
    }

    fn check_record(&self, index: usize, record: &Value) -> Result<(), String> {
        let name = record
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| format!("command #{} has no name: {}", index, record))?;
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| format!("command #{} uses unknown command '{}'", index, name))?;
        let args = record
            .get("args")
            .and_then(|a| a.as_object())
            .ok_or_else(|| format!("command #{} ({}) has no args object", index, name))?;
        for spec in command.args().iter().filter(|s| s.required) {
            if !args.contains_key(&spec.name) {
                return Err(format!("command #{} ({}) is missing argument '{}'", index, name, spec.name));
            }
        }
        Ok(())
    }
}

impl Default for CommandsWellFormed {
    fn default() -> Self {
        Self::new(game_commands())
    }
}

impl FinalAnswerCheck for CommandsWellFormed {
    fn name(&self) -> &str {
        "commands_well_formed"
    }

    fn check(&self, answer: &Value, _memory: &AgentMemory) -> Result<bool, String> {
        let records = answer
            .as_array()
            .ok_or_else(|| format!("final answer must be a list of commands, got {}", answer))?;
        for (index, record) in records.iter().enumerate() {
            self.check_record(index, record)?;
        }
        Ok(true)
    }
}
