//! 函数调用格式的 JSON Schema（schemars 生成）
//!
//! 走函数调用路径时拼入 system prompt，约束模型输出单个 `{"name": ..., "arguments": {...}}` 对象。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

/// 单次命令调用格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 命令名，如 move_in_direction、move_to_target
    pub name: String,
    /// 命令参数，按参数名给出（unit_ids、target_id、x_delta 等）
    pub arguments: HashMap<String, serde_json::Value>,
}

/// 返回命令调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_call_fields() {
        let schema: serde_json::Value = serde_json::from_str(&tool_call_schema_json()).unwrap();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"name"));
        assert!(required.contains(&"arguments"));
    }
}
