//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / args / invoke），由 CapabilityRegistry
//! 按注册顺序保存；沙箱按名查找并调用，system prompt 按同一顺序渲染能力描述。
//! 构建 Agent 后只读。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 单个参数描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ArgSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// 能力 trait：名称、描述（供 LLM 理解）、参数说明、同步调用（参数已按名绑定为 JSON 对象）
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn args(&self) -> &[ArgSpec];

    fn invoke(&self, args: Map<String, Value>) -> Result<Value, String>;

    /// 描述符：`{name, description, args: {arg: {description, required}}}`，参数保持声明顺序
    fn descriptor(&self) -> Value {
        let mut args = Map::new();
        for spec in self.args() {
            args.insert(
                spec.name.clone(),
                serde_json::json!({
                    "description": spec.description,
                    "required": spec.required,
                }),
            );
        }
        serde_json::json!({
            "name": self.name(),
            "description": self.description(),
            "args": Value::Object(args),
        })
    }

    /// 按参数说明绑定位置参数与关键字参数；缺少必填参数或出现未知参数时报错
    fn bind(&self, positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Result<Map<String, Value>, String> {
        let specs = self.args();
        if positional.len() > specs.len() {
            return Err(format!(
                "{}() takes {} positional arguments but {} were given",
                self.name(),
                specs.len(),
                positional.len()
            ));
        }
        let mut bound = Map::new();
        for (spec, value) in specs.iter().zip(positional) {
            bound.insert(spec.name.clone(), value);
        }
        for (key, value) in keywords {
            if !specs.iter().any(|s| s.name == key) {
                return Err(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    self.name(),
                    key
                ));
            }
            if bound.contains_key(&key) {
                return Err(format!(
                    "{}() got multiple values for argument '{}'",
                    self.name(),
                    key
                ));
            }
            bound.insert(key, value);
        }
        let missing: Vec<&str> = specs
            .iter()
            .filter(|s| s.required && !bound.contains_key(&s.name))
            .map(|s| s.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "{}() missing required arguments: {}",
                self.name(),
                missing.join(", ")
            ));
        }
        // 输出按声明顺序排列
        let mut ordered = Map::new();
        for spec in specs {
            if let Some(v) = bound.remove(&spec.name) {
                ordered.insert(spec.name.clone(), v);
            }
        }
        Ok(ordered)
    }
}

/// 能力注册表：按注册顺序存储 Arc<dyn Capability>，同名后注册者覆盖
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        match self
            .capabilities
            .iter()
            .position(|c| c.name() == capability.name())
        {
            Some(idx) => self.capabilities[idx] = capability,
            None => self.capabilities.push(capability),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.iter().find(|c| c.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
        self.capabilities.iter()
    }

    /// 有序描述符列表，用于 prompt 与能力清单接口
    pub fn descriptors(&self) -> Value {
        Value::Array(self.capabilities.iter().map(|c| c.descriptor()).collect())
    }

    /// 按名调用：绑定参数后执行
    pub fn invoke(&self, name: &str, positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Result<Value, String> {
        let capability = self
            .get(name)
            .ok_or_else(|| format!("Unknown capability: {name}"))?;
        let args = capability.bind(positional, keywords)?;
        capability.invoke(args)
    }
}

/// 命令型能力：调用时不产生副作用，返回命令记录 `{"name": ..., "args": {...}}` 交由客户端执行
pub struct CommandCapability {
    name: String,
    description: String,
    args: Vec<ArgSpec>,
}

impl CommandCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }
}

impl Capability for CommandCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        Ok(serde_json::json!({
            "name": self.name,
            "args": Value::Object(args),
        }))
    }
}
