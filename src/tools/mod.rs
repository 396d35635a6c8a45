//! 能力层：注册表（命令描述、参数绑定）与函数调用 Schema

pub mod registry;
pub mod schema;

pub use registry::{ArgSpec, Capability, CapabilityRegistry, CommandCapability};
pub use schema::tool_call_schema_json;
