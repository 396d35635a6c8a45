//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CASTLE__*` 覆盖（双下划线表示嵌套，如 `CASTLE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub server: ServerSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、模型、生成上限与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：ollama / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次生成的 token 上限
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            max_new_tokens: default_max_new_tokens(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_max_new_tokens() -> u32 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// [agent] 段：循环步数、沙箱限制、停止序列
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_print_outputs_length")]
    pub max_print_outputs_length: usize,
    /// 追加到 math / statistics 之后的授权导入
    #[serde(default)]
    pub authorized_imports: Vec<String>,
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    /// 单次代码执行的墙钟上限（秒）
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: u64,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_print_outputs_length: default_max_print_outputs_length(),
            authorized_imports: Vec::new(),
            stop_sequences: default_stop_sequences(),
            max_operations: default_max_operations(),
            execution_timeout: default_execution_timeout(),
            verbose: false,
        }
    }
}

fn default_max_steps() -> usize {
    6
}

fn default_max_print_outputs_length() -> usize {
    crate::sandbox::DEFAULT_MAX_PRINT_OUTPUTS_LENGTH
}

fn default_stop_sequences() -> Vec<String> {
    vec!["<end_code>".into(), "Observation:".into()]
}

fn default_max_operations() -> usize {
    crate::sandbox::DEFAULT_MAX_OPERATIONS
}

fn default_execution_timeout() -> u64 {
    30
}

/// [server] 段：castle-web 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

/// 从 config 目录加载配置，环境变量 CASTLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CASTLE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CASTLE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.authorized_imports")
            .with_list_parse_key("agent.stop_sequences")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 6);
        assert_eq!(cfg.agent.stop_sequences, vec!["<end_code>", "Observation:"]);
        assert!(cfg.agent.authorized_imports.is_empty());
        assert_eq!(cfg.agent.execution_timeout, 30);
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.llm.provider, "ollama");
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[llm]\nprovider = \"mock\"\n\n[agent]\nmax_steps = 3\nauthorized_imports = [\"random\"]\n"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.agent.max_steps, 3);
        assert_eq!(cfg.agent.authorized_imports, vec!["random"]);
        // 未出现的键保持默认
        assert_eq!(cfg.llm.timeouts.request, 120);
    }
}
