// 配置读取与覆盖合并，内置密钥统一经 ${VAR} 占位符从环境注入。
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: String,
}

/// 内置凭证：运营方代所有用户持有的密钥，走配额计数。
/// 字段缺省时回落到 providers::builtin_env_var 列出的环境变量。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialsConfig {
    pub openai: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic: Option<String>,
    pub google: Option<String>,
    pub openrouter: Option<String>,
    pub groq: Option<String>,
    pub deepseek: Option<String>,
    pub grok: Option<String>,
    pub cohere: Option<String>,
    pub mistral: Option<String>,
    pub tavily: Option<String>,
    pub openweather: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// 批量模式下允许的最大工具调用轮数。
    pub max_tool_rounds: u32,
    /// 流式模式下每次增量落库后的节流间隔（毫秒）。
    pub stream_update_delay_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            stream_update_delay_ms: 50,
        }
    }
}

impl CredentialsConfig {
    fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "openai" => &self.openai,
            "anthropic" => &self.anthropic,
            "google" => &self.google,
            "openrouter" => &self.openrouter,
            "groq" => &self.groq,
            "deepseek" => &self.deepseek,
            "grok" => &self.grok,
            "cohere" => &self.cohere,
            "mistral" => &self.mistral,
            "tavily" => &self.tavily,
            "openweather" => &self.openweather,
            _ => &None,
        };
        value.as_deref()
    }
}

impl Config {
    /// 解析某个 provider/工具的内置密钥：先看配置字段，再回落环境变量。
    pub fn builtin_key(&self, name: &str, env_var: &str) -> Option<String> {
        let inline = self
            .credentials
            .field(name)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(value) = inline {
            return Some(value.to_string());
        }
        env::var(env_var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn openai_base_url_override(&self) -> Option<String> {
        self.credentials
            .openai_base_url
            .as_ref()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

pub fn load_config() -> Config {
    // 读取基础配置与覆盖配置，覆盖文件只对非空字段做递归合并。
    let base_path =
        env::var("POLYCHAT_CONFIG_PATH").unwrap_or_else(|_| "config/polychat.yaml".to_string());
    let override_path = env::var("POLYCHAT_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| "data/config/polychat.override.yaml".to_string());

    let mut merged = read_yaml(&base_path);
    if Path::new(&override_path).exists() {
        let override_value = read_yaml(&override_path);
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, falling back to defaults: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，首次启动走默认值。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("config read failed: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("yaml parse failed: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("POLYCHAT_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${POLYCHAT_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${POLYCHAT_TEST_PLACEHOLDER:-d}-suffix"),
            "prefix-d-suffix"
        );

        std::env::set_var("POLYCHAT_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("${POLYCHAT_TEST_PLACEHOLDER:-default}"),
            "value"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${POLYCHAT_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("POLYCHAT_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${POLYCHAT_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn test_merge_yaml_keeps_base_fields() {
        let mut base: Value = serde_yaml::from_str("server:\n  host: 1.2.3.4\n  port: 8100\n")
            .expect("parse base yaml");
        let override_value: Value =
            serde_yaml::from_str("server:\n  port: 9000\n").expect("parse override yaml");
        merge_yaml(&mut base, override_value);
        let config: Config = serde_yaml::from_value(base).expect("parse merged config");
        assert_eq!(config.server.host, "1.2.3.4");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_builtin_key_prefers_config_field() {
        std::env::set_var("POLYCHAT_TEST_GROQ_KEY", "env-key");
        let mut config = Config::default();
        assert_eq!(
            config.builtin_key("groq", "POLYCHAT_TEST_GROQ_KEY"),
            Some("env-key".to_string())
        );
        config.credentials.groq = Some("inline-key".to_string());
        assert_eq!(
            config.builtin_key("groq", "POLYCHAT_TEST_GROQ_KEY"),
            Some("inline-key".to_string())
        );
        std::env::remove_var("POLYCHAT_TEST_GROQ_KEY");
    }
}
