// Provider 静态目录：名称、默认 Base URL、模型列表与内置密钥环境变量。
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 封闭的 provider 集合，新增条目需要同步目录表与线协议分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Anthropic,
    Google,
    Openrouter,
    Groq,
    Deepseek,
    Grok,
    Cohere,
    Mistral,
}

/// 线协议族：OpenAI 兼容 REST、Anthropic Messages、Google Gemini。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    OpenAiCompatible,
    Anthropic,
    Google,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub provider: Provider,
    pub display_name: &'static str,
    pub base_url: &'static str,
    pub models: &'static [&'static str],
}

pub const ALL_PROVIDERS: [Provider; 9] = [
    Provider::Openai,
    Provider::Anthropic,
    Provider::Google,
    Provider::Openrouter,
    Provider::Groq,
    Provider::Deepseek,
    Provider::Grok,
    Provider::Cohere,
    Provider::Mistral,
];

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Openrouter => "openrouter",
            Provider::Groq => "groq",
            Provider::Deepseek => "deepseek",
            Provider::Grok => "grok",
            Provider::Cohere => "cohere",
            Provider::Mistral => "mistral",
        }
    }

    pub fn wire_kind(&self) -> WireKind {
        match self {
            Provider::Anthropic => WireKind::Anthropic,
            Provider::Google => WireKind::Google,
            // Cohere 走 OpenAI 兼容端点，仅 Base URL 不同。
            Provider::Openai
            | Provider::Openrouter
            | Provider::Groq
            | Provider::Deepseek
            | Provider::Grok
            | Provider::Cohere
            | Provider::Mistral => WireKind::OpenAiCompatible,
        }
    }

    /// 内置密钥对应的环境变量，与配置字段一一对应。
    pub fn builtin_env_var(&self) -> &'static str {
        match self {
            Provider::Openai => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_GENERATIVE_AI_API_KEY",
            Provider::Openrouter => "OPENROUTER_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
            Provider::Deepseek => "DEEPSEEK_API_KEY",
            Provider::Grok => "GROK_API_KEY",
            Provider::Cohere => "COHERE_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
        }
    }

    pub fn info(&self) -> &'static ProviderInfo {
        let index = ALL_PROVIDERS
            .iter()
            .position(|item| item == self)
            .unwrap_or(0);
        &CATALOG[index]
    }

    pub fn default_model(&self) -> &'static str {
        self.info().models[0]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "anthropic" => Ok(Provider::Anthropic),
            "google" => Ok(Provider::Google),
            "openrouter" => Ok(Provider::Openrouter),
            "groq" => Ok(Provider::Groq),
            "deepseek" => Ok(Provider::Deepseek),
            "grok" => Ok(Provider::Grok),
            "cohere" => Ok(Provider::Cohere),
            "mistral" => Ok(Provider::Mistral),
            _ => Err(()),
        }
    }
}

// 目录顺序必须与 ALL_PROVIDERS 保持一致。
static CATALOG: [ProviderInfo; 9] = [
    ProviderInfo {
        provider: Provider::Openai,
        display_name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        models: &[
            "gpt-4o-mini",
            "gpt-4o",
            "gpt-4.1",
            "gpt-4.1-mini",
            "gpt-4.1-nano",
            "o3-mini",
            "o4-mini",
            "gpt-4-turbo",
            "gpt-3.5-turbo",
        ],
    },
    ProviderInfo {
        provider: Provider::Anthropic,
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com",
        models: &[
            "claude-sonnet-4-20250514",
            "claude-opus-4-20250514",
            "claude-3-7-sonnet-latest",
            "claude-3-5-sonnet-latest",
            "claude-3-5-haiku-latest",
            "claude-3-haiku-20240307",
        ],
    },
    ProviderInfo {
        provider: Provider::Google,
        display_name: "Google AI",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        models: &[
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
            "gemini-2.5-pro-preview-05-06",
            "gemini-2.5-flash-preview-05-20",
            "gemini-1.5-pro",
            "gemini-1.5-flash",
        ],
    },
    ProviderInfo {
        provider: Provider::Openrouter,
        display_name: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        models: &[
            "deepseek/deepseek-chat-v3-0324:free",
            "deepseek/deepseek-r1:free",
            "qwen/qwen3-235b-a22b:free",
            "google/gemma-3-27b-it:free",
            "anthropic/claude-3.5-sonnet",
            "openai/gpt-4o",
            "meta-llama/llama-3.1-405b-instruct",
            "mistralai/mixtral-8x7b-instruct",
        ],
    },
    ProviderInfo {
        provider: Provider::Groq,
        display_name: "Groq",
        base_url: "https://api.groq.com/openai/v1",
        models: &[
            "llama-3.3-70b-versatile",
            "llama-3.1-8b-instant",
            "deepseek-r1-distill-llama-70b",
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "qwen-qwq-32b",
            "mixtral-8x7b-32768",
            "gemma2-9b-it",
        ],
    },
    ProviderInfo {
        provider: Provider::Deepseek,
        display_name: "DeepSeek",
        base_url: "https://api.deepseek.com/v1",
        models: &["deepseek-chat", "deepseek-coder"],
    },
    ProviderInfo {
        provider: Provider::Grok,
        display_name: "Grok (xAI)",
        base_url: "https://api.x.ai/v1",
        models: &["grok-beta", "grok-vision-beta"],
    },
    ProviderInfo {
        provider: Provider::Cohere,
        display_name: "Cohere",
        base_url: "https://api.cohere.ai/v1",
        models: &["command-r-plus", "command-r", "command"],
    },
    ProviderInfo {
        provider: Provider::Mistral,
        display_name: "Mistral AI",
        base_url: "https://api.mistral.ai/v1",
        models: &[
            "mistral-large-latest",
            "mistral-medium-latest",
            "mistral-small-latest",
            "codestral-latest",
        ],
    },
];

pub fn catalog() -> &'static [ProviderInfo] {
    &CATALOG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_order_matches_provider_list() {
        for (index, provider) in ALL_PROVIDERS.iter().enumerate() {
            assert_eq!(CATALOG[index].provider, *provider);
            assert_eq!(provider.info().provider, *provider);
        }
    }

    #[test]
    fn parse_is_closed_set() {
        assert_eq!(Provider::from_str("OpenAI"), Ok(Provider::Openai));
        assert_eq!(Provider::from_str(" groq "), Ok(Provider::Groq));
        assert!(Provider::from_str("llamafile").is_err());
    }

    #[test]
    fn wire_kind_dispatch() {
        assert_eq!(Provider::Cohere.wire_kind(), WireKind::OpenAiCompatible);
        assert_eq!(Provider::Anthropic.wire_kind(), WireKind::Anthropic);
        assert_eq!(Provider::Google.wire_kind(), WireKind::Google);
    }

    #[test]
    fn every_provider_has_models_and_env_var() {
        for provider in ALL_PROVIDERS {
            assert!(!provider.info().models.is_empty());
            assert!(provider.builtin_env_var().ends_with("_API_KEY"));
        }
    }
}
