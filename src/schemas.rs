// 共享数据结构：对话消息、工具调用与附件的统一形状。
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 发送给模型的单条对话消息。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// 助手消息上记录的工具调用，arguments 为序列化后的 JSON 字符串。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// 消息附件，kind 仅允许 image/file。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub kind: String,
    pub url: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// 暴露给模型的工具声明。
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// (provider, model) 收藏项。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteModel {
    pub provider: String,
    pub model: String,
}

/// 收藏切换：已存在则移除，不存在则追加，双击等价于无操作。
pub fn toggle_favorite(favorites: &mut Vec<FavoriteModel>, provider: &str, model: &str) {
    if let Some(index) = favorites
        .iter()
        .position(|item| item.provider == provider && item.model == model)
    {
        favorites.remove(index);
    } else {
        favorites.push(FavoriteModel {
            provider: provider.to_string(),
            model: model.to_string(),
        });
    }
}

pub fn normalize_role(raw: &str) -> Option<&'static str> {
    match raw.trim() {
        "user" => Some("user"),
        "assistant" => Some("assistant"),
        "system" => Some("system"),
        _ => None,
    }
}

pub fn normalize_attachment_kind(raw: &str) -> Option<&'static str> {
    match raw.trim() {
        "image" => Some("image"),
        "file" => Some("file"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_favorite_is_add_then_remove() {
        let mut favorites = Vec::new();
        toggle_favorite(&mut favorites, "openai", "gpt-4o");
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].provider, "openai");
        toggle_favorite(&mut favorites, "openai", "gpt-4o");
        assert!(favorites.is_empty());
    }

    #[test]
    fn toggle_favorite_keeps_other_entries() {
        let mut favorites = vec![FavoriteModel {
            provider: "groq".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
        }];
        toggle_favorite(&mut favorites, "openai", "gpt-4o");
        toggle_favorite(&mut favorites, "groq", "llama-3.1-8b-instant");
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].provider, "openai");
    }

    #[test]
    fn normalize_role_rejects_unknown() {
        assert_eq!(normalize_role("assistant"), Some("assistant"));
        assert_eq!(normalize_role("tool"), None);
    }
}
