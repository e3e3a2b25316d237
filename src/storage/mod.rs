// 存储模块：统一封装账号、会话、消息、密钥、偏好与用量的持久化读写。

mod sqlite;

use crate::config::StorageConfig;
use crate::schemas::{AttachmentPayload, FavoriteModel, ToolCallRecord};
use anyhow::Result;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug, Clone)]
pub struct UserAccountRecord {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub status: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UserTokenRecord {
    pub token: String,
    pub user_id: String,
    pub expires_at: f64,
    pub created_at: f64,
    pub last_used_at: f64,
}

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_message_at: f64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub attachments: Vec<AttachmentPayload>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub user_id: String,
    pub provider: String,
    pub api_key: String,
    pub is_active: bool,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct PreferencesRecord {
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub enabled_tools: Vec<String>,
    pub favorite_models: Vec<FavoriteModel>,
}

impl PreferencesRecord {
    /// 无记录时的默认偏好，与原始前端的初始状态保持一致。
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            enabled_tools: vec![
                "web_search".to_string(),
                "calculator".to_string(),
                "datetime".to_string(),
            ],
            favorite_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: String,
    pub plan: String,
    pub messages_used: i64,
    pub searches_used: i64,
    /// 计数窗口的滚动边界，Unix 秒。
    pub reset_date: f64,
}

/// 存储后端抽象。实现需保证单记录读改写的原子性。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()>;
    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>>;
    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>>;

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()>;
    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>>;
    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()>;
    fn delete_user_token(&self, token: &str) -> Result<i64>;

    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()>;
    fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>>;
    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>>;
    fn update_conversation_title(
        &self,
        user_id: &str,
        conversation_id: &str,
        title: &str,
        updated_at: f64,
    ) -> Result<()>;
    fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: f64,
        last_message_at: f64,
    ) -> Result<()>;
    /// 删除会话并级联清理其消息。
    fn delete_conversation(&self, user_id: &str, conversation_id: &str) -> Result<i64>;

    fn insert_message(&self, record: &MessageRecord) -> Result<()>;
    fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>>;
    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;
    fn update_message_content(&self, message_id: &str, content: &str) -> Result<()>;

    fn upsert_api_key(&self, record: &ApiKeyRecord) -> Result<()>;
    fn get_active_api_key(&self, user_id: &str, provider: &str) -> Result<Option<ApiKeyRecord>>;
    fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>>;
    fn delete_api_key(&self, user_id: &str, provider: &str) -> Result<i64>;

    fn get_preferences(&self, user_id: &str) -> Result<Option<PreferencesRecord>>;
    fn upsert_preferences(&self, record: &PreferencesRecord) -> Result<()>;

    fn get_usage(&self, user_id: &str) -> Result<Option<UsageRecord>>;
    fn upsert_usage(&self, record: &UsageRecord) -> Result<()>;
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage = Arc::new(SqliteStorage::new(config.db_path.trim().to_string()));
    storage.ensure_initialized()?;
    Ok(storage)
}
