// SQLite 存储实现：WAL 模式，首次访问时一次性建表。
use crate::schemas::{AttachmentPayload, FavoriteModel, ToolCallRecord};
use crate::storage::{
    ApiKeyRecord, ConversationRecord, MessageRecord, PreferencesRecord, StorageBackend,
    UsageRecord, UserAccountRecord, UserTokenRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/polychat.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn string_list_from_json(raw: &str) -> Vec<String> {
        serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserAccountRecord> {
    Ok(UserAccountRecord {
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_login_at: row.get("last_login_at")?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        conversation_id: row.get("conversation_id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_message_at: row.get("last_message_at")?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let attachments_json: String = row.get("attachments")?;
    let tool_calls_json: String = row.get("tool_calls")?;
    Ok(MessageRecord {
        message_id: row.get("message_id")?,
        conversation_id: row.get("conversation_id")?,
        role: row.get("role")?,
        content: row.get("content")?,
        attachments: serde_json::from_str::<Vec<AttachmentPayload>>(&attachments_json)
            .unwrap_or_default(),
        tool_calls: serde_json::from_str::<Vec<ToolCallRecord>>(&tool_calls_json)
            .unwrap_or_default(),
        created_at: row.get("created_at")?,
    })
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_accounts (
              user_id TEXT PRIMARY KEY,
              username TEXT NOT NULL UNIQUE,
              email TEXT,
              password_hash TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_login_at REAL
            );
            CREATE TABLE IF NOT EXISTS user_tokens (
              token TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              expires_at REAL NOT NULL,
              created_at REAL NOT NULL,
              last_used_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_tokens_user
              ON user_tokens (user_id);
            CREATE TABLE IF NOT EXISTS conversations (
              conversation_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              title TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_message_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user
              ON conversations (user_id, last_message_at);
            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              message_id TEXT NOT NULL UNIQUE,
              conversation_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              attachments TEXT NOT NULL,
              tool_calls TEXT NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
              ON messages (conversation_id, id);
            CREATE TABLE IF NOT EXISTS api_keys (
              user_id TEXT NOT NULL,
              provider TEXT NOT NULL,
              api_key TEXT NOT NULL,
              is_active INTEGER NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (user_id, provider)
            );
            CREATE TABLE IF NOT EXISTS user_preferences (
              user_id TEXT PRIMARY KEY,
              provider TEXT NOT NULL,
              model TEXT NOT NULL,
              temperature REAL NOT NULL,
              max_tokens INTEGER NOT NULL,
              enabled_tools TEXT NOT NULL,
              favorite_models TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_usage (
              user_id TEXT PRIMARY KEY,
              plan TEXT NOT NULL,
              messages_used INTEGER NOT NULL,
              searches_used INTEGER NOT NULL,
              reset_date REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO user_accounts
              (user_id, username, email, password_hash, status, created_at, updated_at, last_login_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id) DO UPDATE SET
              username = excluded.username,
              email = excluded.email,
              password_hash = excluded.password_hash,
              status = excluded.status,
              updated_at = excluded.updated_at,
              last_login_at = excluded.last_login_at
            "#,
            params![
                record.user_id,
                record.username,
                record.email,
                record.password_hash,
                record.status,
                record.created_at,
                record.updated_at,
                record.last_login_at,
            ],
        )?;
        Ok(())
    }

    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM user_accounts WHERE user_id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()?;
        Ok(record)
    }

    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM user_accounts WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(record)
    }

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO user_tokens (token, user_id, expires_at, created_at, last_used_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.token,
                record.user_id,
                record.expires_at,
                record.created_at,
                record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM user_tokens WHERE token = ?1",
                params![token],
                |row| {
                    Ok(UserTokenRecord {
                        token: row.get("token")?,
                        user_id: row.get("user_id")?,
                        expires_at: row.get("expires_at")?,
                        created_at: row.get("created_at")?,
                        last_used_at: row.get("last_used_at")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE user_tokens SET last_used_at = ?2 WHERE token = ?1",
            params![token, last_used_at],
        )?;
        Ok(())
    }

    fn delete_user_token(&self, token: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let deleted = conn.execute("DELETE FROM user_tokens WHERE token = ?1", params![token])?;
        Ok(deleted as i64)
    }

    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO conversations
              (conversation_id, user_id, title, created_at, updated_at, last_message_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(conversation_id) DO UPDATE SET
              title = excluded.title,
              updated_at = excluded.updated_at,
              last_message_at = excluded.last_message_at
            "#,
            params![
                record.conversation_id,
                record.user_id,
                record.title,
                record.created_at,
                record.updated_at,
                record.last_message_at,
            ],
        )?;
        Ok(())
    }

    fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM conversations WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                row_to_conversation,
            )
            .optional()?;
        Ok(record)
    }

    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT * FROM conversations WHERE user_id = ?1 ORDER BY last_message_at DESC",
        )?;
        let rows = statement.query_map(params![user_id], row_to_conversation)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn update_conversation_title(
        &self,
        user_id: &str,
        conversation_id: &str,
        title: &str,
        updated_at: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            UPDATE conversations SET title = ?3, updated_at = ?4
            WHERE conversation_id = ?1 AND user_id = ?2
            "#,
            params![conversation_id, user_id, title, updated_at],
        )?;
        Ok(())
    }

    fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: f64,
        last_message_at: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            UPDATE conversations SET updated_at = ?2, last_message_at = ?3
            WHERE conversation_id = ?1
            "#,
            params![conversation_id, updated_at, last_message_at],
        )?;
        Ok(())
    }

    fn delete_conversation(&self, user_id: &str, conversation_id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
        )?;
        if deleted > 0 {
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
        }
        tx.commit()?;
        Ok(deleted as i64)
    }

    fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let attachments = serde_json::to_string(&record.attachments)?;
        let tool_calls = serde_json::to_string(&record.tool_calls)?;
        conn.execute(
            r#"
            INSERT INTO messages
              (message_id, conversation_id, role, content, attachments, tool_calls, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.message_id,
                record.conversation_id,
                record.role,
                record.content,
                attachments,
                tool_calls,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM messages WHERE message_id = ?1",
                params![message_id],
                row_to_message,
            )
            .optional()?;
        Ok(record)
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // 插入顺序即展示顺序。
        let mut statement =
            conn.prepare("SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id ASC")?;
        let rows = statement.query_map(params![conversation_id], row_to_message)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn update_message_content(&self, message_id: &str, content: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE messages SET content = ?2 WHERE message_id = ?1",
            params![message_id, content],
        )?;
        Ok(())
    }

    fn upsert_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO api_keys (user_id, provider, api_key, is_active, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id, provider) DO UPDATE SET
              api_key = excluded.api_key,
              is_active = excluded.is_active,
              updated_at = excluded.updated_at
            "#,
            params![
                record.user_id,
                record.provider,
                record.api_key,
                record.is_active as i64,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_active_api_key(&self, user_id: &str, provider: &str) -> Result<Option<ApiKeyRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                r#"
                SELECT * FROM api_keys
                WHERE user_id = ?1 AND provider = ?2 AND is_active = 1
                "#,
                params![user_id, provider],
                |row| {
                    Ok(ApiKeyRecord {
                        user_id: row.get("user_id")?,
                        provider: row.get("provider")?,
                        api_key: row.get("api_key")?,
                        is_active: row.get::<_, i64>("is_active")? != 0,
                        updated_at: row.get("updated_at")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement =
            conn.prepare("SELECT * FROM api_keys WHERE user_id = ?1 ORDER BY provider ASC")?;
        let rows = statement.query_map(params![user_id], |row| {
            Ok(ApiKeyRecord {
                user_id: row.get("user_id")?,
                provider: row.get("provider")?,
                api_key: row.get("api_key")?,
                is_active: row.get::<_, i64>("is_active")? != 0,
                updated_at: row.get("updated_at")?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_api_key(&self, user_id: &str, provider: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM api_keys WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
        )?;
        Ok(deleted as i64)
    }

    fn get_preferences(&self, user_id: &str) -> Result<Option<PreferencesRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM user_preferences WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let enabled_tools: String = row.get("enabled_tools")?;
                    let favorite_models: String = row.get("favorite_models")?;
                    Ok(PreferencesRecord {
                        user_id: row.get("user_id")?,
                        provider: row.get("provider")?,
                        model: row.get("model")?,
                        temperature: row.get("temperature")?,
                        max_tokens: row.get::<_, i64>("max_tokens")? as u32,
                        enabled_tools: Self::string_list_from_json(&enabled_tools),
                        favorite_models: serde_json::from_str::<Vec<FavoriteModel>>(
                            &favorite_models,
                        )
                        .unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_preferences(&self, record: &PreferencesRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let enabled_tools = Self::string_list_to_json(&record.enabled_tools);
        let favorite_models = serde_json::to_string(&record.favorite_models)?;
        conn.execute(
            r#"
            INSERT INTO user_preferences
              (user_id, provider, model, temperature, max_tokens, enabled_tools, favorite_models)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id) DO UPDATE SET
              provider = excluded.provider,
              model = excluded.model,
              temperature = excluded.temperature,
              max_tokens = excluded.max_tokens,
              enabled_tools = excluded.enabled_tools,
              favorite_models = excluded.favorite_models
            "#,
            params![
                record.user_id,
                record.provider,
                record.model,
                record.temperature,
                record.max_tokens as i64,
                enabled_tools,
                favorite_models,
            ],
        )?;
        Ok(())
    }

    fn get_usage(&self, user_id: &str) -> Result<Option<UsageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM user_usage WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UsageRecord {
                        user_id: row.get("user_id")?,
                        plan: row.get("plan")?,
                        messages_used: row.get("messages_used")?,
                        searches_used: row.get("searches_used")?,
                        reset_date: row.get("reset_date")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_usage(&self, record: &UsageRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO user_usage (user_id, plan, messages_used, searches_used, reset_date)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
              plan = excluded.plan,
              messages_used = excluded.messages_used,
              searches_used = excluded.searches_used,
              reset_date = excluded.reset_date
            "#,
            params![
                record.user_id,
                record.plan,
                record.messages_used,
                record.searches_used,
                record.reset_date,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("polychat-test.db");
        let storage = SqliteStorage::new(path.to_string_lossy().to_string());
        storage.ensure_initialized().expect("init storage");
        (dir, storage)
    }

    #[test]
    fn conversation_delete_cascades_messages() {
        let (_dir, storage) = temp_storage();
        let conversation = ConversationRecord {
            conversation_id: "conv_1".to_string(),
            user_id: "alice".to_string(),
            title: "test".to_string(),
            created_at: 1.0,
            updated_at: 1.0,
            last_message_at: 1.0,
        };
        storage.upsert_conversation(&conversation).expect("upsert");
        storage
            .insert_message(&MessageRecord {
                message_id: "msg_1".to_string(),
                conversation_id: "conv_1".to_string(),
                role: "user".to_string(),
                content: "hi".to_string(),
                attachments: Vec::new(),
                tool_calls: Vec::new(),
                created_at: 1.0,
            })
            .expect("insert message");

        // 非属主删除不生效。
        assert_eq!(
            storage.delete_conversation("bob", "conv_1").expect("delete"),
            0
        );
        assert_eq!(
            storage
                .delete_conversation("alice", "conv_1")
                .expect("delete"),
            1
        );
        assert!(storage
            .list_messages("conv_1")
            .expect("list messages")
            .is_empty());
    }

    #[test]
    fn api_key_upsert_is_unique_per_provider() {
        let (_dir, storage) = temp_storage();
        for key in ["first", "second"] {
            storage
                .upsert_api_key(&ApiKeyRecord {
                    user_id: "alice".to_string(),
                    provider: "openai".to_string(),
                    api_key: key.to_string(),
                    is_active: true,
                    updated_at: 1.0,
                })
                .expect("upsert key");
        }
        let keys = storage.list_api_keys("alice").expect("list keys");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].api_key, "second");
        let active = storage
            .get_active_api_key("alice", "openai")
            .expect("get active")
            .expect("key present");
        assert_eq!(active.api_key, "second");
    }

    #[test]
    fn messages_list_in_insertion_order() {
        let (_dir, storage) = temp_storage();
        for (index, content) in ["one", "two", "three"].iter().enumerate() {
            storage
                .insert_message(&MessageRecord {
                    message_id: format!("msg_{index}"),
                    conversation_id: "conv_1".to_string(),
                    role: "user".to_string(),
                    content: content.to_string(),
                    attachments: Vec::new(),
                    tool_calls: Vec::new(),
                    // 时间戳相同也不影响排序。
                    created_at: 1.0,
                })
                .expect("insert message");
        }
        let messages = storage.list_messages("conv_1").expect("list");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn preferences_roundtrip() {
        let (_dir, storage) = temp_storage();
        assert!(storage.get_preferences("alice").expect("get").is_none());
        let mut record = PreferencesRecord::default_for("alice");
        record.favorite_models.push(FavoriteModel {
            provider: "groq".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
        });
        storage.upsert_preferences(&record).expect("upsert");
        let loaded = storage
            .get_preferences("alice")
            .expect("get")
            .expect("present");
        assert_eq!(loaded.model, "gpt-4o-mini");
        assert_eq!(loaded.enabled_tools.len(), 3);
        assert_eq!(loaded.favorite_models.len(), 1);
    }
}
