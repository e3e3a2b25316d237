// 账号与会话令牌：Argon2 哈希口令，tok_ 前缀的 Bearer 令牌带 TTL。
use crate::storage::{StorageBackend, UserAccountRecord, UserTokenRecord};
use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_TOKEN_TTL_S: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub status: String,
    pub created_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UserSession {
    pub user: UserAccountRecord,
    pub token: UserTokenRecord,
}

pub struct UserStore {
    storage: Arc<dyn StorageBackend>,
}

impl UserStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// 用户名只允许字母数字与 _ -，同时作为 user_id 使用。
    pub fn normalize_user_id(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut output = String::with_capacity(trimmed.len());
        for ch in trimmed.chars() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                output.push(ch);
            } else {
                return None;
            }
        }
        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }

    pub fn hash_password(password: &str) -> Result<String> {
        let trimmed = password.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("password is empty"));
        }
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(trimmed.as_bytes(), &salt)
            .map_err(|err| anyhow!(err.to_string()))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(hash: &str, password: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.trim().as_bytes(), &parsed)
            .is_ok()
    }

    pub fn to_profile(user: &UserAccountRecord) -> UserProfile {
        UserProfile {
            id: user.user_id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            status: user.status.clone(),
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }

    pub fn create_user(
        &self,
        username: &str,
        email: Option<String>,
        password: &str,
    ) -> Result<UserAccountRecord> {
        let user_id =
            Self::normalize_user_id(username).ok_or_else(|| anyhow!("invalid username"))?;
        if self
            .storage
            .get_user_account_by_username(&user_id)?
            .is_some()
        {
            return Err(anyhow!("username already exists"));
        }
        let email = email
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let now = now_ts();
        let record = UserAccountRecord {
            user_id: user_id.clone(),
            username: user_id,
            email,
            password_hash: Self::hash_password(password)?,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };
        self.storage.upsert_user_account(&record)?;
        Ok(record)
    }

    pub fn create_session_token(&self, user_id: &str) -> Result<UserTokenRecord> {
        let now = now_ts();
        let record = UserTokenRecord {
            token: format!("tok_{}", Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            expires_at: now + DEFAULT_TOKEN_TTL_S as f64,
            created_at: now,
            last_used_at: now,
        };
        self.storage.create_user_token(&record)?;
        Ok(record)
    }

    /// 令牌换用户：过期即删，禁用账号视为无效，命中时刷新 last_used_at。
    pub fn authenticate_token(&self, token: &str) -> Result<Option<UserAccountRecord>> {
        let Some(record) = self.storage.get_user_token(token)? else {
            return Ok(None);
        };
        let now = now_ts();
        if record.expires_at <= now {
            let _ = self.storage.delete_user_token(&record.token);
            return Ok(None);
        }
        let Some(user) = self.storage.get_user_account(&record.user_id)? else {
            return Ok(None);
        };
        if user.status.trim().to_lowercase() != "active" {
            return Ok(None);
        }
        let _ = self.storage.touch_user_token(&record.token, now);
        Ok(Some(user))
    }

    pub fn login(&self, username: &str, password: &str) -> Result<UserSession> {
        let user_id =
            Self::normalize_user_id(username).ok_or_else(|| anyhow!("invalid username"))?;
        let mut user = self
            .storage
            .get_user_account_by_username(&user_id)?
            .ok_or_else(|| anyhow!("user not found"))?;
        if user.status.trim().to_lowercase() != "active" {
            return Err(anyhow!("user disabled"));
        }
        if !Self::verify_password(&user.password_hash, password) {
            return Err(anyhow!("invalid password"));
        }
        let now = now_ts();
        user.last_login_at = Some(now);
        user.updated_at = now;
        self.storage.upsert_user_account(&user)?;
        let token = self.create_session_token(&user.user_id)?;
        Ok(UserSession { user, token })
    }

    pub fn logout(&self, token: &str) -> Result<i64> {
        self.storage.delete_user_token(token)
    }
}

pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn temp_store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.db");
        let storage = Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()));
        storage.ensure_initialized().expect("init storage");
        (dir, UserStore::new(storage))
    }

    #[test]
    fn normalize_user_id_rejects_odd_characters() {
        assert_eq!(
            UserStore::normalize_user_id(" alice-01 "),
            Some("alice-01".to_string())
        );
        assert_eq!(UserStore::normalize_user_id("a b"), None);
        assert_eq!(UserStore::normalize_user_id(""), None);
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = UserStore::hash_password("secret").expect("hash");
        assert!(UserStore::verify_password(&hash, "secret"));
        assert!(!UserStore::verify_password(&hash, "wrong"));
        assert!(!UserStore::verify_password("not-a-hash", "secret"));
    }

    #[test]
    fn login_issues_token_and_authenticates() {
        let (_dir, store) = temp_store();
        store
            .create_user("alice", Some("alice@example.com".to_string()), "secret")
            .expect("create user");
        assert!(store.login("alice", "wrong").is_err());
        let session = store.login("alice", "secret").expect("login");
        assert!(session.token.token.starts_with("tok_"));
        let user = store
            .authenticate_token(&session.token.token)
            .expect("authenticate")
            .expect("user present");
        assert_eq!(user.user_id, "alice");

        store.logout(&session.token.token).expect("logout");
        assert!(store
            .authenticate_token(&session.token.token)
            .expect("authenticate")
            .is_none());
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let (_dir, store) = temp_store();
        store.create_user("alice", None, "secret").expect("create");
        assert!(store.create_user("alice", None, "other").is_err());
    }
}
