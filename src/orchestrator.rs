// 响应编排：凭证解析、配额闸门、工具循环与流式落库的统一入口。
use crate::config::Config;
use crate::credentials::{resolve_credential, ResolvedCredential};
use crate::llm::{GenerationParams, LlmClient, LlmResponse, TranscriptEntry};
use crate::providers::Provider;
use crate::schemas::{ChatMessage, TokenUsage, ToolCallRecord, ToolSpec};
use crate::storage::{MessageRecord, PreferencesRecord, StorageBackend};
use crate::tools::{execute_tool, tool_specs, ToolContext};
use crate::usage::UsageLedger;
use crate::user_store::now_ts;
use anyhow::Result;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer clearly and concisely. \
Use the available tools when they help answer the question.";

const EMPTY_OUTPUT_PLACEHOLDER: &str =
    "I apologize, but I was unable to generate a response. Please try again.";

#[derive(Debug)]
pub struct OrchestratorError {
    code: &'static str,
    message: String,
}

impl OrchestratorError {
    fn new(code: &'static str, message: String) -> Self {
        Self { code, message }
    }

    pub fn invalid_request(message: String) -> Self {
        Self::new("INVALID_REQUEST", message)
    }

    pub fn not_found(message: String) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn provider_not_configured(provider: &str) -> Self {
        Self::new(
            "PROVIDER_NOT_CONFIGURED",
            format!(
                "Provider {provider} is not configured. Add your own API key in settings to use it."
            ),
        )
    }

    pub fn quota_exceeded(message: String) -> Self {
        Self::new("QUOTA_EXCEEDED", message)
    }

    pub fn upstream(message: String) -> Self {
        Self::new("UPSTREAM_ERROR", message)
    }

    pub fn internal(message: String) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OrchestratorError {}

/// 生成请求可覆盖偏好里的 provider/model，以及本次启用的工具列表。
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// None 时沿用偏好里启用的工具；Some(空) 表示本次不用工具。
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub message: MessageRecord,
    pub usage: Option<TokenUsage>,
}

struct Prepared {
    provider: Provider,
    credential: ResolvedCredential,
    params: GenerationParams,
    tools: Vec<ToolSpec>,
    transcript: Vec<TranscriptEntry>,
}

pub struct Orchestrator {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    usage: UsageLedger,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(config: Config, storage: Arc<dyn StorageBackend>, http: reqwest::Client) -> Self {
        let usage = UsageLedger::new(storage.clone());
        Self {
            config,
            storage,
            usage,
            http,
        }
    }

    /// 共同前置：属主校验、偏好解析、凭证解析、配额闸门、历史装配。
    fn prepare(
        &self,
        user_id: &str,
        conversation_id: &str,
        options: &GenerateOptions,
    ) -> Result<Prepared, OrchestratorError> {
        self.storage
            .get_conversation(user_id, conversation_id)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?
            .ok_or_else(|| OrchestratorError::not_found("Conversation not found".to_string()))?;

        let preferences = self
            .storage
            .get_preferences(user_id)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?
            .unwrap_or_else(|| PreferencesRecord::default_for(user_id));

        let provider_name = options
            .provider
            .as_deref()
            .unwrap_or(&preferences.provider);
        let provider = Provider::from_str(provider_name)
            .map_err(|_| OrchestratorError::invalid_request(format!("Unknown provider: {provider_name}")))?;
        let model = match options.model.as_deref() {
            Some(model) => model.to_string(),
            // 显式换了 provider 但没给模型时，用该 provider 的默认模型。
            None if provider.as_str() != preferences.provider => {
                provider.default_model().to_string()
            }
            None => preferences.model.clone(),
        };

        let credential = resolve_credential(&self.storage, &self.config, user_id, provider)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?
            .ok_or_else(|| OrchestratorError::provider_not_configured(provider.as_str()))?;

        if !credential.user_key {
            let has_budget = self
                .usage
                .has_message_budget(user_id)
                .map_err(|err| OrchestratorError::internal(err.to_string()))?;
            if !has_budget {
                return Err(OrchestratorError::quota_exceeded(
                    "Monthly message limit reached. Upgrade your plan or add your own API keys in settings.".to_string(),
                ));
            }
        }

        let history = self
            .storage
            .list_messages(conversation_id)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?;
        let mut transcript = vec![TranscriptEntry::Message(ChatMessage::new(
            "system",
            SYSTEM_PROMPT,
        ))];
        for message in &history {
            if message.content.trim().is_empty() {
                continue;
            }
            transcript.push(TranscriptEntry::Message(ChatMessage::new(
                message.role.clone(),
                message.content.clone(),
            )));
        }

        Ok(Prepared {
            provider,
            credential,
            params: GenerationParams {
                model,
                temperature: preferences.temperature,
                max_tokens: preferences.max_tokens,
            },
            tools: resolve_tools(options, &preferences),
            transcript,
        })
    }

    /// 批量生成：最多 5 轮工具往返，落一条带工具记录的助手消息。
    pub async fn generate(
        &self,
        user_id: &str,
        conversation_id: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, OrchestratorError> {
        let prepared = self.prepare(user_id, conversation_id, options)?;
        let client = LlmClient::new(
            self.http.clone(),
            prepared.provider,
            prepared.credential.clone(),
            prepared.params.clone(),
        );
        let tools = &prepared.tools;
        let tool_context = ToolContext {
            user_id,
            config: &self.config,
            storage: &self.storage,
            usage: &self.usage,
            http: &self.http,
        };

        let mut transcript = prepared.transcript;
        let mut tool_records: Vec<ToolCallRecord> = Vec::new();
        let mut rounds = 0u32;
        let final_response: LlmResponse = loop {
            let response = match client.complete(&transcript, tools).await {
                Ok(response) => response,
                Err(err) => {
                    self.persist_failure(
                        user_id,
                        conversation_id,
                        &err.to_string(),
                        prepared.credential.user_key,
                    );
                    return Err(OrchestratorError::upstream(err.to_string()));
                }
            };
            if response.tool_calls.is_empty() || rounds >= self.config.generation.max_tool_rounds {
                break response;
            }
            rounds += 1;
            info!(
                "tool round {rounds}: {} call(s) from {}",
                response.tool_calls.len(),
                prepared.provider
            );
            let calls = response.tool_calls.clone();
            transcript.push(TranscriptEntry::AssistantToolCalls {
                content: response.content.clone(),
                calls: calls.clone(),
            });
            for call in calls {
                let arguments: Value =
                    serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                let result = execute_tool(&tool_context, &call.name, &arguments).await;
                tool_records.push(ToolCallRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: Some(result.clone()),
                });
                transcript.push(TranscriptEntry::ToolResult {
                    call_id: call.id,
                    name: call.name,
                    content: result,
                });
            }
        };

        let content = if final_response.content.trim().is_empty() {
            EMPTY_OUTPUT_PLACEHOLDER.to_string()
        } else {
            final_response.content.clone()
        };
        let record = self
            .persist_assistant_message(conversation_id, &content, tool_records)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?;
        if !prepared.credential.user_key {
            let _ = self.usage.increment_messages(user_id, 1);
        }
        Ok(GenerateOutcome {
            message: record,
            usage: final_response.usage,
        })
    }

    /// 流式生成：先落空助手消息，逐增量改写内容，结束后定稿。
    /// on_delta 用于把增量继续转发给 HTTP 层。
    pub async fn generate_streaming<F>(
        &self,
        user_id: &str,
        conversation_id: &str,
        options: &GenerateOptions,
        mut on_delta: F,
    ) -> Result<GenerateOutcome, OrchestratorError>
    where
        F: FnMut(&str) + Send,
    {
        let prepared = self.prepare(user_id, conversation_id, options)?;
        let client = LlmClient::new(
            self.http.clone(),
            prepared.provider,
            prepared.credential.clone(),
            prepared.params.clone(),
        );

        let record = self
            .persist_assistant_message(conversation_id, "", Vec::new())
            .map_err(|err| OrchestratorError::internal(err.to_string()))?;
        let delay = Duration::from_millis(self.config.generation.stream_update_delay_ms);
        let persister = Arc::new(tokio::sync::Mutex::new(StreamPersister::new(
            self.storage.clone(),
            record.message_id.clone(),
            delay,
        )));

        let stream_result = client
            .stream_complete_with_callback(&prepared.transcript, |delta| {
                let persister = persister.clone();
                on_delta(&delta);
                async move { persister.lock().await.push_delta(&delta).await }
            })
            .await;

        let response = match stream_result {
            Ok(response) => response,
            Err(err) => {
                let text = failure_text(&err.to_string(), prepared.credential.user_key);
                let _ = self
                    .storage
                    .update_message_content(&record.message_id, &text);
                return Err(OrchestratorError::upstream(err.to_string()));
            }
        };

        let content = if response.content.trim().is_empty() {
            EMPTY_OUTPUT_PLACEHOLDER.to_string()
        } else {
            response.content.clone()
        };
        self.storage
            .update_message_content(&record.message_id, &content)
            .map_err(|err| OrchestratorError::internal(err.to_string()))?;
        let now = now_ts();
        let _ = self.storage.touch_conversation(conversation_id, now, now);
        if !prepared.credential.user_key {
            let _ = self.usage.increment_messages(user_id, 1);
        }
        let mut final_record = record;
        final_record.content = content;
        Ok(GenerateOutcome {
            message: final_record,
            usage: response.usage,
        })
    }

    fn persist_assistant_message(
        &self,
        conversation_id: &str,
        content: &str,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<MessageRecord> {
        let now = now_ts();
        let record = MessageRecord {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            role: "assistant".to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
            tool_calls,
            created_at: now,
        };
        self.storage.insert_message(&record)?;
        self.storage.touch_conversation(conversation_id, now, now)?;
        Ok(record)
    }

    /// 上游失败时先把错误落成一条用户可见的助手消息，再向上抛。
    fn persist_failure(&self, user_id: &str, conversation_id: &str, error: &str, user_key: bool) {
        let text = failure_text(error, user_key);
        if let Err(err) = self.persist_assistant_message(conversation_id, &text, Vec::new()) {
            warn!("生成失败消息落库失败: {user_id}/{conversation_id}, {err}");
        }
    }
}

/// 请求级工具列表优先于偏好设置。
fn resolve_tools(options: &GenerateOptions, preferences: &PreferencesRecord) -> Vec<ToolSpec> {
    match &options.tools {
        Some(names) => tool_specs(names),
        None => tool_specs(&preferences.enabled_tools),
    }
}

fn failure_text(error: &str, user_key: bool) -> String {
    if user_key {
        format!("I apologize, but I encountered an error: {error}")
    } else {
        format!(
            "I apologize, but I encountered an error: {error}. Consider adding your own API keys in settings."
        )
    }
}

/// 流式落库器：增量追加到内存副本，整体改写存储内容，再按节流间隔等待。
pub struct StreamPersister {
    storage: Arc<dyn StorageBackend>,
    message_id: String,
    content: String,
    delay: Duration,
}

impl StreamPersister {
    pub fn new(storage: Arc<dyn StorageBackend>, message_id: String, delay: Duration) -> Self {
        Self {
            storage,
            message_id,
            content: String::new(),
            delay,
        }
    }

    pub async fn push_delta(&mut self, delta: &str) -> Result<()> {
        self.content.push_str(delta);
        self.storage
            .update_message_content(&self.message_id, &self.content)?;
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(())
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn temp_storage() -> (tempfile::TempDir, Arc<dyn StorageBackend>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orchestrator.db");
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()));
        storage.ensure_initialized().expect("init storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn stream_persister_rewrites_content_per_delta() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_message(&MessageRecord {
                message_id: "msg_stream".to_string(),
                conversation_id: "conv_1".to_string(),
                role: "assistant".to_string(),
                content: String::new(),
                attachments: Vec::new(),
                tool_calls: Vec::new(),
                created_at: 1.0,
            })
            .expect("insert placeholder");

        let mut persister = StreamPersister::new(
            storage.clone(),
            "msg_stream".to_string(),
            Duration::ZERO,
        );
        persister.push_delta("Hel").await.expect("push delta");
        let stored = storage
            .get_message("msg_stream")
            .expect("get")
            .expect("present");
        assert_eq!(stored.content, "Hel");

        persister.push_delta("lo").await.expect("push delta");
        let stored = storage
            .get_message("msg_stream")
            .expect("get")
            .expect("present");
        assert_eq!(stored.content, "Hello");
        assert_eq!(persister.content(), "Hello");
    }

    #[tokio::test]
    async fn prepare_rejects_missing_conversation_and_credential() {
        let (_dir, storage) = temp_storage();
        std::env::remove_var("OPENAI_API_KEY");
        let orchestrator = Orchestrator::new(
            Config::default(),
            storage.clone(),
            reqwest::Client::new(),
        );

        let missing = orchestrator
            .generate("alice", "conv_missing", &GenerateOptions::default())
            .await
            .expect_err("missing conversation");
        assert_eq!(missing.code(), "NOT_FOUND");

        storage
            .upsert_conversation(&crate::storage::ConversationRecord {
                conversation_id: "conv_1".to_string(),
                user_id: "alice".to_string(),
                title: "test".to_string(),
                created_at: 1.0,
                updated_at: 1.0,
                last_message_at: 1.0,
            })
            .expect("seed conversation");

        // 默认偏好指向 openai，但既无用户密钥也无内置密钥。
        let unconfigured = orchestrator
            .generate("alice", "conv_1", &GenerateOptions::default())
            .await
            .expect_err("no credential");
        assert_eq!(unconfigured.code(), "PROVIDER_NOT_CONFIGURED");
        assert!(unconfigured.message().contains("openai"));

        let unknown = orchestrator
            .generate(
                "alice",
                "conv_1",
                &GenerateOptions {
                    provider: Some("llamafile".to_string()),
                    ..GenerateOptions::default()
                },
            )
            .await
            .expect_err("unknown provider");
        assert_eq!(unknown.code(), "INVALID_REQUEST");
    }

    #[test]
    fn request_tools_override_preference_tools() {
        let preferences = PreferencesRecord::default_for("alice");

        // 不带 tools 时沿用偏好。
        let defaults = resolve_tools(&GenerateOptions::default(), &preferences);
        assert!(defaults.iter().any(|spec| spec.name == "web_search"));

        let only_calculator = resolve_tools(
            &GenerateOptions {
                tools: Some(vec!["calculator".to_string()]),
                ..GenerateOptions::default()
            },
            &preferences,
        );
        let names: Vec<&str> = only_calculator
            .iter()
            .map(|spec| spec.name.as_str())
            .collect();
        assert_eq!(names, vec!["calculator"]);

        // 显式空列表关掉所有工具。
        let none = resolve_tools(
            &GenerateOptions {
                tools: Some(Vec::new()),
                ..GenerateOptions::default()
            },
            &preferences,
        );
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn quota_gate_fires_before_any_provider_call() {
        let (_dir, storage) = temp_storage();
        let mut config = Config::default();
        config.credentials.openai = Some("builtin-key".to_string());
        let orchestrator = Orchestrator::new(config, storage.clone(), reqwest::Client::new());

        storage
            .upsert_conversation(&crate::storage::ConversationRecord {
                conversation_id: "conv_1".to_string(),
                user_id: "alice".to_string(),
                title: "test".to_string(),
                created_at: 1.0,
                updated_at: 1.0,
                last_message_at: 1.0,
            })
            .expect("seed conversation");
        let ledger = UsageLedger::new(storage.clone());
        let record = ledger.ensure_record("alice").expect("ensure");
        let limits = crate::usage::limits_for_plan(&record.plan);
        storage
            .upsert_usage(&crate::storage::UsageRecord {
                messages_used: limits.messages_per_month,
                ..record
            })
            .expect("seed at limit");

        let rejected = orchestrator
            .generate("alice", "conv_1", &GenerateOptions::default())
            .await
            .expect_err("quota gate");
        assert_eq!(rejected.code(), "QUOTA_EXCEEDED");
        // 没有任何消息被落库。
        assert!(storage.list_messages("conv_1").expect("list").is_empty());
        let after = ledger.ensure_record("alice").expect("ensure");
        assert_eq!(after.messages_used, limits.messages_per_month);
    }
}
