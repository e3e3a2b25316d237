// 会话与消息的 CRUD，以及批量 / 流式生成端点。
use crate::api::errors::{error_response_with_code, orchestrator_error_response};
use crate::api::user_context::resolve_user;
use crate::orchestrator::GenerateOptions;
use crate::schemas::{normalize_attachment_kind, normalize_role, AttachmentPayload};
use crate::state::AppState;
use crate::storage::{ConversationRecord, MessageRecord, PreferencesRecord};
use crate::user_store::now_ts;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/polychat/chat/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/polychat/chat/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/polychat/chat/conversations/{conversation_id}/title",
            post(update_title),
        )
        .route(
            "/polychat/chat/conversations/{conversation_id}/messages",
            get(list_messages).post(create_message),
        )
        .route(
            "/polychat/chat/conversations/{conversation_id}/generate",
            post(generate),
        )
        .route(
            "/polychat/chat/conversations/{conversation_id}/generate_stream",
            post(generate_stream),
        )
}

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateTitleRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentRequest {
    kind: String,
    url: String,
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateMessageRequest {
    role: String,
    content: String,
    #[serde(default)]
    attachments: Vec<AttachmentRequest>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    /// 不传时沿用偏好里启用的工具；传空数组表示本次不用工具。
    #[serde(default)]
    tools: Option<Vec<String>>,
}

fn conversation_json(record: &ConversationRecord) -> Value {
    json!({
        "conversation_id": record.conversation_id,
        "title": record.title,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
        "last_message_at": record.last_message_at,
    })
}

fn message_json(record: &MessageRecord) -> Value {
    json!({
        "message_id": record.message_id,
        "conversation_id": record.conversation_id,
        "role": record.role,
        "content": record.content,
        "attachments": record.attachments,
        "tool_calls": record.tool_calls,
        "created_at": record.created_at,
    })
}

/// 属主校验：不存在或非本人一律 404。
fn require_conversation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<ConversationRecord, Response> {
    state
        .storage
        .get_conversation(user_id, conversation_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?
        .ok_or_else(|| error_response_with_code("NOT_FOUND", "Conversation not found"))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let records = state
        .storage
        .list_conversations(&user.user_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    let data: Vec<Value> = records.iter().map(conversation_json).collect();
    Ok(Json(json!({ "data": data })))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let title = payload
        .title
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "New Chat".to_string());
    let now = now_ts();
    let record = ConversationRecord {
        conversation_id: format!("conv_{}", Uuid::new_v4().simple()),
        user_id: user.user_id,
        title,
        created_at: now,
        updated_at: now,
        last_message_at: now,
    };
    state
        .storage
        .upsert_conversation(&record)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": conversation_json(&record) })))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let record = require_conversation(&state, &user.user_id, &conversation_id)?;
    Ok(Json(json!({ "data": conversation_json(&record) })))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let deleted = state
        .storage
        .delete_conversation(&user.user_id, &conversation_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    if deleted == 0 {
        return Err(error_response_with_code("NOT_FOUND", "Conversation not found"));
    }
    Ok(Json(json!({ "data": { "deleted": deleted } })))
}

async fn update_title(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<UpdateTitleRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    require_conversation(&state, &user.user_id, &conversation_id)?;
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(error_response_with_code("INVALID_REQUEST", "title is required"));
    }
    state
        .storage
        .update_conversation_title(&user.user_id, &conversation_id, title, now_ts())
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": { "title": title } })))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    require_conversation(&state, &user.user_id, &conversation_id)?;
    let records = state
        .storage
        .list_messages(&conversation_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    let data: Vec<Value> = records.iter().map(message_json).collect();
    Ok(Json(json!({ "data": data })))
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    require_conversation(&state, &user.user_id, &conversation_id)?;

    let role = normalize_role(&payload.role)
        .ok_or_else(|| error_response_with_code("INVALID_REQUEST", "invalid role"))?;
    let content = payload.content.trim();
    if content.is_empty() {
        return Err(error_response_with_code("INVALID_REQUEST", "content is required"));
    }
    let mut attachments = Vec::with_capacity(payload.attachments.len());
    for attachment in payload.attachments {
        let kind = normalize_attachment_kind(&attachment.kind).ok_or_else(|| {
            error_response_with_code("INVALID_REQUEST", "invalid attachment kind")
        })?;
        attachments.push(AttachmentPayload {
            kind: kind.to_string(),
            url: attachment.url,
            name: attachment.name,
            size: attachment.size,
        });
    }

    let now = now_ts();
    let record = MessageRecord {
        message_id: format!("msg_{}", Uuid::new_v4().simple()),
        conversation_id: conversation_id.clone(),
        role: role.to_string(),
        content: content.to_string(),
        attachments,
        tool_calls: Vec::new(),
        created_at: now,
    };
    state
        .storage
        .insert_message(&record)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    state
        .storage
        .touch_conversation(&conversation_id, now, now)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": message_json(&record) })))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let options = GenerateOptions {
        provider: payload.provider,
        model: payload.model,
        tools: payload.tools,
    };
    let outcome = state
        .orchestrator
        .generate(&user.user_id, &conversation_id, &options)
        .await
        .map_err(|err| orchestrator_error_response(&err))?;
    Ok(Json(json!({
        "data": {
            "message": message_json(&outcome.message),
            "usage": outcome.usage,
        }
    })))
}

async fn generate_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<GenerateRequest>,
) -> Result<
    Sse<axum::response::sse::KeepAliveStream<UnboundedReceiverStream<Result<Event, Infallible>>>>,
    Response,
> {
    let user = resolve_user(&state, &headers)?;

    // 流式只支持纯文本生成：启用了工具的请求必须走批量端点。
    let enabled_tools = match &payload.tools {
        Some(tools) => tools.clone(),
        None => state
            .storage
            .get_preferences(&user.user_id)
            .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?
            .unwrap_or_else(|| PreferencesRecord::default_for(&user.user_id))
            .enabled_tools,
    };
    if !enabled_tools.is_empty() {
        return Err(error_response_with_code(
            "INVALID_REQUEST",
            "Streaming is not available with tools enabled; use the batch generate endpoint or pass an empty tools list.",
        ));
    }

    let options = GenerateOptions {
        provider: payload.provider,
        model: payload.model,
        tools: payload.tools,
    };
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let delta_sender = sender.clone();
    let state = state.clone();
    let user_id = user.user_id;
    tokio::spawn(async move {
        let result = state
            .orchestrator
            .generate_streaming(&user_id, &conversation_id, &options, |delta| {
                let event = Event::default().data(json!({ "delta": delta }).to_string());
                let _ = delta_sender.send(Ok(event));
            })
            .await;
        let final_event = match result {
            Ok(outcome) => Event::default().data(
                json!({
                    "done": true,
                    "message_id": outcome.message.message_id,
                    "content": outcome.message.content,
                    "usage": outcome.usage,
                })
                .to_string(),
            ),
            Err(err) => {
                warn!("流式生成失败: {user_id}/{conversation_id}, {err}");
                Event::default()
                    .data(json!({ "error": { "code": err.code(), "message": err.message() } }).to_string())
            }
        };
        let _ = sender.send(Ok(final_event));
    });

    Ok(Sse::new(UnboundedReceiverStream::new(receiver)).keep_alive(KeepAlive::default()))
}
