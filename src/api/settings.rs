// 用户设置：偏好、收藏模型、API 密钥与用量。
use crate::api::errors::error_response_with_code;
use crate::api::user_context::resolve_user;
use crate::providers::Provider;
use crate::schemas::toggle_favorite;
use crate::state::AppState;
use crate::storage::{ApiKeyRecord, PreferencesRecord};
use crate::tools::ALL_TOOL_NAMES;
use crate::usage::PLAN_LIMITS;
use crate::user_store::now_ts;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, routing::post, routing::put, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/polychat/settings/preferences",
            get(get_preferences).put(put_preferences),
        )
        .route(
            "/polychat/settings/preferences/favorites/toggle",
            post(toggle_favorite_model),
        )
        .route("/polychat/settings/keys", get(list_keys))
        .route(
            "/polychat/settings/keys/{provider}",
            put(put_key).delete(delete_key),
        )
        .route("/polychat/usage", get(get_usage))
        .route("/polychat/usage/limits", get(get_limits))
        .route("/polychat/usage/upgrade", post(upgrade_plan))
}

#[derive(Debug, Deserialize)]
struct PreferencesRequest {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    enabled_tools: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FavoriteToggleRequest {
    provider: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct PutKeyRequest {
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UpgradeRequest {
    plan: String,
}

fn preferences_json(record: &PreferencesRecord) -> Value {
    json!({
        "provider": record.provider,
        "model": record.model,
        "temperature": record.temperature,
        "max_tokens": record.max_tokens,
        "enabled_tools": record.enabled_tools,
        "favorite_models": record.favorite_models,
    })
}

fn load_preferences(state: &AppState, user_id: &str) -> Result<PreferencesRecord, Response> {
    state
        .storage
        .get_preferences(user_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))
        .map(|record| record.unwrap_or_else(|| PreferencesRecord::default_for(user_id)))
}

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let record = load_preferences(&state, &user.user_id)?;
    Ok(Json(json!({ "data": preferences_json(&record) })))
}

async fn put_preferences(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PreferencesRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut record = load_preferences(&state, &user.user_id)?;

    if let Some(provider) = payload.provider {
        Provider::from_str(&provider).map_err(|_| {
            error_response_with_code("INVALID_REQUEST", format!("Unknown provider: {provider}"))
        })?;
        record.provider = provider.trim().to_lowercase();
    }
    if let Some(model) = payload.model {
        let model = model.trim().to_string();
        if model.is_empty() {
            return Err(error_response_with_code("INVALID_REQUEST", "model must not be empty"));
        }
        record.model = model;
    }
    if let Some(temperature) = payload.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(error_response_with_code(
                "INVALID_REQUEST",
                "temperature must be between 0 and 2",
            ));
        }
        record.temperature = temperature;
    }
    if let Some(max_tokens) = payload.max_tokens {
        if max_tokens == 0 {
            return Err(error_response_with_code(
                "INVALID_REQUEST",
                "max_tokens must be positive",
            ));
        }
        record.max_tokens = max_tokens;
    }
    if let Some(enabled_tools) = payload.enabled_tools {
        for name in &enabled_tools {
            if !ALL_TOOL_NAMES.contains(&name.as_str()) {
                return Err(error_response_with_code(
                    "INVALID_REQUEST",
                    format!("Unknown tool: {name}"),
                ));
            }
        }
        record.enabled_tools = enabled_tools;
    }

    state
        .storage
        .upsert_preferences(&record)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": preferences_json(&record) })))
}

async fn toggle_favorite_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<FavoriteToggleRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let provider = payload.provider.trim().to_lowercase();
    Provider::from_str(&provider).map_err(|_| {
        error_response_with_code("INVALID_REQUEST", format!("Unknown provider: {provider}"))
    })?;
    let model = payload.model.trim();
    if model.is_empty() {
        return Err(error_response_with_code("INVALID_REQUEST", "model must not be empty"));
    }

    let mut record = load_preferences(&state, &user.user_id)?;
    toggle_favorite(&mut record.favorite_models, &provider, model);
    state
        .storage
        .upsert_preferences(&record)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": { "favorite_models": record.favorite_models } })))
}

/// 密钥列表从不回传密钥本体，只回传持有标记。
async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let records = state
        .storage
        .list_api_keys(&user.user_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    let data: Vec<Value> = records
        .iter()
        .map(|record| {
            json!({
                "provider": record.provider,
                "has_key": true,
                "is_active": record.is_active,
                "updated_at": record.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn put_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(payload): Json<PutKeyRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let provider = normalize_key_provider(&provider)?;
    let api_key = payload.api_key.trim();
    if api_key.is_empty() {
        return Err(error_response_with_code("INVALID_REQUEST", "api_key must not be empty"));
    }
    state
        .storage
        .upsert_api_key(&ApiKeyRecord {
            user_id: user.user_id,
            provider: provider.clone(),
            api_key: api_key.to_string(),
            is_active: true,
            updated_at: now_ts(),
        })
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": { "provider": provider, "has_key": true } })))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let provider = normalize_key_provider(&provider)?;
    let deleted = state
        .storage
        .delete_api_key(&user.user_id, &provider)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    if deleted == 0 {
        return Err(error_response_with_code("NOT_FOUND", "API key not found"));
    }
    Ok(Json(json!({ "data": { "deleted": deleted } })))
}

/// 密钥槽位：九个模型 provider 加两个工具 provider。
fn normalize_key_provider(raw: &str) -> Result<String, Response> {
    let normalized = raw.trim().to_lowercase();
    let valid = Provider::from_str(&normalized).is_ok()
        || normalized == "tavily"
        || normalized == "openweather";
    if !valid {
        return Err(error_response_with_code(
            "INVALID_REQUEST",
            format!("Unknown provider: {raw}"),
        ));
    }
    Ok(normalized)
}

async fn get_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let summary = state
        .usage
        .summary(&user.user_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": summary })))
}

async fn get_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    resolve_user(&state, &headers)?;
    let data: Vec<Value> = PLAN_LIMITS
        .iter()
        .map(|limits| {
            json!({
                "plan": limits.plan,
                "messages_per_month": limits.messages_per_month,
                "searches_per_month": limits.searches_per_month,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn upgrade_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UpgradeRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    state
        .usage
        .upgrade_plan(&user.user_id, &payload.plan)
        .map_err(|err| error_response_with_code("INVALID_REQUEST", err.to_string()))?;
    let summary = state
        .usage
        .summary(&user.user_id)
        .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
    Ok(Json(json!({ "data": summary })))
}
