// Provider 可用性与模型目录。
use crate::api::errors::error_response_with_code;
use crate::api::user_context::resolve_user;
use crate::credentials::has_credential;
use crate::providers::{catalog, Provider};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/polychat/providers", get(list_providers))
        .route("/polychat/providers/{provider}/models", get(provider_models))
}

/// 逐个 provider 检查调用方是否有可用凭证（用户密钥或内置密钥）。
async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut data = Vec::with_capacity(catalog().len());
    for info in catalog() {
        let available = has_credential(&state.storage, &state.config, &user.user_id, info.provider)
            .map_err(|err| error_response_with_code("INTERNAL_ERROR", err.to_string()))?;
        data.push(json!({
            "provider": info.provider.as_str(),
            "display_name": info.display_name,
            "default_model": info.provider.default_model(),
            "available": available,
        }));
    }
    Ok(Json(json!({ "data": data })))
}

async fn provider_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<Value>, Response> {
    resolve_user(&state, &headers)?;
    let provider = Provider::from_str(&provider)
        .map_err(|_| error_response_with_code("INVALID_REQUEST", format!("Unknown provider: {provider}")))?;
    let info = provider.info();
    Ok(Json(json!({
        "data": {
            "provider": provider.as_str(),
            "display_name": info.display_name,
            "models": info.models,
        }
    })))
}
