// 注册 / 登录 / 当前用户。
use crate::api::errors::error_response_with_code;
use crate::api::user_context::resolve_user;
use crate::state::AppState;
use crate::user_store::UserStore;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/polychat/auth/register", post(register))
        .route("/polychat/auth/login", post(login))
        .route("/polychat/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    #[serde(default)]
    email: Option<String>,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let username = payload.username.trim();
    let password = payload.password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(error_response_with_code(
            "INVALID_REQUEST",
            "username and password are required",
        ));
    }
    state
        .user_store
        .create_user(username, payload.email, password)
        .map_err(|err| error_response_with_code("INVALID_REQUEST", err.to_string()))?;
    let session = state
        .user_store
        .login(username, password)
        .map_err(|err| error_response_with_code("AUTH_REQUIRED", err.to_string()))?;
    Ok(Json(auth_response(&session)))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let username = payload.username.trim();
    let password = payload.password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(error_response_with_code(
            "INVALID_REQUEST",
            "username and password are required",
        ));
    }
    let session = state
        .user_store
        .login(username, password)
        .map_err(|err| error_response_with_code("AUTH_REQUIRED", err.to_string()))?;
    Ok(Json(auth_response(&session)))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    Ok(Json(json!({ "data": UserStore::to_profile(&user) })))
}

fn auth_response(session: &crate::user_store::UserSession) -> serde_json::Value {
    json!({
        "data": {
            "access_token": session.token.token,
            "expires_at": session.token.expires_at,
            "user": UserStore::to_profile(&session.user),
        }
    })
}
