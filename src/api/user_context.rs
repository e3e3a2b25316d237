// 从 Bearer 令牌解析调用方，失败统一 401 AUTH_REQUIRED。
use crate::api::errors::error_response_with_code;
use crate::auth::extract_bearer_token;
use crate::state::AppState;
use crate::storage::UserAccountRecord;
use axum::http::HeaderMap;
use axum::response::Response;

pub fn resolve_user(state: &AppState, headers: &HeaderMap) -> Result<UserAccountRecord, Response> {
    let token = extract_bearer_token(headers).ok_or_else(auth_required)?;
    match state.user_store.authenticate_token(&token) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(auth_required()),
        Err(err) => Err(error_response_with_code("INTERNAL_ERROR", err.to_string())),
    }
}

fn auth_required() -> Response {
    error_response_with_code("AUTH_REQUIRED", "Authentication required")
}
