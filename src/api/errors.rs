// 统一的 JSON 错误响应：带 trace_id 与错误码头，错误码决定 HTTP 状态。
use crate::orchestrator::OrchestratorError;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

pub(crate) fn status_for_error_code(code: &str) -> StatusCode {
    let normalized = code.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "AUTH_REQUIRED" | "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "QUOTA_EXCEEDED" | "RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
        "UPSTREAM_ERROR" => StatusCode::BAD_GATEWAY,
        "INTERNAL_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        // PROVIDER_NOT_CONFIGURED / INVALID_REQUEST 及未知码一律按 400 处理。
        _ => StatusCode::BAD_REQUEST,
    }
}

fn hint_for_error_code(code: &str) -> &'static str {
    match code.trim().to_ascii_uppercase().as_str() {
        "AUTH_REQUIRED" | "UNAUTHORIZED" => "Provide a valid bearer token.",
        "NOT_FOUND" => "Verify the resource id and its owner.",
        "PROVIDER_NOT_CONFIGURED" => "Add an API key for this provider in settings.",
        "QUOTA_EXCEEDED" => "Wait for the monthly reset, upgrade the plan, or add your own keys.",
        "UPSTREAM_ERROR" => "The provider failed; retry later or switch providers.",
        "INVALID_REQUEST" => "Check required fields and payload schema before retrying.",
        "INTERNAL_ERROR" => "Retry later or contact support with the trace_id.",
        _ => "Inspect request and try again.",
    }
}

pub fn error_response_with_code(code: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    let status = status_for_error_code(code);
    let trace_id = format!("err_{}", Uuid::new_v4().simple());
    let payload: Value = json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "status": status.as_u16(),
            "hint": hint_for_error_code(code),
            "trace_id": trace_id,
            "timestamp": now_unix_seconds(),
        },
        "detail": { "message": message },
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

pub fn orchestrator_error_response(error: &OrchestratorError) -> Response {
    error_response_with_code(error.code(), error.message())
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_carries_unified_fields() {
        let response = error_response_with_code("QUOTA_EXCEEDED", "message limit reached");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let trace_id = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(trace_id.starts_with("err_"));
        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(code, "QUOTA_EXCEEDED");

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let payload: Value = serde_json::from_slice(&body).expect("parse response json");
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("QUOTA_EXCEEDED"));
        assert_eq!(payload["error"]["status"], json!(429));
        assert_eq!(payload["error"]["trace_id"], json!(trace_id));
        assert_eq!(payload["detail"]["message"], json!("message limit reached"));
    }

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(
            status_for_error_code("AUTH_REQUIRED"),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for_error_code("NOT_FOUND"), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for_error_code("PROVIDER_NOT_CONFIGURED"),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_error_code("QUOTA_EXCEEDED"),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for_error_code("UPSTREAM_ERROR"),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for_error_code("INTERNAL_ERROR"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
