// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod auth;
pub mod chat;
pub mod errors;
pub mod providers;
pub mod settings;
pub mod user_context;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(auth::router())
        .merge(chat::router())
        .merge(providers::router())
        .merge(settings::router())
}
