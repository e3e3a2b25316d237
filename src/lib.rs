// polychat-server：多 Provider AI 聊天后端。
pub mod api;
pub mod auth;
pub mod calc;
pub mod config;
pub mod credentials;
pub mod llm;
pub mod orchestrator;
pub mod providers;
pub mod schemas;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod tools;
pub mod usage;
pub mod user_store;
