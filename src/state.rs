// 全局状态：配置、存储与各服务的装配点。
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::storage::{build_storage, StorageBackend};
use crate::usage::UsageLedger;
use crate::user_store::UserStore;
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub user_store: Arc<UserStore>,
    pub usage: Arc<UsageLedger>,
    pub orchestrator: Arc<Orchestrator>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        let http = reqwest::Client::new();
        let user_store = Arc::new(UserStore::new(storage.clone()));
        let usage = Arc::new(UsageLedger::new(storage.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            storage.clone(),
            http.clone(),
        ));
        Ok(Self {
            config,
            storage,
            user_store,
            usage,
            orchestrator,
            http,
        })
    }
}
