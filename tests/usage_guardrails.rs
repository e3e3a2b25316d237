use polychat_server::config::Config;
use polychat_server::orchestrator::{GenerateOptions, Orchestrator};
use polychat_server::storage::{ConversationRecord, SqliteStorage, StorageBackend, UsageRecord};
use polychat_server::usage::{limits_for_plan, UsageLedger};
use std::sync::Arc;

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn temp_storage(tag: &str) -> (std::path::PathBuf, Arc<dyn StorageBackend>) {
    let db_path = std::env::temp_dir().join(format!(
        "polychat_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage: Arc<dyn StorageBackend> =
        Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    (db_path, storage)
}

fn seed_conversation(storage: &Arc<dyn StorageBackend>, user_id: &str, conversation_id: &str) {
    let now = now_ts();
    storage
        .upsert_conversation(&ConversationRecord {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            title: "test".to_string(),
            created_at: now,
            updated_at: now,
            last_message_at: now,
        })
        .unwrap();
}

#[tokio::test]
async fn generation_fails_naming_the_unconfigured_provider() {
    let (db_path, storage) = temp_storage("provider_naming");
    std::env::remove_var("MISTRAL_API_KEY");
    seed_conversation(&storage, "alice", "conv_1");
    let orchestrator = Orchestrator::new(Config::default(), storage, reqwest::Client::new());

    let err = orchestrator
        .generate(
            "alice",
            "conv_1",
            &GenerateOptions {
                provider: Some("mistral".to_string()),
                ..GenerateOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_NOT_CONFIGURED");
    assert!(err.message().contains("mistral"));

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn builtin_quota_rejects_before_any_persistence() {
    let (db_path, storage) = temp_storage("quota_gate");
    seed_conversation(&storage, "alice", "conv_1");

    let ledger = UsageLedger::new(storage.clone());
    let record = ledger.ensure_record("alice").unwrap();
    let limits = limits_for_plan(&record.plan);
    storage
        .upsert_usage(&UsageRecord {
            messages_used: limits.messages_per_month,
            ..record
        })
        .unwrap();

    let mut config = Config::default();
    config.credentials.openai = Some("builtin-key".to_string());
    let orchestrator = Orchestrator::new(config, storage.clone(), reqwest::Client::new());

    let err = orchestrator
        .generate("alice", "conv_1", &GenerateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert!(storage.list_messages("conv_1").unwrap().is_empty());
    let after = ledger.ensure_record("alice").unwrap();
    assert_eq!(after.messages_used, limits.messages_per_month);

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn monthly_rollover_resets_counters_once() {
    let (db_path, storage) = temp_storage("rollover");
    let ledger = UsageLedger::new(storage.clone());

    storage
        .upsert_usage(&UsageRecord {
            user_id: "alice".to_string(),
            plan: "pro".to_string(),
            messages_used: 120,
            searches_used: 30,
            reset_date: now_ts() - 60.0,
        })
        .unwrap();

    let rolled = ledger.ensure_record("alice").unwrap();
    assert_eq!(rolled.plan, "pro");
    assert_eq!(rolled.messages_used, 0);
    assert_eq!(rolled.searches_used, 0);
    assert!(rolled.reset_date > now_ts());

    // 同一周期内再取不再滚动。
    ledger.increment_messages("alice", 1).unwrap();
    let again = ledger.ensure_record("alice").unwrap();
    assert_eq!(again.messages_used, 1);
    assert_eq!(again.reset_date, rolled.reset_date);

    let _ = std::fs::remove_file(db_path);
}
