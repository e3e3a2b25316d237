use polychat_server::storage::{ConversationRecord, MessageRecord, SqliteStorage, StorageBackend};
use polychat_server::user_store::UserStore;
use std::sync::Arc;

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn temp_storage(tag: &str) -> (std::path::PathBuf, Arc<SqliteStorage>) {
    let db_path = std::env::temp_dir().join(format!(
        "polychat_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage = Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    (db_path, storage)
}

#[test]
fn account_and_conversation_lifecycle() {
    let (db_path, storage) = temp_storage("chat_flow");
    let store = UserStore::new(storage.clone());

    let user = store
        .create_user("alice", Some("alice@example.com".to_string()), "secret")
        .unwrap();
    let session = store.login("alice", "secret").unwrap();
    let authenticated = store
        .authenticate_token(&session.token.token)
        .unwrap()
        .unwrap();
    assert_eq!(authenticated.user_id, user.user_id);

    let now = now_ts();
    let conversation = ConversationRecord {
        conversation_id: "conv_flow".to_string(),
        user_id: user.user_id.clone(),
        title: "New Chat".to_string(),
        created_at: now,
        updated_at: now,
        last_message_at: now,
    };
    storage.upsert_conversation(&conversation).unwrap();

    for (index, content) in ["hello", "hi there", "how are you"].iter().enumerate() {
        storage
            .insert_message(&MessageRecord {
                message_id: format!("msg_{index}"),
                conversation_id: conversation.conversation_id.clone(),
                role: if index % 2 == 0 { "user" } else { "assistant" }.to_string(),
                content: content.to_string(),
                attachments: Vec::new(),
                tool_calls: Vec::new(),
                created_at: now,
            })
            .unwrap();
    }
    let messages = storage.list_messages(&conversation.conversation_id).unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[2].content, "how are you");

    storage
        .update_conversation_title(
            &user.user_id,
            &conversation.conversation_id,
            "Greetings",
            now_ts(),
        )
        .unwrap();
    let fetched = storage
        .get_conversation(&user.user_id, &conversation.conversation_id)
        .unwrap()
        .unwrap();
    assert_eq!(fetched.title, "Greetings");

    // 他人看不到也删不掉。
    assert!(storage
        .get_conversation("mallory", &conversation.conversation_id)
        .unwrap()
        .is_none());
    assert_eq!(
        storage
            .delete_conversation("mallory", &conversation.conversation_id)
            .unwrap(),
        0
    );

    assert_eq!(
        storage
            .delete_conversation(&user.user_id, &conversation.conversation_id)
            .unwrap(),
        1
    );
    assert!(storage
        .list_messages(&conversation.conversation_id)
        .unwrap()
        .is_empty());

    let _ = std::fs::remove_file(db_path);
}
