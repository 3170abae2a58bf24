//! End-to-end tests for the gateway over an in-process trik graph.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use trikgate_gateway::{
    ExecuteOptions, GatewayConfig, GatewayError, GatewayErrorCode, GatewayResult, GraphInput,
    InMemoryConfigStore, InMemorySessionStore, SessionStore, TrikGateway, TrikGraph,
};
use trikgate_store::{MemoryStorageProvider, StorageProvider};

struct ArticlesGraph;

#[async_trait]
impl TrikGraph for ArticlesGraph {
    async fn invoke(&self, input: GraphInput) -> Result<Value, String> {
        match input.action.as_str() {
            "search" => {
                let query = input
                    .input
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(storage) = &input.storage {
                    storage
                        .set("lastQuery", json!(query), None)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Ok(json!({
                    "responseMode": "template",
                    "agentData": {
                        "template": "success",
                        "count": 2,
                        "query": query,
                        "apiKeyPresent": input.config.contains_key("API_KEY"),
                    }
                }))
            }
            "read" => Ok(json!({
                "responseMode": "passthrough",
                "userContent": {
                    "contentType": "text/markdown",
                    "content": "# Article\n\nFull body the agent never sees.",
                    "metadata": {"title": "Article"}
                }
            })),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!({"agentData": {"template": "success"}}))
            }
            "clarify" => Ok(json!({
                "needsClarification": true,
                "clarificationQuestions": [{
                    "questionId": "q1",
                    "questionText": "Which topic?",
                    "questionType": "text"
                }]
            })),
            "bad" => Ok(json!({})),
            "bye" => Ok(json!({
                "agentData": {"template": "success"},
                "endSession": true
            })),
            other => Err(format!("unknown action {other}")),
        }
    }
}

fn template_action(input_schema: Value) -> Value {
    json!({
        "responseMode": "template",
        "inputSchema": input_schema,
        "agentDataSchema": {"type": "object"},
        "responseTemplates": {
            "success": {"text": "Found {{count}} articles for {{query}}"}
        }
    })
}

fn manifest_json() -> Value {
    json!({
        "id": "@demo/articles",
        "name": "Articles",
        "description": "Searches and reads articles",
        "version": "1.0.0",
        "actions": {
            "search": {
                "description": "Search for articles",
                "responseMode": "template",
                "inputSchema": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                },
                "agentDataSchema": {"type": "object"},
                "responseTemplates": {
                    "success": {"text": "Found {{count}} articles for {{query}}"}
                }
            },
            "read": {
                "responseMode": "passthrough",
                "inputSchema": {"type": "object"},
                "userContentSchema": {
                    "type": "object",
                    "properties": {"contentType": {"type": "string"}},
                    "required": ["contentType", "content"]
                }
            },
            "slow": template_action(json!({"type": "object"})),
            "clarify": template_action(json!({"type": "object"})),
            "bad": template_action(json!({"type": "object"})),
            "bye": template_action(json!({"type": "object"}))
        },
        "capabilities": {
            "tools": [],
            "canRequestClarification": true,
            "session": {"enabled": true, "maxDurationMs": 60000, "maxHistoryEntries": 10},
            "storage": {"enabled": true, "maxSizeBytes": 4096}
        },
        "limits": {"maxExecutionTimeMs": 200, "maxLlmCalls": 0, "maxToolCalls": 0},
        "entry": {"module": "dist/index.js", "export": "graph"},
        "config": {
            "required": [{"key": "API_KEY", "description": "Articles API key"}]
        }
    })
}

struct Fixture {
    gateway: TrikGateway,
    sessions: Arc<InMemorySessionStore>,
    storage: Arc<MemoryStorageProvider>,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let trik_dir = dir.path().join("@demo").join("articles");
    std::fs::create_dir_all(&trik_dir).unwrap();
    std::fs::write(trik_dir.join("manifest.json"), manifest_json().to_string()).unwrap();

    let sessions = Arc::new(InMemorySessionStore::new());
    let storage = Arc::new(MemoryStorageProvider::new());
    let config_store = Arc::new(InMemoryConfigStore::new());
    config_store.set_for_trik(
        "@demo/articles",
        BTreeMap::from([("API_KEY".to_string(), "test-key".to_string())]),
    );

    let gateway = TrikGateway::new(GatewayConfig::default())
        .with_session_store(sessions.clone())
        .with_storage_provider(storage.clone())
        .with_config_store(config_store);
    gateway.register_graph("@demo/articles", Arc::new(ArticlesGraph));
    gateway.load_trik(&trik_dir).await.unwrap();

    Fixture { gateway, sessions, storage, _dir: dir }
}

fn error_of(result: &GatewayResult) -> (GatewayErrorCode, &str) {
    match result {
        GatewayResult::Error { code, message } => (*code, message.as_str()),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_template_flow_resolves_text_and_records_history() {
    let fx = fixture().await;

    let outcome = fx
        .gateway
        .execute("@demo/articles", "search", json!({"query": "rust"}), ExecuteOptions::default())
        .await;

    let GatewayResult::Template { agent_data, template_text } = &outcome.result else {
        panic!("expected template result, got {:?}", outcome.result);
    };
    assert_eq!(agent_data["count"], 2);
    assert_eq!(agent_data["apiKeyPresent"], true);
    assert_eq!(template_text.as_deref(), Some("Found 2 articles for rust"));

    let session_id = outcome.session_id.expect("session created");
    let session = fx.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.history.len(), 1);
    assert_eq!(session.history[0].action, "search");
    assert_eq!(session.history[0].input, json!({"query": "rust"}));

    // A second call on the same session appends.
    let outcome = fx
        .gateway
        .execute(
            "@demo/articles",
            "search",
            json!({"query": "tokio"}),
            ExecuteOptions { session_id: Some(session_id.clone()) },
        )
        .await;
    assert_eq!(outcome.session_id.as_deref(), Some(session_id.as_str()));
    let session = fx.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.history.len(), 2);
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_dispatch() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "search", json!({}), ExecuteOptions::default())
        .await;
    let (code, message) = error_of(&outcome.result);
    assert_eq!(code, GatewayErrorCode::InvalidInput);
    assert!(message.starts_with("Invalid input:"), "got: {message}");
    assert_eq!(fx.sessions.active_count(), 0);
}

#[tokio::test]
async fn test_unknown_action_lists_available() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "publish", json!({}), ExecuteOptions::default())
        .await;
    let (code, message) = error_of(&outcome.result);
    assert_eq!(code, GatewayErrorCode::InvalidInput);
    assert!(message.contains("\"publish\" not found"));
    assert!(message.contains("search"));
}

#[tokio::test]
async fn test_passthrough_content_is_hidden_and_delivered_once() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "read", json!({}), ExecuteOptions::default())
        .await;

    let GatewayResult::Passthrough { user_content_ref, content_type, metadata } = &outcome.result
    else {
        panic!("expected passthrough result, got {:?}", outcome.result);
    };
    assert_eq!(content_type, "text/markdown");
    assert_eq!(metadata.as_ref().unwrap()["title"], "Article");

    // The agent-facing result never carries the content itself.
    let serialized = serde_json::to_string(&outcome).unwrap();
    assert!(!serialized.contains("Full body"));

    assert!(fx.gateway.has_content_ref(user_content_ref));
    let (content, receipt) = fx.gateway.deliver_content(user_content_ref).unwrap();
    assert!(content.content.contains("Full body"));
    assert!(receipt.delivered);

    assert!(fx.gateway.deliver_content(user_content_ref).is_none());
    assert!(!fx.gateway.has_content_ref(user_content_ref));
}

#[tokio::test]
async fn test_execution_timeout_is_reported() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "slow", json!({}), ExecuteOptions::default())
        .await;
    let (code, message) = error_of(&outcome.result);
    assert_eq!(code, GatewayErrorCode::Timeout);
    assert_eq!(message, "Execution timed out after 200ms");
}

#[tokio::test]
async fn test_clarification_short_circuits_without_history() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "clarify", json!({}), ExecuteOptions::default())
        .await;

    let GatewayResult::Clarification { session_id, questions } = &outcome.result else {
        panic!("expected clarification, got {:?}", outcome.result);
    };
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].question_id, "q1");

    // The session survives so the follow-up lands in context, but nothing
    // was committed to history.
    let session = fx.sessions.get(session_id).await.unwrap();
    assert!(session.history.is_empty());
}

#[tokio::test]
async fn test_invalid_output_keeps_session_clean() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .execute("@demo/articles", "bad", json!({}), ExecuteOptions::default())
        .await;
    let (code, message) = error_of(&outcome.result);
    assert_eq!(code, GatewayErrorCode::InvalidOutput);
    assert_eq!(message, "Template mode requires agentData");

    let session_id = outcome.session_id.expect("session still reported");
    let session = fx.sessions.get(&session_id).await.unwrap();
    assert!(session.history.is_empty());
}

#[tokio::test]
async fn test_end_session_deletes_the_session() {
    let fx = fixture().await;
    let first = fx
        .gateway
        .execute("@demo/articles", "search", json!({"query": "rust"}), ExecuteOptions::default())
        .await;
    let session_id = first.session_id.unwrap();

    let outcome = fx
        .gateway
        .execute(
            "@demo/articles",
            "bye",
            json!({}),
            ExecuteOptions { session_id: Some(session_id.clone()) },
        )
        .await;
    assert!(matches!(outcome.result, GatewayResult::Template { .. }));
    assert!(outcome.session_id.is_none());
    assert!(fx.sessions.get(&session_id).await.is_none());
}

#[tokio::test]
async fn test_storage_writes_persist_across_calls() {
    let fx = fixture().await;
    fx.gateway
        .execute("@demo/articles", "search", json!({"query": "rust"}), ExecuteOptions::default())
        .await;

    let context = fx.storage.for_trik("@demo/articles", None).await.unwrap();
    assert_eq!(context.get("lastQuery").await.unwrap(), Some(json!("rust")));
}

#[tokio::test]
async fn test_allowlist_blocks_unlisted_triks() {
    let dir = tempfile::tempdir().unwrap();
    let trik_dir = dir.path().join("@demo").join("articles");
    std::fs::create_dir_all(&trik_dir).unwrap();
    std::fs::write(trik_dir.join("manifest.json"), manifest_json().to_string()).unwrap();

    let gateway = TrikGateway::new(GatewayConfig {
        allowed_triks: Some(vec!["@other/trik".to_string()]),
        ..GatewayConfig::default()
    })
    .with_config_store(Arc::new(InMemoryConfigStore::new()));

    let err = gateway.load_trik(&trik_dir).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotAllowed(id) if id == "@demo/articles"));
    assert!(gateway.available_triks().is_empty());
}

#[tokio::test]
async fn test_missing_required_config_blocks_loading() {
    let dir = tempfile::tempdir().unwrap();
    let trik_dir = dir.path().join("@demo").join("articles");
    std::fs::create_dir_all(&trik_dir).unwrap();
    std::fs::write(trik_dir.join("manifest.json"), manifest_json().to_string()).unwrap();

    // Empty config store, manifest requires API_KEY.
    let gateway = TrikGateway::new(GatewayConfig::default())
        .with_config_store(Arc::new(InMemoryConfigStore::new()));

    let err = gateway.load_trik(&trik_dir).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::MissingConfig { ref keys, .. } if keys == &["API_KEY".to_string()]
    ));
}

#[tokio::test]
async fn test_directory_loading_handles_scoped_layout() {
    let fx = fixture().await;
    let dir = tempfile::tempdir().unwrap();

    let scoped = dir.path().join("@demo").join("articles");
    std::fs::create_dir_all(&scoped).unwrap();
    std::fs::write(scoped.join("manifest.json"), manifest_json().to_string()).unwrap();

    // A broken sibling is skipped, not fatal.
    let broken = dir.path().join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("manifest.json"), "{ nope").unwrap();

    let loaded = fx.gateway.load_triks_from_directory(dir.path()).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "@demo/articles");
}

#[tokio::test]
async fn test_tool_definitions_cover_all_actions() {
    let fx = fixture().await;
    let tools = fx.gateway.get_tool_definitions();
    assert_eq!(tools.len(), 6);
    let search = tools.iter().find(|t| t.name == "@demo/articles:search").unwrap();
    assert_eq!(search.description, "Search for articles");

    let infos = fx.gateway.list_triks();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].session_enabled);
    assert_eq!(infos[0].tools.len(), 6);
}
