//! HTTP tests: a real listener on a free port, driven with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use maint_assist::broker::memory::InMemoryBroker;
use maint_assist::config::Config;
use maint_assist::context::PipelineContext;
use maint_assist::server::run_server;
use maint_assist_core::embedding::Embedder;
use maint_assist_core::kv::InMemoryKv;
use maint_assist_core::llm::{ChatMessage, LanguageModel};
use maint_assist_core::store::memory::InMemoryKnowledgeStore;
use maint_assist_core::AdapterError;

struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    fn model_name(&self) -> &str {
        "unit"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AdapterError> {
        Ok(vec![1.0, 0.0])
    }
}

struct CannedModel;

#[async_trait]
impl LanguageModel for CannedModel {
    fn model_name(&self) -> &str {
        "canned"
    }
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, AdapterError> {
        Ok("Check the hydraulic seals.".to_string())
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not start within 5 seconds");
}

struct TestServer {
    base: String,
    broker: InMemoryBroker,
    store: Arc<InMemoryKnowledgeStore>,
}

/// Start the gateway with `workers` in-process consumers.
async fn start_server(workers: usize, reply_timeout_secs: u64) -> TestServer {
    let port = find_free_port();
    let mut config = Config::default();
    config.server.bind = format!("127.0.0.1:{}", port);
    config.broker.backend = "memory".into();
    config.cache.backend = "memory".into();
    config.gateway.reply_timeout_secs = reply_timeout_secs;
    config.gateway.request_budget_secs = reply_timeout_secs + 1;

    let broker = InMemoryBroker::new(Duration::from_secs(60));
    let store = Arc::new(InMemoryKnowledgeStore::new());
    let ctx = PipelineContext::new(
        config,
        store.clone(),
        Arc::new(InMemoryKv::new()),
        Arc::new(UnitEmbedder),
        Arc::new(CannedModel),
        Arc::new(broker.clone()),
    );

    tokio::spawn(async move {
        let _ = run_server(ctx, workers).await;
    });
    wait_for_server(port).await;

    TestServer {
        base: format!("http://127.0.0.1:{}", port),
        broker,
        store,
    }
}

async fn post_json(url: &str, body: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(url)
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let value = resp.json().await.unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_submit_query_returns_reply() {
    let server = start_server(1, 3).await;

    let (status, body) = post_json(
        &format!("{}/submit_query", server.base),
        r#"{"query": "press 3 is leaking oil", "user_id": "u1"}"#,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["response"], json!("Check the hydraulic seals."));
    assert_eq!(body["context"], json!([]));
    assert_eq!(server.broker.published_jobs(), 1);
}

#[tokio::test]
async fn test_submit_query_rejects_bad_input() {
    let server = start_server(1, 3).await;
    let url = format!("{}/submit_query", server.base);

    for body in [
        "not json",
        r#"{"user_id": "u1"}"#,
        r#"{"query": ""}"#,
        r#"{"query": "   "}"#,
    ] {
        let (status, value) = post_json(&url, body).await;
        assert_eq!(status, 400, "body {:?}", body);
        assert_eq!(value["error"]["code"], json!("bad_request"));
    }

    let too_long = json!({ "query": "x".repeat(5000) }).to_string();
    let (status, _) = post_json(&url, &too_long).await;
    assert_eq!(status, 400);

    assert_eq!(server.broker.published_jobs(), 0);
}

#[tokio::test]
async fn test_submit_query_broker_down_is_503() {
    let server = start_server(0, 3).await;
    server.broker.set_available(false);

    let (status, body) = post_json(
        &format!("{}/submit_query", server.base),
        r#"{"query": "anything"}"#,
    )
    .await;

    assert_eq!(status, 503);
    assert!(!body["response"].as_str().unwrap().is_empty());
    assert_eq!(body["context"], json!([]));
}

#[tokio::test]
async fn test_submit_query_without_workers_is_504() {
    let server = start_server(0, 1).await;

    let (status, body) = post_json(
        &format!("{}/submit_query", server.base),
        r#"{"query": "anything"}"#,
    )
    .await;

    assert_eq!(status, 504);
    assert_eq!(body["context"], json!([]));
}

#[tokio::test]
async fn test_health_reports_each_dependency() {
    let server = start_server(0, 1).await;

    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["service"], json!("maint-assist"));
    assert_eq!(body["cache"], json!(true));
    assert_eq!(body["knowledge_store"], json!(true));
    assert_eq!(body["embedding_model"], json!(true));
    assert_eq!(body["language_model"], json!(true));
    assert_eq!(body["broker"], json!(true));

    server.broker.set_available(false);
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["broker"], json!(false));
}

#[tokio::test]
async fn test_intervention_hook_indexes_in_background() {
    let server = start_server(0, 1).await;
    let url = format!("{}/hooks/interventions", server.base);

    let event = json!({
        "event": "created",
        "intervention": {
            "reference": "INT-ABC123",
            "pk": 7,
            "subject": "Hydraulic leak",
            "criticality": "high",
            "intervention_date": "2024-03-05T14:30:00",
            "created_at": "2024-03-04T09:00:00"
        }
    });
    let (status, body) = post_json(&url, &event.to_string()).await;
    assert_eq!(status, 202);
    assert_eq!(body["status"], json!("accepted"));

    let mut indexed = None;
    for _ in 0..50 {
        indexed = server.store.get("intervention_INT-ABC123_7");
        if indexed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let doc = indexed.expect("intervention was not indexed");
    assert!(doc.text.starts_with("INTERVENTION INT-ABC123"));

    let (status, _) = post_json(
        &url,
        r#"{"event": "deleted", "reference": "INT-ABC123", "pk": 7}"#,
    )
    .await;
    assert_eq!(status, 202);
    for _ in 0..50 {
        if server.store.get("intervention_INT-ABC123_7").is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("intervention was not deleted");
}

#[tokio::test]
async fn test_intervention_hook_rejects_unknown_event() {
    let server = start_server(0, 1).await;

    let (status, value) = post_json(
        &format!("{}/hooks/interventions", server.base),
        r#"{"event": "archived", "reference": "INT-1", "pk": 1}"#,
    )
    .await;

    assert_eq!(status, 400);
    assert_eq!(value["error"]["code"], json!("bad_request"));
}
