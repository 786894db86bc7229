//! HTTP tests: the real router on an ephemeral port, driven with `reqwest`.

mod common;

use common::{harness, policy_passages, FakeGenerator, Tail};
use rag_trainer::client::{Ending, TrainerClient};
use rag_trainer::events::EventParser;
use rag_trainer::orchestrator::{Orchestrator, Settings};
use rag_trainer::server::{router, AppState};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Serve `orchestrator` on 127.0.0.1 and return the base URL.
async fn spawn_server(orchestrator: Orchestrator) -> String {
    let app = router(AppState::new(orchestrator, 8), "*").unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn answering(fragments: &[&str]) -> common::Harness {
    harness(
        None,
        policy_passages(),
        FakeGenerator::new(fragments, Tail::End),
        Settings::default(),
    )
}

#[tokio::test]
async fn test_health() {
    let base = spawn_server(answering(&["ok"]).orchestrator).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_stream_wire_format() {
    let base = spawn_server(answering(&["Hello", " world"]).orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/trainer/respond/stream", base))
        .json(&json!({ "conversationId": "conv-wire", "question": "Say hello?" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = response.bytes().await.unwrap();
    let mut parser = EventParser::new();
    let mut events = parser.push(&bytes);
    events.extend(parser.finish());

    let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["meta", "token", "token", "done"]);

    let meta = events[0].data.clone().into_json();
    assert_eq!(meta["conversationId"], "conv-wire");
    assert_eq!(meta["sources"][0]["ref"], "#1");
    assert_eq!(meta["sources"][1]["page_num"], Value::Null);
    assert_eq!(events[1].data.clone().into_json(), json!({ "token": "Hello" }));
    assert_eq!(events[2].data.clone().into_json(), json!({ "token": " world" }));
    assert_eq!(events[3].data.clone().into_json(), json!({ "ok": true }));
}

#[tokio::test]
async fn test_stream_validation_is_json_400() {
    let h = answering(&["ok"]);
    let ledger = h.orchestrator.ledger().clone();
    let base = spawn_server(h.orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/trainer/respond/stream", base))
        .json(&json!({ "conversationId": "abc", "question": "hi", "topK": 50 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
    let fields = body["error"]["fields"].as_object().unwrap();
    assert!(fields.contains_key("question"));
    assert!(fields.contains_key("topK"));
    assert!(fields.contains_key("conversationId"));

    // Rejected before any side effect.
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_malformed_json_rejected() {
    let base = spawn_server(answering(&["ok"]).orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/rag/answer", base))
        .header("content-type", "application/json")
        .body("{\"question\": ")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
    assert!(body["error"]["fields"]["body"].is_array());
}

#[tokio::test]
async fn test_answer_endpoint() {
    let base = spawn_server(answering(&["Within 30 days [#1]."]).orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/rag/answer", base))
        .json(&json!({ "question": "What is the return policy?", "course_id": "retail-101" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["answer"], "Within 30 days [#1].");
    assert_eq!(body["citations"][0]["ref"], "#1");
    assert_eq!(body["citations"][0]["doc_id"], "policy-1");
    assert_eq!(body["citations"][1]["course_id"], "retail-101");
}

#[tokio::test]
async fn test_respond_endpoint_rejects_unknown_persona() {
    let base = spawn_server(answering(&["ok"]).orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/trainer/respond", base))
        .json(&json!({ "question": "How do refunds work?", "persona": "pirate" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]["fields"]["persona"].is_array());
}

#[tokio::test]
async fn test_respond_endpoint() {
    let base = spawn_server(answering(&["Refunds take five days."]).orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/trainer/respond", base))
        .json(&json!({ "question": "How do refunds work?", "persona": "coach" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["speech"], "Refunds take five days.");
    assert_eq!(body["sources"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_upstream_failure_is_500() {
    let h = harness(
        Some("401 Unauthorized"),
        policy_passages(),
        FakeGenerator::new(&["never"], Tail::End),
        Settings::default(),
    );
    let base = spawn_server(h.orchestrator).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/rag/answer", base))
        .json(&json!({ "question": "What is the return policy?" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream_error");
    assert_eq!(body["error"]["message"], "embedding failed: 401 Unauthorized");
    assert!(body["error"].get("fields").is_none());
}

#[tokio::test]
async fn test_client_conversation_round_trip() {
    let h = answering(&["Thirty ", "days."]);
    let ledger = h.orchestrator.ledger().clone();
    let base = spawn_server(h.orchestrator).await;
    let client = TrainerClient::new(&base);

    let mut seen = Vec::new();
    let first = client
        .chat(
            "How long do returns take?",
            None,
            Some(2),
            CancellationToken::new(),
            |event| seen.push(event.name.clone()),
        )
        .await
        .unwrap();

    assert_eq!(first.ending, Ending::Done);
    assert_eq!(first.answer, "Thirty days.");
    assert_eq!(first.sources.len(), 2);
    assert_eq!(seen, vec!["meta", "token", "token", "done"]);

    let id = first.conversation_id.unwrap();
    let second = client
        .chat("And for sale items?", Some(&id), None, CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(second.ending, Ending::Done);
    assert_eq!(second.conversation_id.as_deref(), Some(id.as_str()));
    assert_eq!(ledger.turns(&id).len(), 4);
}
