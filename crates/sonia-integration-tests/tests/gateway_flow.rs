//! Gateway scenarios over the HTTP surface: turn handling, tiered tool
//! approval, and outbox-mediated memory delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt as _;

use sonia_config::GatewaySection;
use sonia_core::CoreResult;
use sonia_events::EventBus;
use sonia_gateway::{
    AppState, ChatRequest, ChatResponse, ConfirmationManager, ModelRouter, OutboxWorker,
    SessionManager, TurnPipeline,
};
use sonia_ledger::MemoryDatabase;
use sonia_policy::{default_safety_rules, ActionVerdict, PolicyEngine};
use sonia_retrieval::{HybridOptions, HybridSearchLayer};
use sonia_state::StateStore;
use sonia_tools::{
    ExecutorPlane, FileExecutor, ParameterType, PlaneConfig, RiskTier, SandboxRoot, ShellExecutor,
    ToolCategory, ToolDefinition, ToolParameter, ToolRegistry,
};

struct EchoRouter;

#[async_trait]
impl ModelRouter for EchoRouter {
    async fn chat(&self, request: &ChatRequest) -> CoreResult<ChatResponse> {
        Ok(ChatResponse {
            text: format!("echo: {}", request.messages.last().unwrap().content),
            tool_calls: Vec::new(),
            model: "stub".to_string(),
            provider: "stub".to_string(),
        })
    }
}

struct Harness {
    app: axum::Router,
    worker: OutboxWorker,
    retrieval: Arc<HybridSearchLayer>,
}

fn harness(sandbox: &std::path::Path) -> Harness {
    let store = StateStore::in_memory().unwrap();
    let ledger = MemoryDatabase::in_memory().unwrap();
    let retrieval = Arc::new(HybridSearchLayer::new(
        ledger.clone(),
        HybridOptions::default(),
    ));
    retrieval.initialize();

    let sessions = Arc::new(SessionManager::new(store.clone(), 3600.0));
    let confirmations = Arc::new(ConfirmationManager::new(store.clone(), 120.0));
    let policy = Arc::new(PolicyEngine::new(
        default_safety_rules(),
        ActionVerdict::Confirm,
    ));

    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(ToolDefinition {
            name: "shell.run".to_string(),
            description: String::new(),
            category: ToolCategory::Shell,
            risk_tier: RiskTier::Tier2,
            parameters: vec![ToolParameter::required("command", ParameterType::String)],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 600,
            timeout_seconds: 5.0,
        })
        .unwrap();
    registry
        .register(ToolDefinition {
            name: "file.read".to_string(),
            description: String::new(),
            category: ToolCategory::File,
            risk_tier: RiskTier::Tier0,
            parameters: vec![ToolParameter::required("path", ParameterType::String)],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 600,
            timeout_seconds: 5.0,
        })
        .unwrap();

    let mut plane = ExecutorPlane::new(
        Arc::clone(&registry),
        Arc::clone(&policy),
        Arc::clone(&confirmations) as Arc<dyn sonia_tools::ApprovalGate>,
        PlaneConfig {
            sandbox: SandboxRoot::new(sandbox),
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(15),
            max_output_bytes: 4096,
            max_file_bytes: 1024 * 1024,
            auto_approve_tier_1: false,
            mode: "conversation".to_string(),
        },
    );
    plane.register_executor("shell.run", Arc::new(ShellExecutor::approved()));
    plane.register_executor("file.read", Arc::new(FileExecutor::new()));
    let plane = Arc::new(plane);

    let events = EventBus::new();
    let pipeline = Arc::new(TurnPipeline::new(
        sessions,
        Arc::clone(&confirmations),
        store.clone(),
        Arc::clone(&retrieval),
        policy,
        Arc::clone(&plane),
        Arc::new(EchoRouter),
        events.clone(),
        GatewaySection::default(),
    ));

    let worker = OutboxWorker::new(
        store,
        ledger.clone(),
        Arc::clone(&retrieval),
        events.clone(),
        Duration::from_millis(10),
    );

    let app = sonia_gateway::router(AppState::new(
        pipeline,
        confirmations,
        ledger,
        Arc::clone(&retrieval),
        plane,
        registry,
        events,
    ));
    Harness {
        app,
        worker,
        retrieval,
    }
}

async fn call(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<JsonValue>,
) -> (StatusCode, JsonValue) {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => {
            builder = builder.header("content-type", "application/json");
            builder.body(axum::body::Body::from(b.to_string())).unwrap()
        }
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
}

#[tokio::test]
async fn turn_flows_through_outbox_into_searchable_memory() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());

    let (status, body) = call(
        &h.app,
        "POST",
        "/v1/turn",
        Some(json!({
            "user_id": "u1",
            "conversation_id": "c1",
            "input_text": "discuss the quasar project",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["latency"]["persist_ms"].is_number());

    // At-least-once delivery lands the transcript in the ledger and the
    // search index
    assert_eq!(h.worker.drain().await, 1);
    let hits = h.retrieval.search("quasar", 5);
    assert!(!hits.is_empty());

    // Idempotent second drain has nothing left to do
    assert_eq!(h.worker.drain().await, 0);
}

#[tokio::test]
async fn tier2_tool_requires_single_use_approval() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());

    // Scenario: POST /execute for a tier-2 tool pauses on approval
    let (_, body) = call(
        &h.app,
        "POST",
        "/execute",
        Some(json!({"tool_name": "shell.run", "args": {"command": "true"}})),
    )
    .await;
    assert_eq!(body["status"], "requires_approval");
    let action_id = body["action_id"].as_str().unwrap().to_string();
    let token = body["approval_token"].as_str().unwrap().to_string();

    // Approving with the token executes the action
    let (status, body) = call(
        &h.app,
        "POST",
        &format!("/actions/{action_id}/approve"),
        Some(json!({"approval_token": token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approval_confirmed");

    // A second approval with the same token is rejected
    let (status, _) = call(
        &h.app,
        "POST",
        &format!("/actions/{action_id}/approve"),
        Some(json!({"approval_token": token})),
    )
    .await;
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn wrong_approval_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let (_, body) = call(
        &h.app,
        "POST",
        "/execute",
        Some(json!({"tool_name": "shell.run", "args": {"command": "true"}})),
    )
    .await;
    let action_id = body["action_id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &h.app,
        "POST",
        &format!("/actions/{action_id}/approve"),
        Some(json!({"approval_token": "conf_bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tier0_tool_executes_without_approval() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "sandboxed").unwrap();
    let h = harness(dir.path());

    let (status, body) = call(
        &h.app,
        "POST",
        "/execute",
        Some(json!({"tool_name": "file.read", "args": {"path": "a.txt"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "executed");
    assert_eq!(body["result"]["content"], "sandboxed");
}

#[tokio::test]
async fn idempotent_turn_not_reexecuted() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let request = json!({
        "user_id": "u1",
        "conversation_id": "c1",
        "input_text": "only once",
        "idempotency_key": "turn-key-1",
    });

    let (_, first) = call(&h.app, "POST", "/v1/turn", Some(request.clone())).await;
    let (_, second) = call(&h.app, "POST", "/v1/turn", Some(request)).await;
    assert_eq!(first["turn_id"], second["turn_id"]);

    // Only one transcript write-back was enqueued
    assert_eq!(h.worker.drain().await, 1);
}
