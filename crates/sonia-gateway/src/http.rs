//! Gateway HTTP surface.
//!
//! Hosts the turn endpoint, the UI WebSocket stream, the memory-engine
//! façade (legacy and typed v3 routes), and the tool-executor façade
//! (`/execute`, `/actions/{id}/approve`, `/tools`).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sonia_core::{ConfirmationId, MemoryId, SessionId, Timestamp};
use sonia_events::EventBus;
use sonia_ledger::{BudgetQuery, LedgerError, MemoryDatabase, MemorySubtype};
use sonia_retrieval::HybridSearchLayer;
use sonia_tools::{ExecutionResponse, ExecutorPlane, ToolRegistry};

use crate::confirmation::ConfirmationManager;
use crate::pipeline::{TurnPipeline, TurnRequest};

/// A tool action waiting on its approval token.
#[derive(Debug, Clone)]
struct PendingAction {
    tool_name: String,
    args: HashMap<String, JsonValue>,
    confirmation_id: ConfirmationId,
}

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<TurnPipeline>,
    confirmations: Arc<ConfirmationManager>,
    ledger: MemoryDatabase,
    retrieval: Arc<HybridSearchLayer>,
    plane: Arc<ExecutorPlane>,
    registry: Arc<ToolRegistry>,
    events: EventBus,
    pending_actions: Arc<DashMap<String, PendingAction>>,
}

impl AppState {
    /// Assemble the state container.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<TurnPipeline>,
        confirmations: Arc<ConfirmationManager>,
        ledger: MemoryDatabase,
        retrieval: Arc<HybridSearchLayer>,
        plane: Arc<ExecutorPlane>,
        registry: Arc<ToolRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            pipeline,
            confirmations,
            ledger,
            retrieval,
            plane,
            registry,
            events,
            pending_actions: Arc::new(DashMap::new()),
        }
    }
}

/// Build the gateway router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        // Gateway
        .route("/v1/turn", post(handle_turn))
        .route("/healthz", get(healthz))
        .route("/v1/ui/stream", get(ui_stream))
        // Memory engine, legacy
        .route("/store", post(memory_store))
        .route("/search", post(memory_search))
        .route("/recall/:id", get(memory_recall).put(memory_update))
        .route("/query/stats", get(memory_stats))
        // Memory engine, typed v3
        .route("/v3/memory/store", post(typed_store))
        .route("/v3/memory/version", post(typed_version))
        .route("/v3/memory/query", post(typed_query))
        .route("/v3/memory/redact", post(typed_redact))
        .route("/v3/memory/:id/versions", get(typed_versions))
        .route("/v3/memory/:id/redaction-audit", get(typed_redaction_audit))
        .route("/v3/memory/conflicts", get(typed_conflicts))
        .route("/v3/memory/conflicts/:id/resolve", post(typed_resolve_conflict))
        .route("/v1/search", post(hybrid_search))
        // Tool executor
        .route("/execute", post(execute_tool))
        .route("/actions/:id/approve", post(approve_action))
        .route("/tools", get(list_tools))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

async fn handle_turn(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Json<JsonValue> {
    let response = state
        .pipeline
        .handle_turn(request, CancellationToken::new())
        .await;
    Json(serde_json::to_value(&response).unwrap_or_else(|_| json!({"ok": false})))
}

async fn healthz() -> Json<JsonValue> {
    Json(json!({
        "ok": true,
        "service": "api-gateway",
        "timestamp": Timestamp::now(),
    }))
}

// ---------------------------------------------------------------------------
// UI WebSocket stream
// ---------------------------------------------------------------------------

async fn ui_stream(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> axum::response::Response {
    upgrade.on_upgrade(move |socket| ui_stream_loop(state, socket))
}

async fn ui_stream_loop(state: AppState, mut socket: WebSocket) {
    let session_marker = SessionId::new();
    let hello = json!({
        "type": "session.created",
        "session_id": session_marker,
        "timestamp": Timestamp::now(),
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    let mut events = state.events.subscribe();
    // Turns run as tasks so control frames stay responsive; results come
    // back over this channel
    let (turn_tx, mut turn_rx) = tokio::sync::mpsc::channel::<crate::pipeline::TurnResponse>(8);
    let mut current_turn: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else { return };
                let Message::Text(text) = message else { continue };
                let Ok(frame) = serde_json::from_str::<JsonValue>(&text) else {
                    let _ = socket
                        .send(Message::Text(json!({"type": "error", "message": "malformed frame"}).to_string()))
                        .await;
                    continue;
                };

                match frame["type"].as_str() {
                    Some("input.text") => {
                        let request = TurnRequest {
                            user_id: frame["user_id"].as_str().unwrap_or("ui").to_string(),
                            conversation_id: frame["conversation_id"]
                                .as_str()
                                .unwrap_or(session_marker.as_str())
                                .to_string(),
                            input_text: frame["text"].as_str().unwrap_or_default().to_string(),
                            profile: None,
                            idempotency_key: None,
                        };
                        let echo = json!({
                            "type": "turn.user",
                            "text": request.input_text,
                            "timestamp": Timestamp::now(),
                        });
                        let _ = socket.send(Message::Text(echo.to_string())).await;

                        let cancel = CancellationToken::new();
                        current_turn = Some(cancel.clone());
                        let pipeline = Arc::clone(&state.pipeline);
                        let results = turn_tx.clone();
                        tokio::spawn(async move {
                            let response = pipeline.handle_turn(request, cancel).await;
                            let _ = results.send(response).await;
                        });
                    }
                    Some("control.interrupt") => {
                        if let Some(turn) = current_turn.take() {
                            turn.cancel();
                        }
                        let ack = json!({"type": "ack.control", "control": "interrupt"});
                        let _ = socket.send(Message::Text(ack.to_string())).await;
                    }
                    Some(control @ ("control.toggle" | "control.replay" | "control.hold")) => {
                        let ack = json!({"type": "ack.control", "control": control});
                        let _ = socket.send(Message::Text(ack.to_string())).await;
                    }
                    other => {
                        warn!(frame_type = ?other, "unrecognized UI frame");
                        let nack = json!({"type": "nack.control", "reason": "unknown frame type"});
                        let _ = socket.send(Message::Text(nack.to_string())).await;
                    }
                }
            }
            Some(response) = turn_rx.recv() => {
                current_turn = None;
                let outbound = json!({
                    "type": "turn.assistant",
                    "turn_id": response.turn_id,
                    "ok": response.ok,
                    "text": response.assistant_text,
                    "error": response.error,
                    "timestamp": Timestamp::now(),
                });
                if socket.send(Message::Text(outbound.to_string())).await.is_err() {
                    return;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { continue };
                let outbound = json!({
                    "type": "diagnostics",
                    "event": event.event_type(),
                    "detail": &*event,
                });
                if socket.send(Message::Text(outbound.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Memory engine: legacy routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LegacyStoreBody {
    #[serde(rename = "type")]
    memory_type: String,
    content: String,
    #[serde(default)]
    metadata: Option<JsonValue>,
}

async fn memory_store(
    State(state): State<AppState>,
    Json(body): Json<LegacyStoreBody>,
) -> (StatusCode, Json<JsonValue>) {
    match state
        .ledger
        .store(&body.memory_type, &body.content, body.metadata.as_ref())
    {
        Ok(id) => {
            state.retrieval.on_store(&id, &body.content);
            state.retrieval.on_store_async(&id, &body.content).await;
            (StatusCode::OK, Json(json!({"status": "stored", "id": id})))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct LegacySearchBody {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

async fn memory_search(
    State(state): State<AppState>,
    Json(body): Json<LegacySearchBody>,
) -> Json<JsonValue> {
    let results = state.retrieval.search(&body.query, body.limit);
    Json(json!({"count": results.len(), "results": results}))
}

async fn memory_recall(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.get(&MemoryId::from_string(id)) {
        Ok(Some(record)) => (StatusCode::OK, Json(json!(record))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct LegacyUpdateBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    metadata: Option<JsonValue>,
}

async fn memory_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LegacyUpdateBody>,
) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.update(
        &MemoryId::from_string(id),
        body.content.as_deref(),
        body.metadata.as_ref(),
    ) {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "updated"}))),
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn memory_stats(State(state): State<AppState>) -> Json<JsonValue> {
    let ledger_stats = state
        .ledger
        .get_stats()
        .map(|s| serde_json::to_value(s).unwrap_or(JsonValue::Null))
        .unwrap_or(JsonValue::Null);
    Json(json!({
        "ledger": ledger_stats,
        "search": state.retrieval.stats().await,
    }))
}

// ---------------------------------------------------------------------------
// Memory engine: typed v3 routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TypedStoreBody {
    #[serde(rename = "type", default = "default_memory_type")]
    memory_type: String,
    subtype: String,
    content: JsonValue,
    #[serde(default)]
    metadata: Option<JsonValue>,
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_until: Option<String>,
}

fn default_memory_type() -> String {
    "knowledge".to_string()
}

async fn typed_store(
    State(state): State<AppState>,
    Json(body): Json<TypedStoreBody>,
) -> (StatusCode, Json<JsonValue>) {
    let content = match &body.content {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    match state.ledger.store_typed(
        &body.memory_type,
        &body.subtype,
        &content,
        body.metadata.as_ref(),
        body.valid_from.as_deref(),
        body.valid_until.as_deref(),
    ) {
        Ok(outcome) if outcome.valid => {
            if let Some(id) = &outcome.memory_id {
                state.retrieval.on_store(id, &content);
                state.retrieval.on_store_async(id, &content).await;
            }
            (
                StatusCode::OK,
                Json(json!({
                    "status": "stored",
                    "id": outcome.memory_id,
                    "subtype": body.subtype,
                    "conflicts": outcome.conflicts,
                })),
            )
        }
        Ok(outcome) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "invalid",
                "errors": outcome.validation_errors,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct TypedVersionBody {
    original_id: String,
    new_content: JsonValue,
    #[serde(default)]
    metadata: Option<JsonValue>,
    #[serde(default)]
    valid_from: Option<String>,
}

async fn typed_version(
    State(state): State<AppState>,
    Json(body): Json<TypedVersionBody>,
) -> (StatusCode, Json<JsonValue>) {
    let content = match &body.new_content {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let original = MemoryId::from_string(body.original_id.clone());
    match state.ledger.create_version(
        &original,
        &content,
        body.metadata.as_ref(),
        body.valid_from.as_deref(),
        None,
    ) {
        Ok(new_id) => {
            state.retrieval.on_store(&new_id, &content);
            state.retrieval.on_store_async(&new_id, &content).await;
            (
                StatusCode::OK,
                Json(json!({
                    "status": "versioned",
                    "id": new_id,
                    "original_id": body.original_id,
                })),
            )
        }
        Err(LedgerError::AlreadySuperseded(id)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "conflict",
                "error": format!("memory {id} already superseded (concurrent update)"),
            })),
        ),
        Err(LedgerError::NotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "error": format!("memory not found: {id}")})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct TypedQueryBody {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_max_chars")]
    max_chars: usize,
    #[serde(default)]
    type_filters: Option<Vec<String>>,
    #[serde(default)]
    include_redacted: bool,
}

fn default_max_chars() -> usize {
    7000
}

async fn typed_query(
    State(state): State<AppState>,
    Json(body): Json<TypedQueryBody>,
) -> (StatusCode, Json<JsonValue>) {
    let type_filters = match parse_filters(body.type_filters.as_deref()) {
        Ok(filters) => filters,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "invalid", "errors": [message]})),
            )
        }
    };
    let request = BudgetQuery {
        query: body.query,
        limit: body.limit,
        max_chars: body.max_chars,
        type_filters,
        include_redacted: body.include_redacted,
        ordered_ids: None,
    };
    match state.ledger.query_with_budget(&request) {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

fn parse_filters(raw: Option<&[String]>) -> Result<Option<Vec<MemorySubtype>>, String> {
    match raw {
        None => Ok(None),
        Some(names) => names
            .iter()
            .map(|n| n.parse::<MemorySubtype>())
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
    }
}

#[derive(Debug, Deserialize)]
struct RedactBody {
    memory_id: String,
    reason: String,
    #[serde(default = "default_performer")]
    performed_by: String,
}

fn default_performer() -> String {
    "api".to_string()
}

async fn typed_redact(
    State(state): State<AppState>,
    Json(body): Json<RedactBody>,
) -> (StatusCode, Json<JsonValue>) {
    let id = MemoryId::from_string(body.memory_id);
    match state.ledger.redact(&id, &body.reason, &body.performed_by) {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "redacted", "id": id}))),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"status": "noop", "id": id})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

async fn typed_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.get_version_history(&MemoryId::from_string(id)) {
        Ok(history) => (
            StatusCode::OK,
            Json(json!({"count": history.len(), "versions": history})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn typed_redaction_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.get_redaction_audit(&MemoryId::from_string(id)) {
        Ok(trail) => (
            StatusCode::OK,
            Json(json!({"count": trail.len(), "audit": trail})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn typed_conflicts(State(state): State<AppState>) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.get_conflicts(None, None, 50) {
        Ok(conflicts) => (
            StatusCode::OK,
            Json(json!({"count": conflicts.len(), "conflicts": conflicts})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    #[serde(default)]
    resolution_note: String,
}

async fn typed_resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> (StatusCode, Json<JsonValue>) {
    match state.ledger.resolve_conflict(&id, &body.resolution_note) {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "resolved"}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "error": "conflict not found or already resolved"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn hybrid_search(
    State(state): State<AppState>,
    Json(body): Json<LegacySearchBody>,
) -> Json<JsonValue> {
    let hits = state.retrieval.async_search(&body.query, body.limit).await;
    Json(json!({"count": hits.len(), "results": hits}))
}

// ---------------------------------------------------------------------------
// Tool executor façade
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    tool_name: String,
    #[serde(default)]
    args: HashMap<String, JsonValue>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn execute_tool(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> (StatusCode, Json<JsonValue>) {
    let timeout = body.timeout_ms.map(std::time::Duration::from_millis);
    match state.plane.execute(&body.tool_name, &body.args, timeout).await {
        Ok(ExecutionResponse::Executed { action_id, outcome }) => (
            StatusCode::OK,
            Json(json!({
                "status": "executed",
                "action_id": action_id,
                "result": outcome.result,
            })),
        ),
        Ok(ExecutionResponse::RequiresApproval {
            action_id,
            approval_token,
        }) => {
            state.pending_actions.insert(
                action_id.to_string(),
                PendingAction {
                    tool_name: body.tool_name.clone(),
                    args: body.args.clone(),
                    confirmation_id: ConfirmationId::from_string(approval_token.clone()),
                },
            );
            (
                StatusCode::OK,
                Json(json!({
                    "status": "requires_approval",
                    "action_id": action_id,
                    "approval_token": approval_token,
                })),
            )
        }
        Ok(ExecutionResponse::PolicyDenied { reason }) => (
            StatusCode::OK,
            Json(json!({"status": "policy_denied", "message": reason})),
        ),
        Ok(ExecutionResponse::NotImplemented { tool_name }) => (
            StatusCode::OK,
            Json(json!({"status": "not_implemented", "message": tool_name})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    approval_token: String,
}

async fn approve_action(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> (StatusCode, Json<JsonValue>) {
    let Some(pending) = state.pending_actions.get(&action_id).map(|p| p.clone()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": "unknown action"})),
        );
    };
    if pending.confirmation_id.as_str() != body.approval_token {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"status": "error", "message": "approval token mismatch"})),
        );
    }

    // Single use: the CAS decide consumes the token
    if let Err(e) = state.confirmations.decide(&pending.confirmation_id, true).await {
        return (
            StatusCode::CONFLICT,
            Json(json!({"status": "error", "message": e.to_string()})),
        );
    }
    state.pending_actions.remove(&action_id);

    debug!(action_id, tool = pending.tool_name, "approval confirmed, executing");
    let result = state
        .plane
        .execute_approved(
            &pending.tool_name,
            sonia_core::ActionId::from_string(action_id.clone()),
            &pending.args,
        )
        .await;

    match result {
        Ok(ExecutionResponse::Executed { outcome, .. }) => (
            StatusCode::OK,
            Json(json!({
                "status": "approval_confirmed",
                "action_id": action_id,
                "result": outcome.result,
            })),
        ),
        Ok(other) => (
            StatusCode::OK,
            Json(json!({
                "status": "approval_confirmed",
                "action_id": action_id,
                "detail": format!("{other:?}"),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": e.to_string()})),
        ),
    }
}

async fn list_tools(State(state): State<AppState>) -> Json<JsonValue> {
    let tools = state.registry.list_tools(None, None);
    Json(json!({"count": tools.len(), "tools": tools}))
}
