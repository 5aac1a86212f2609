//! The turn pipeline.
//!
//! One `handle_turn` call per user turn. Stages: admit (idempotency,
//! back-pressure, per-session serialization), recall, model, tools,
//! persist, respond. Each stage is timed into `latency.<stage>_ms`.
//! Stages never raise across the HTTP boundary; failures translate into
//! an `{ok: false, error}` envelope. Tool side effects and the turn
//! transcript reach the ledger only through the outbox.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sonia_config::GatewaySection;
use sonia_core::{ActionId, SessionId, Timestamp, TurnId};
use sonia_events::{EventBus, SoniaEvent};
use sonia_policy::{ActionVerdict, PolicyEngine};
use sonia_retrieval::HybridSearchLayer;
use sonia_state::{ConfirmationStatus, StateStore};
use sonia_tools::{ExecutionResponse, ExecutorPlane};

use crate::confirmation::ConfirmationManager;
use crate::router_client::{ChatMessage, ChatRequest, ModelRouter, ToolCallRequest};
use crate::session::SessionManager;

/// Maximum tool calls executed per turn.
const MAX_TOOL_CALLS: usize = 10;

/// Weight of memory decay when re-ranking recall hits.
const RECALL_DECAY_WEIGHT: f64 = 0.2;

/// One inbound turn.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    /// The requesting user.
    pub user_id: String,
    /// The conversation this turn belongs to.
    pub conversation_id: String,
    /// The user's text.
    pub input_text: String,
    /// Routing profile override.
    #[serde(default)]
    pub profile: Option<String>,
    /// Idempotency key for safe retries.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Wire error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// The turn result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    /// Whether the turn completed.
    pub ok: bool,
    /// The turn id.
    pub turn_id: TurnId,
    /// Assistant text (empty on failure).
    pub assistant_text: String,
    /// Wall-clock duration of the whole turn.
    pub duration_ms: u64,
    /// Per-stage latencies (`<stage>_ms`).
    pub latency: HashMap<String, u64>,
    /// Error envelope on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

/// The turn pipeline and its collaborators.
pub struct TurnPipeline {
    sessions: Arc<SessionManager>,
    confirmations: Arc<ConfirmationManager>,
    store: StateStore,
    retrieval: Arc<HybridSearchLayer>,
    policy: Arc<PolicyEngine>,
    plane: Arc<ExecutorPlane>,
    router: Arc<dyn ModelRouter>,
    events: EventBus,
    config: GatewaySection,
    /// Per-session turn serialization.
    turn_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    /// Per-session queue of waiting turns, for shed-oldest back-pressure.
    waiting: DashMap<SessionId, Arc<StdMutex<VecDeque<(TurnId, CancellationToken)>>>>,
}

impl TurnPipeline {
    /// Build a pipeline.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        confirmations: Arc<ConfirmationManager>,
        store: StateStore,
        retrieval: Arc<HybridSearchLayer>,
        policy: Arc<PolicyEngine>,
        plane: Arc<ExecutorPlane>,
        router: Arc<dyn ModelRouter>,
        events: EventBus,
        config: GatewaySection,
    ) -> Self {
        Self {
            sessions,
            confirmations,
            store,
            retrieval,
            policy,
            plane,
            router,
            events,
            config,
            turn_locks: DashMap::new(),
            waiting: DashMap::new(),
        }
    }

    /// Process one user turn end-to-end.
    pub async fn handle_turn(&self, request: TurnRequest, cancel: CancellationToken) -> TurnResponse {
        let started = Instant::now();
        let turn_id = TurnId::new();
        let mut latency: HashMap<String, u64> = HashMap::new();

        // Idempotency fast path
        if let Some(key) = &request.idempotency_key {
            if let Some(hit) = self.store.get_idempotency_key(key).await {
                if let Ok(cached) = serde_json::from_value::<TurnResponse>(hit.result) {
                    info!(key, "idempotency hit, returning cached turn");
                    return cached;
                }
            }
        }

        // ── Admit ────────────────────────────────────────────────────
        let admit_started = Instant::now();
        let profile = request
            .profile
            .clone()
            .unwrap_or_else(|| self.config.default_profile.clone());
        let session = self
            .sessions
            .get_or_create(&request.user_id, &request.conversation_id, &profile)
            .await;
        let session_id = session.session_id.clone();

        let shed_token = CancellationToken::new();
        self.enqueue_waiter(&session_id, &turn_id, &shed_token);

        let lock = self
            .turn_locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = tokio::select! {
            guard = lock.lock() => guard,
            () = shed_token.cancelled() => {
                self.remove_waiter(&session_id, &turn_id);
                return self.fail(turn_id, started, latency, "backpressure_shed",
                    format!("session {session_id} queue is full"));
            }
            () = cancel.cancelled() => {
                self.remove_waiter(&session_id, &turn_id);
                return self.fail(turn_id, started, latency, "cancelled", "turn cancelled".to_string());
            }
        };
        self.remove_waiter(&session_id, &turn_id);
        self.sessions.touch(&session_id).await;
        latency.insert("admit_ms".to_string(), admit_started.elapsed().as_millis() as u64);

        self.events.publish(SoniaEvent::TurnStarted {
            session_id: session_id.clone(),
            turn_id: turn_id.clone(),
            timestamp: Timestamp::now(),
        });

        // ── Recall ───────────────────────────────────────────────────
        // Stage errors are non-fatal; the turn continues with empty
        // context
        let recall_started = Instant::now();
        let context = self.recall(&request.input_text).await;
        latency.insert("recall_ms".to_string(), recall_started.elapsed().as_millis() as u64);

        if cancel.is_cancelled() {
            drop(guard);
            self.persist_partial(&session_id, &turn_id, &request.input_text, "", &[], true)
                .await;
            return self.fail(turn_id, started, latency, "cancelled", "turn cancelled".to_string());
        }

        // ── Model ────────────────────────────────────────────────────
        let model_started = Instant::now();
        let chat = ChatRequest {
            task_type: profile.clone(),
            messages: build_messages(&context, &request.input_text),
            temperature: None,
            max_tokens: None,
            policy: "default".to_string(),
        };
        let model_timeout = Duration::from_secs_f64(self.config.model_timeout_seconds);
        let model_result = tokio::select! {
            result = tokio::time::timeout(model_timeout, self.router.chat(&chat)) => result,
            () = cancel.cancelled() => {
                drop(guard);
                self.persist_partial(&session_id, &turn_id, &request.input_text, "", &[], true).await;
                return self.fail(turn_id, started, latency, "cancelled", "turn cancelled".to_string());
            }
        };
        latency.insert("model_ms".to_string(), model_started.elapsed().as_millis() as u64);

        let response = match model_result {
            Err(_) => {
                drop(guard);
                return self.fail(
                    turn_id,
                    started,
                    latency,
                    "timeout",
                    format!("model call exceeded {}s", self.config.model_timeout_seconds),
                );
            }
            Ok(Err(e)) => {
                drop(guard);
                return self.fail(turn_id, started, latency, e.code(), e.to_string());
            }
            Ok(Ok(response)) => response,
        };

        // ── Tools ────────────────────────────────────────────────────
        let tools_started = Instant::now();
        let mut tool_outcomes: Vec<JsonValue> = Vec::new();
        let mut refusals: Vec<String> = Vec::new();
        for call in response.tool_calls.iter().take(MAX_TOOL_CALLS) {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self
                .run_tool_call(&session_id, &turn_id, call, &cancel)
                .await;
            if let Some(refusal) = outcome.get("refusal").and_then(JsonValue::as_str) {
                refusals.push(refusal.to_string());
            }
            // Tool side effects reach the ledger via the outbox only
            self.store.enqueue_outbox("tool_result", outcome.clone()).await;
            tool_outcomes.push(outcome);
        }
        latency.insert("tools_ms".to_string(), tools_started.elapsed().as_millis() as u64);

        let cancelled = cancel.is_cancelled();
        let assistant_text = if refusals.is_empty() {
            response.text.clone()
        } else if response.text.is_empty() {
            refusals.join("; ")
        } else {
            format!("{} ({})", response.text, refusals.join("; "))
        };

        // ── Persist ──────────────────────────────────────────────────
        let persist_started = Instant::now();
        self.persist_partial(
            &session_id,
            &turn_id,
            &request.input_text,
            &assistant_text,
            &tool_outcomes,
            cancelled,
        )
        .await;
        latency.insert("persist_ms".to_string(), persist_started.elapsed().as_millis() as u64);

        drop(guard);

        // ── Respond ──────────────────────────────────────────────────
        let duration_ms = started.elapsed().as_millis() as u64;
        let turn_response = TurnResponse {
            ok: !cancelled,
            turn_id: turn_id.clone(),
            assistant_text,
            duration_ms,
            latency,
            error: cancelled.then(|| ErrorEnvelope {
                code: "cancelled".to_string(),
                message: "turn cancelled during tool execution".to_string(),
            }),
        };

        if let Some(key) = &request.idempotency_key {
            if turn_response.ok {
                if let Ok(result) = serde_json::to_value(&turn_response) {
                    self.store
                        .persist_idempotency_key(
                            key,
                            &ActionId::new(),
                            result,
                            self.config.idempotency_ttl_seconds,
                        )
                        .await;
                }
            }
        }

        self.events.publish(SoniaEvent::TurnCompleted {
            session_id,
            turn_id,
            ok: turn_response.ok,
            duration_ms,
            timestamp: Timestamp::now(),
        });
        turn_response
    }

    /// Hybrid recall with a character budget; failures yield empty
    /// context. Decay re-ranks the fused hits so stale memories give way
    /// to recent ones.
    async fn recall(&self, input: &str) -> String {
        let hits = self.retrieval.async_search(input, 5).await;
        let hits = self.retrieval.adjust_ranking(hits, RECALL_DECAY_WEIGHT);
        let mut context = String::new();
        for hit in hits {
            // Budgeted accumulation; the first hit always fits
            if !context.is_empty()
                && context.len() + hit.content.len() > self.config.recall_max_chars
            {
                break;
            }
            context.push_str(&hit.content);
            context.push('\n');
            if context.len() >= self.config.recall_max_chars {
                break;
            }
        }
        context
    }

    /// Route one tool call through policy, approval, and the executor.
    async fn run_tool_call(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> JsonValue {
        let action_id = ActionId::new();
        let decision = self.policy.evaluate(
            &call.tool_name,
            &call.args,
            "conversation",
            turn_id.as_str(),
        );

        match decision.verdict {
            ActionVerdict::Deny => {
                warn!(tool = call.tool_name, rule = decision.rule_name, "tool call denied");
                json!({
                    "action_id": action_id,
                    "tool_name": call.tool_name,
                    "status": "policy_denied",
                    "refusal": format!("I can't run {}: {}", call.tool_name, decision.reason),
                    "cancelled": cancel.is_cancelled(),
                })
            }
            ActionVerdict::Confirm => {
                let token = self
                    .confirmations
                    .mint(
                        session_id,
                        turn_id,
                        &call.tool_name,
                        serde_json::to_value(&call.args).unwrap_or(JsonValue::Null),
                        &summarize_call(call),
                        Some(self.config.confirmation_ttl_seconds),
                    )
                    .await;
                self.events.publish(SoniaEvent::ApprovalRequired {
                    session_id: session_id.clone(),
                    turn_id: turn_id.clone(),
                    action_id: action_id.clone(),
                    confirmation_id: token.confirmation_id.clone(),
                    tool_name: call.tool_name.clone(),
                    summary: token.summary.clone(),
                    timestamp: Timestamp::now(),
                });

                // Pause the turn until the decision or the TTL
                let status = self
                    .confirmations
                    .wait_for_decision(&token.confirmation_id)
                    .await;
                match status {
                    ConfirmationStatus::Approved => {
                        self.execute_tool(&action_id, call, cancel).await
                    }
                    ConfirmationStatus::Denied => json!({
                        "action_id": action_id,
                        "tool_name": call.tool_name,
                        "status": "denied_by_user",
                        "refusal": format!("{} was declined", call.tool_name),
                        "cancelled": cancel.is_cancelled(),
                    }),
                    _ => json!({
                        "action_id": action_id,
                        "tool_name": call.tool_name,
                        "status": "approval_expired",
                        "refusal": format!("approval for {} timed out", call.tool_name),
                        "cancelled": cancel.is_cancelled(),
                    }),
                }
            }
            ActionVerdict::Allow => self.execute_tool(&action_id, call, cancel).await,
        }
    }

    async fn execute_tool(
        &self,
        action_id: &ActionId,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> JsonValue {
        // An in-flight tool call is allowed to complete or time out even
        // if the turn is cancelled; the outbox entry carries the flag
        let result = self
            .plane
            .execute_approved(&call.tool_name, action_id.clone(), &call.args)
            .await;
        match result {
            Ok(ExecutionResponse::Executed { outcome, .. }) => json!({
                "action_id": action_id,
                "tool_name": call.tool_name,
                "status": "executed",
                "result": outcome.result,
                "exit_code": outcome.exit_code,
                "cancelled": cancel.is_cancelled(),
            }),
            Ok(ExecutionResponse::NotImplemented { tool_name }) => json!({
                "action_id": action_id,
                "tool_name": tool_name,
                "status": "not_implemented",
                "cancelled": cancel.is_cancelled(),
            }),
            Ok(other) => json!({
                "action_id": action_id,
                "tool_name": call.tool_name,
                "status": "unexpected_response",
                "detail": format!("{other:?}"),
                "cancelled": cancel.is_cancelled(),
            }),
            Err(e) => json!({
                "action_id": action_id,
                "tool_name": call.tool_name,
                "status": "failed",
                "error_code": error_code(&e),
                "error": e.to_string(),
                "cancelled": cancel.is_cancelled(),
            }),
        }
    }

    /// Enqueue the turn transcript write-back.
    async fn persist_partial(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        user_text: &str,
        assistant_text: &str,
        tool_outcomes: &[JsonValue],
        cancelled: bool,
    ) {
        self.store
            .enqueue_outbox(
                "memory_writeback",
                json!({
                    "session_id": session_id,
                    "turn_id": turn_id,
                    "user_text": user_text,
                    "assistant_text": assistant_text,
                    "tool_outcomes": tool_outcomes,
                    "cancelled": cancelled,
                }),
            )
            .await;
    }

    fn fail(
        &self,
        turn_id: TurnId,
        started: Instant,
        latency: HashMap<String, u64>,
        code: &str,
        message: String,
    ) -> TurnResponse {
        warn!(turn_id = turn_id.as_str(), code, "turn failed");
        TurnResponse {
            ok: false,
            turn_id,
            assistant_text: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            latency,
            error: Some(ErrorEnvelope {
                code: code.to_string(),
                message,
            }),
        }
    }

    fn enqueue_waiter(&self, session_id: &SessionId, turn_id: &TurnId, token: &CancellationToken) {
        let queue = self
            .waiting
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(StdMutex::new(VecDeque::new())))
            .clone();
        let mut queue = queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.push_back((turn_id.clone(), token.clone()));
        // Over cap: shed the oldest waiting turn
        while queue.len() > self.config.max_queue_depth {
            if let Some((shed_id, shed)) = queue.pop_front() {
                warn!(turn_id = shed_id.as_str(), "shedding oldest queued turn");
                shed.cancel();
            }
        }
    }

    fn remove_waiter(&self, session_id: &SessionId, turn_id: &TurnId) {
        if let Some(queue) = self.waiting.get(session_id) {
            let mut queue = queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.retain(|(id, _)| id != turn_id);
        }
    }
}

impl std::fmt::Debug for TurnPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPipeline").finish_non_exhaustive()
    }
}

fn build_messages(context: &str, input: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !context.is_empty() {
        messages.push(ChatMessage::system(format!(
            "Relevant memories:\n{context}"
        )));
    }
    messages.push(ChatMessage::user(input));
    messages
}

fn summarize_call(call: &ToolCallRequest) -> String {
    let mut parts: Vec<String> = call
        .args
        .iter()
        .map(|(k, v)| {
            let s = match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let truncated: String = s.chars().take(60).collect();
            format!("{k}={truncated}")
        })
        .collect();
    parts.sort();
    format!("{}({})", call.tool_name, parts.join(", "))
}

fn error_code(e: &sonia_tools::ToolError) -> &'static str {
    use sonia_tools::ToolError;
    match e {
        ToolError::Timeout { .. } => "timeout",
        ToolError::SandboxViolation { .. } => "policy_denied",
        ToolError::InvalidParameters(_) => "validation_failed",
        ToolError::RateLimited { .. } => "rate_limited",
        ToolError::UnknownTool(_) => "not_found",
        _ => "execution_error",
    }
}
