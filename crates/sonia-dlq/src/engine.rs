//! The replay decision pipeline.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use sonia_core::{LetterId, Timestamp};

/// Failure classes that are never worth replaying.
pub const NON_RETRYABLE_CLASSES: [&str; 3] = ["circuit_open", "policy_denied", "validation_failed"];

/// Bounded size of the trace ring.
const MAX_TRACES: usize = 1000;

/// The three replay verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayDecision {
    /// Replay may proceed now.
    Approve,
    /// Replay will never be allowed for this letter.
    Reject,
    /// Replay is not allowed yet; re-evaluate later.
    Defer,
}

impl ReplayDecision {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Defer => "defer",
        }
    }
}

/// Why a replay was rejected or deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Operator blocked the letter.
    ManualBlock,
    /// The letter was already replayed.
    AlreadyReplayed,
    /// The failure class is non-retryable.
    FailureClassNonRetryable,
    /// The tool's circuit breaker is still open.
    CircuitStillOpen,
    /// The per-letter cooldown has not elapsed.
    CooldownActive,
    /// The window replay budget is exhausted.
    BudgetExhausted,
}

impl RejectReason {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualBlock => "manual_block",
            Self::AlreadyReplayed => "already_replayed",
            Self::FailureClassNonRetryable => "failure_class_non_retryable",
            Self::CircuitStillOpen => "circuit_still_open",
            Self::CooldownActive => "cooldown_active",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// Per-tool circuit breaker state, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    /// Breaker closed, calls flowing.
    #[default]
    Closed,
    /// Breaker half-open (probe traffic only).
    HalfOpen,
    /// Breaker open, calls refused.
    Open,
}

/// Input to one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    /// The letter under evaluation.
    pub letter_id: LetterId,
    /// Whether the letter already has a replay recorded.
    pub already_replayed: bool,
    /// The letter's failure class string.
    pub failure_class: String,
    /// The original error code.
    pub error_code: String,
    /// Correlation id for the trace.
    pub correlation_id: String,
    /// Originating session, if known.
    pub session_id: Option<String>,
    /// The tool's breaker state right now.
    pub breaker_state: BreakerState,
    /// Dry-run: evaluate without mutating state.
    pub dry_run: bool,
}

impl EvaluationInput {
    /// A retryable-looking evaluation with every optional field defaulted.
    #[must_use]
    pub fn new(letter_id: impl Into<LetterId>, failure_class: &str, error_code: &str) -> Self {
        Self {
            letter_id: letter_id.into(),
            already_replayed: false,
            failure_class: failure_class.to_string(),
            error_code: error_code.to_string(),
            correlation_id: String::new(),
            session_id: None,
            breaker_state: BreakerState::Closed,
            dry_run: true,
        }
    }
}

/// Immutable record of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayTrace {
    /// The evaluated letter.
    pub letter_id: LetterId,
    /// The verdict.
    pub decision: ReplayDecision,
    /// Reason, for non-APPROVE verdicts.
    pub reject_reason: Option<RejectReason>,
    /// The letter's failure class.
    pub failure_class: String,
    /// The original error code.
    pub original_error_code: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Session id, when known.
    pub session_id: Option<String>,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// When the evaluation happened.
    pub evaluated_at: Timestamp,
}

/// Original-to-replay correlation chain for audit.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationLineage {
    /// Correlation id of the original action.
    pub original_correlation_id: String,
    /// The original action.
    pub original_action_id: String,
    /// Correlation ids of replays, in order.
    pub replay_correlation_ids: Vec<String>,
    /// Action ids of replays, in order.
    pub replay_action_ids: Vec<String>,
    /// `pending` until a replay is attached, then `replayed`.
    pub status: String,
    /// When the lineage was first recorded.
    pub created_at: Timestamp,
}

#[derive(Debug, Default)]
struct EngineState {
    traces: VecDeque<ReplayTrace>,
    blocked: HashSet<String>,
    /// letter id -> last real replay approval
    cooldowns: HashMap<String, Instant>,
    /// instants of real approvals inside the sliding window
    window: VecDeque<Instant>,
    /// original action id -> lineage
    lineages: HashMap<String, CorrelationLineage>,
}

/// The DLQ replay policy engine.
pub struct DlqReplayPolicyEngine {
    cooldown: Duration,
    max_replays_per_window: usize,
    window: Duration,
    state: Mutex<EngineState>,
}

impl DlqReplayPolicyEngine {
    /// Engine with production defaults: 60s cooldown, 10 replays per
    /// 300s window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(Duration::from_secs(60), 10, Duration::from_secs(300))
    }

    /// Engine with explicit policy knobs.
    #[must_use]
    pub fn with_policy(cooldown: Duration, max_replays_per_window: usize, window: Duration) -> Self {
        Self {
            cooldown,
            max_replays_per_window,
            window,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Evaluate whether a letter may be replayed. Appends a trace either
    /// way. A non-dry-run APPROVE stamps the cooldown and consumes one
    /// unit of window budget.
    pub fn evaluate(&self, input: &EvaluationInput) -> ReplayTrace {
        let mut state = self.lock();
        let now = Instant::now();
        let key = input.letter_id.as_str().to_string();

        let (decision, reason) = self.decide(&state, input, now, &key);

        if decision == ReplayDecision::Approve && !input.dry_run {
            state.cooldowns.insert(key, now);
            state.window.push_back(now);
        }

        let trace = ReplayTrace {
            letter_id: input.letter_id.clone(),
            decision,
            reject_reason: reason,
            failure_class: input.failure_class.clone(),
            original_error_code: input.error_code.clone(),
            correlation_id: input.correlation_id.clone(),
            session_id: input.session_id.clone(),
            dry_run: input.dry_run,
            evaluated_at: Timestamp::now(),
        };
        state.traces.push_back(trace.clone());
        while state.traces.len() > MAX_TRACES {
            state.traces.pop_front();
        }

        debug!(
            letter_id = trace.letter_id.as_str(),
            decision = trace.decision.as_str(),
            reason = trace.reject_reason.map(|r| r.as_str()).unwrap_or("-"),
            dry_run = trace.dry_run,
            "replay evaluation"
        );
        trace
    }

    fn decide(
        &self,
        state: &EngineState,
        input: &EvaluationInput,
        now: Instant,
        key: &str,
    ) -> (ReplayDecision, Option<RejectReason>) {
        // 1. Manual block
        if state.blocked.contains(key) {
            return (ReplayDecision::Reject, Some(RejectReason::ManualBlock));
        }
        // 2. Idempotency
        if input.already_replayed {
            return (ReplayDecision::Reject, Some(RejectReason::AlreadyReplayed));
        }
        // 3. Non-retryable class
        if NON_RETRYABLE_CLASSES.contains(&input.failure_class.as_str()) {
            return (
                ReplayDecision::Reject,
                Some(RejectReason::FailureClassNonRetryable),
            );
        }
        // 4. Circuit state
        if input.breaker_state == BreakerState::Open {
            return (ReplayDecision::Defer, Some(RejectReason::CircuitStillOpen));
        }
        // 5. Cooldown
        if !self.cooldown.is_zero() {
            if let Some(last) = state.cooldowns.get(key) {
                if now.duration_since(*last) < self.cooldown {
                    return (ReplayDecision::Defer, Some(RejectReason::CooldownActive));
                }
            }
        }
        // 6. Window budget
        let in_window = state
            .window
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count();
        if in_window >= self.max_replays_per_window {
            return (ReplayDecision::Defer, Some(RejectReason::BudgetExhausted));
        }

        (ReplayDecision::Approve, None)
    }

    /// Block a letter from replay until unblocked.
    pub fn block_letter(&self, letter_id: &LetterId) {
        self.lock().blocked.insert(letter_id.as_str().to_string());
        info!(letter_id = letter_id.as_str(), "letter blocked");
    }

    /// Unblock a letter. Safe to call for unknown letters.
    pub fn unblock_letter(&self, letter_id: &LetterId) {
        self.lock().blocked.remove(letter_id.as_str());
    }

    /// Record (or extend) the lineage for an original action. Attaching
    /// replay ids moves the lineage to `replayed`.
    pub fn record_lineage(
        &self,
        original_correlation_id: &str,
        original_action_id: &str,
        replay_correlation_id: Option<&str>,
        replay_action_id: Option<&str>,
    ) -> CorrelationLineage {
        let mut state = self.lock();
        let lineage = state
            .lineages
            .entry(original_action_id.to_string())
            .or_insert_with(|| CorrelationLineage {
                original_correlation_id: original_correlation_id.to_string(),
                original_action_id: original_action_id.to_string(),
                replay_correlation_ids: Vec::new(),
                replay_action_ids: Vec::new(),
                status: "pending".to_string(),
                created_at: Timestamp::now(),
            });

        if let Some(corr) = replay_correlation_id {
            lineage.replay_correlation_ids.push(corr.to_string());
        }
        if let Some(action) = replay_action_id {
            lineage.replay_action_ids.push(action.to_string());
        }
        if !lineage.replay_correlation_ids.is_empty() || !lineage.replay_action_ids.is_empty() {
            lineage.status = "replayed".to_string();
        }
        lineage.clone()
    }

    /// The lineage chain for an original action, if tracked.
    #[must_use]
    pub fn get_lineage(&self, original_action_id: &str) -> Option<serde_json::Value> {
        let state = self.lock();
        state.lineages.get(original_action_id).map(|l| {
            json!({
                "original_correlation_id": l.original_correlation_id,
                "original_action_id": l.original_action_id,
                "replay_correlation_ids": l.replay_correlation_ids,
                "replay_action_ids": l.replay_action_ids,
                "replay_count": l.replay_correlation_ids.len(),
                "status": l.status,
                "created_at": l.created_at,
            })
        })
    }

    /// The most recent `limit` traces, oldest first.
    #[must_use]
    pub fn get_traces(&self, limit: usize) -> Vec<ReplayTrace> {
        let state = self.lock();
        let skip = state.traces.len().saturating_sub(limit);
        state.traces.iter().skip(skip).cloned().collect()
    }

    /// Engine statistics.
    #[must_use]
    pub fn get_stats(&self) -> serde_json::Value {
        let state = self.lock();
        let now = Instant::now();
        let in_window = state
            .window
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count();
        json!({
            "total_traces": state.traces.len(),
            "replays_in_window": in_window,
            "blocked_letters": state.blocked.len(),
            "tracked_lineages": state.lineages.len(),
            "cooldown_seconds": self.cooldown.as_secs_f64(),
            "window_seconds": self.window.as_secs_f64(),
            "max_replays_per_window": self.max_replays_per_window,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for DlqReplayPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DlqReplayPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqReplayPolicyEngine")
            .field("cooldown", &self.cooldown)
            .field("max_replays_per_window", &self.max_replays_per_window)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
