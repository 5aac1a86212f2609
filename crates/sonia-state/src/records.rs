//! Durable record types.
//!
//! These mirror the SQL rows one-to-one; the gateway's in-memory managers
//! hold the same structs as their write-through cache values.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sonia_core::{ActionId, ConfirmationId, LetterId, OutboxId, SessionId, Timestamp, TurnId};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is live and accepting turns.
    Active,
    /// Session idled out.
    Expired,
    /// Session was explicitly closed.
    Closed,
}

impl SessionStatus {
    /// Stable column value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }

    /// Parse a column value; unknown values map to `Closed`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "expired" => Self::Expired,
            _ => Self::Closed,
        }
    }
}

/// A gateway session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session id.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Conversation grouping id.
    pub conversation_id: String,
    /// Model routing profile.
    pub profile: String,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Hard expiry time.
    pub expires_at: Timestamp,
    /// Last request time.
    pub last_activity: Timestamp,
    /// Turns processed so far.
    pub turn_count: u64,
    /// Free-form metadata.
    pub metadata: JsonValue,
}

/// Confirmation token state. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// Awaiting a user decision.
    Pending,
    /// User approved; token is consumed.
    Approved,
    /// User denied; token is consumed.
    Denied,
    /// TTL elapsed before a decision.
    Expired,
}

impl ConfirmationStatus {
    /// Stable column value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    /// Parse a column value; unknown values map to `Expired`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "denied" => Self::Denied,
            _ => Self::Expired,
        }
    }
}

/// A single-use, time-bound approval token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    /// Unique token id.
    pub confirmation_id: ConfirmationId,
    /// Session that minted the token.
    pub session_id: SessionId,
    /// Turn that paused on this token.
    pub turn_id: TurnId,
    /// The gated tool.
    pub tool_name: String,
    /// The gated arguments.
    pub args: JsonValue,
    /// Human-readable summary for the approval prompt.
    pub summary: String,
    /// Token state.
    pub status: ConfirmationStatus,
    /// Mint time.
    pub created_at: Timestamp,
    /// Time-to-live from mint.
    pub ttl_seconds: f64,
    /// When the decision landed, if any.
    pub decided_at: Option<Timestamp>,
}

impl ConfirmationRecord {
    /// Whether the token's TTL has elapsed.
    #[must_use]
    pub fn is_expired_by_ttl(&self) -> bool {
        self.created_at.age_seconds() > self.ttl_seconds
    }
}

/// A failed action retained for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique letter id.
    pub letter_id: LetterId,
    /// The failed action.
    pub action_id: ActionId,
    /// The intended operation (tool/action name).
    pub intent: String,
    /// Arguments of the failed action.
    pub params: JsonValue,
    /// Machine error code.
    pub error_code: String,
    /// Human error message.
    pub error_message: String,
    /// Failure class for replay policy.
    pub failure_class: Option<String>,
    /// Correlation id linking retries and replays.
    pub correlation_id: Option<String>,
    /// Originating session, if any.
    pub session_id: Option<SessionId>,
    /// When the letter was written.
    pub created_at: Timestamp,
    /// Retries consumed before dead-lettering.
    pub retries_exhausted: u32,
    /// Whether a replay has been executed.
    pub replayed: bool,
    /// When the replay happened.
    pub replayed_at: Option<Timestamp>,
    /// The replay's action id.
    pub replay_action_id: Option<ActionId>,
}

/// One entry in the memory write-back outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Unique entry id.
    pub outbox_id: OutboxId,
    /// Entry type (delivery is FIFO per type).
    pub entry_type: String,
    /// The payload to deliver.
    pub payload: JsonValue,
    /// Enqueue time.
    pub created_at: Timestamp,
    /// Whether delivery succeeded.
    pub delivered: bool,
    /// When delivery succeeded.
    pub delivered_at: Option<Timestamp>,
    /// Delivery attempts so far.
    pub attempts: u32,
}

/// A cached idempotent result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The caller-supplied key.
    pub key: String,
    /// The action that produced the result.
    pub action_id: ActionId,
    /// The cached result envelope.
    pub result: JsonValue,
    /// When the key was written.
    pub created_at: Timestamp,
    /// When the key stops being served.
    pub expires_at: Timestamp,
}

/// Startup restore diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RestoreCounts {
    /// Active sessions loaded.
    pub sessions: usize,
    /// Pending confirmations loaded.
    pub confirmations: usize,
    /// Unreplayed dead letters loaded.
    pub dead_letters: usize,
    /// Undelivered outbox entries pending.
    pub outbox_pending: usize,
}
