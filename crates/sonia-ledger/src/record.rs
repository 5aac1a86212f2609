//! Ledger row types and operation outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sonia_core::{ConflictId, MemoryId, Timestamp};

/// Content shown for redacted rows when a caller opts into seeing them.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// One row of the ledger.
///
/// `content` stays an opaque JSON string at this level; typed validation
/// happens at the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Record id; also the chain head id for head records.
    pub id: MemoryId,
    /// Legacy coarse type column.
    pub record_type: String,
    /// Opaque content (JSON string for typed rows).
    pub content: String,
    /// Free-form metadata.
    pub metadata: Option<JsonValue>,
    /// Insert time.
    pub created_at: Timestamp,
    /// Last mutation time (supersede/redact stamps).
    pub updated_at: Timestamp,
    /// Soft-delete time for legacy records.
    pub archived_at: Option<Timestamp>,
    /// Typed subtype, when this is a v3 row.
    pub memory_subtype: Option<String>,
    /// Temporal validity start (ISO-8601 UTC).
    pub valid_from: Option<String>,
    /// Temporal validity end (ISO-8601 UTC).
    pub valid_until: Option<String>,
    /// Observation time.
    pub recorded_at: Option<Timestamp>,
    /// Id of the next version, `None` for the current head.
    pub superseded_by: Option<MemoryId>,
    /// First record of this version chain.
    pub version_chain_head: Option<MemoryId>,
    /// Whether the record is redacted.
    pub redacted: bool,
    /// `subtype:version` string for typed rows.
    pub validation_schema: Option<String>,
    /// Content encoding, `json` for typed rows.
    pub content_format: Option<String>,
}

/// Result envelope of a typed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOutcome {
    /// The new record id, `None` when validation failed.
    pub memory_id: Option<MemoryId>,
    /// Whether validation passed.
    pub valid: bool,
    /// Validation messages when it did not.
    pub validation_errors: Vec<String>,
    /// Conflicts detected against current records.
    pub conflicts: Vec<ConflictRecord>,
}

/// A detected identity-key conflict between two current records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Unique conflict id.
    pub conflict_id: ConflictId,
    /// The newly stored record.
    pub memory_id_a: MemoryId,
    /// The existing record it conflicts with.
    pub memory_id_b: MemoryId,
    /// `FACT_CONTRADICTION` or `PREFERENCE_CONFLICT`.
    pub conflict_type: String,
    /// `high` for facts, `medium` for preferences.
    pub severity: String,
    /// Detection time.
    pub detected_at: Timestamp,
    /// Identity key and both values, for audit.
    pub metadata: JsonValue,
    /// Whether a human resolved it.
    pub resolved: bool,
    /// Resolution note, when resolved.
    pub resolution_note: Option<String>,
}

/// A governance audit row for redaction operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionAuditRecord {
    /// Unique audit row id.
    pub redaction_id: String,
    /// The affected record.
    pub memory_id: MemoryId,
    /// `REDACT` or `UNREDACT`.
    pub action: String,
    /// Stated reason.
    pub reason: String,
    /// When the operation happened.
    pub performed_at: Timestamp,
    /// Who performed it.
    pub performed_by: String,
}

/// Result envelope of a budgeted query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Accepted rows, in rank order.
    pub results: Vec<MemoryRecord>,
    /// `results.len()`.
    pub count: usize,
    /// Characters of content accepted.
    pub budget_used: usize,
    /// The configured budget.
    pub budget_limit: usize,
    /// Whether iteration stopped early on budget.
    pub truncated: bool,
}
