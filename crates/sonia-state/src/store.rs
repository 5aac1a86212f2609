//! The durable state store.
//!
//! One SQLite file, WAL journal, single writer behind a mutex. Blocking
//! SQLite work runs on the blocking thread pool so async callers never
//! stall the executor. Write paths are best-effort: a persistence failure
//! logs a warning and the in-memory cache stays authoritative until the
//! next write-through.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use sonia_core::{
    ActionId, ConfirmationId, LetterId, OutboxId, SessionId, Timestamp, TurnId,
};

use crate::error::{StateError, StateResult};
use crate::migrations;
use crate::records::{
    ConfirmationRecord, ConfirmationStatus, DeadLetterRecord, IdempotencyRecord, OutboxEntry,
    RestoreCounts, SessionRecord, SessionStatus,
};

/// Field updates applied to a persisted session.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// New lifecycle state.
    pub status: Option<SessionStatus>,
    /// New expiry time.
    pub expires_at: Option<Timestamp>,
    /// New last-activity time.
    pub last_activity: Option<Timestamp>,
    /// New turn count.
    pub turn_count: Option<u64>,
    /// Replacement metadata.
    pub metadata: Option<JsonValue>,
}

/// Field updates applied to a persisted dead letter.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterUpdate {
    /// New failure class.
    pub failure_class: Option<String>,
    /// Mark the letter replayed.
    pub replayed: Option<bool>,
    /// When the replay happened.
    pub replayed_at: Option<Timestamp>,
    /// The replay's action id.
    pub replay_action_id: Option<ActionId>,
    /// Updated retry count.
    pub retries_exhausted: Option<u32>,
}

/// SQLite-backed durable state for the gateway.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the store at `path` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the database cannot be opened or a
    /// migration fails.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StateError::Worker(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        migrations::apply(&conn)?;
        info!(path = %path.display(), "durable state store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when SQLite initialization fails.
    pub fn in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> StateResult<()> {
        // WAL for concurrent readers with a single writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(())
    }

    /// Run `f` on the blocking pool with the connection lock held.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StateResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StateError::Worker("connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await;

        match joined {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "state store operation failed");
                None
            }
            Err(e) => {
                warn!(op, error = %e, "state store worker panicked");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Write a full session record (upsert).
    pub async fn persist_session(&self, session: &SessionRecord) {
        let s = session.clone();
        self.run("persist_session", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                 (session_id, user_id, conversation_id, profile, status,
                  created_at, expires_at, last_activity, turn_count, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    s.session_id.as_str(),
                    s.user_id,
                    s.conversation_id,
                    s.profile,
                    s.status.as_str(),
                    s.created_at.to_iso(),
                    s.expires_at.to_iso(),
                    s.last_activity.to_iso(),
                    s.turn_count,
                    s.metadata.to_string(),
                    Timestamp::now().to_iso(),
                ],
            )?;
            Ok(())
        })
        .await;
    }

    /// Update specific fields on a session record.
    pub async fn update_session(&self, session_id: &SessionId, update: SessionUpdate) {
        let id = session_id.clone();
        self.run("update_session", move |conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

            if let Some(status) = update.status {
                sets.push("status = ?".to_string());
                values.push(Box::new(status.as_str().to_string()));
            }
            if let Some(t) = update.expires_at {
                sets.push("expires_at = ?".to_string());
                values.push(Box::new(t.to_iso()));
            }
            if let Some(t) = update.last_activity {
                sets.push("last_activity = ?".to_string());
                values.push(Box::new(t.to_iso()));
            }
            if let Some(n) = update.turn_count {
                sets.push("turn_count = ?".to_string());
                values.push(Box::new(n as i64));
            }
            if let Some(m) = update.metadata {
                sets.push("metadata = ?".to_string());
                values.push(Box::new(m.to_string()));
            }
            if sets.is_empty() {
                return Ok(());
            }
            sets.push("updated_at = ?".to_string());
            values.push(Box::new(Timestamp::now().to_iso()));
            values.push(Box::new(id.as_str().to_string()));

            let sql = format!(
                "UPDATE sessions SET {} WHERE session_id = ?",
                sets.join(", ")
            );
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params_ref.as_slice())?;
            Ok(())
        })
        .await;
    }

    /// Load all sessions with status `active`.
    pub async fn load_active_sessions(&self) -> Vec<SessionRecord> {
        self.run("load_active_sessions", move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM sessions WHERE status = 'active'")?;
            let rows = stmt
                .query_map([], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Confirmations
    // ------------------------------------------------------------------

    /// Write a confirmation token (upsert).
    pub async fn persist_confirmation(&self, token: &ConfirmationRecord) {
        let t = token.clone();
        self.run("persist_confirmation", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO confirmations
                 (confirmation_id, session_id, turn_id, tool_name, args,
                  summary, status, created_at, ttl_seconds, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    t.confirmation_id.as_str(),
                    t.session_id.as_str(),
                    t.turn_id.as_str(),
                    t.tool_name,
                    t.args.to_string(),
                    t.summary,
                    t.status.as_str(),
                    t.created_at.to_iso(),
                    t.ttl_seconds,
                    t.decided_at.map(|d| d.to_iso()),
                ],
            )?;
            Ok(())
        })
        .await;
    }

    /// Update confirmation status and decision time.
    pub async fn update_confirmation(
        &self,
        confirmation_id: &ConfirmationId,
        status: ConfirmationStatus,
        decided_at: Option<Timestamp>,
    ) {
        let id = confirmation_id.clone();
        self.run("update_confirmation", move |conn| {
            conn.execute(
                "UPDATE confirmations SET status = ?1, decided_at = ?2 WHERE confirmation_id = ?3",
                params![status.as_str(), decided_at.map(|d| d.to_iso()), id.as_str()],
            )?;
            Ok(())
        })
        .await;
    }

    /// Load all confirmations with status `pending`.
    pub async fn load_pending_confirmations(&self) -> Vec<ConfirmationRecord> {
        self.run("load_pending_confirmations", move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM confirmations WHERE status = 'pending'")?;
            let rows = stmt
                .query_map([], row_to_confirmation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    /// Write a dead letter (upsert).
    pub async fn persist_dead_letter(&self, letter: &DeadLetterRecord) {
        let dl = letter.clone();
        self.run("persist_dead_letter", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO dead_letters
                 (letter_id, action_id, intent, params, error_code, error_message,
                  failure_class, correlation_id, session_id, created_at,
                  retries_exhausted, replayed, replayed_at, replay_action_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    dl.letter_id.as_str(),
                    dl.action_id.as_str(),
                    dl.intent,
                    dl.params.to_string(),
                    dl.error_code,
                    dl.error_message,
                    dl.failure_class,
                    dl.correlation_id,
                    dl.session_id.as_ref().map(SessionId::as_str),
                    dl.created_at.to_iso(),
                    dl.retries_exhausted,
                    i64::from(dl.replayed),
                    dl.replayed_at.map(|t| t.to_iso()),
                    dl.replay_action_id.as_ref().map(ActionId::as_str),
                ],
            )?;
            Ok(())
        })
        .await;
    }

    /// Update fields on a dead letter record.
    pub async fn update_dead_letter(&self, letter_id: &LetterId, update: DeadLetterUpdate) {
        let id = letter_id.clone();
        self.run("update_dead_letter", move |conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

            if let Some(class) = update.failure_class {
                sets.push("failure_class = ?".to_string());
                values.push(Box::new(class));
            }
            if let Some(replayed) = update.replayed {
                sets.push("replayed = ?".to_string());
                values.push(Box::new(i64::from(replayed)));
            }
            if let Some(t) = update.replayed_at {
                sets.push("replayed_at = ?".to_string());
                values.push(Box::new(t.to_iso()));
            }
            if let Some(action) = update.replay_action_id {
                sets.push("replay_action_id = ?".to_string());
                values.push(Box::new(action.as_str().to_string()));
            }
            if let Some(n) = update.retries_exhausted {
                sets.push("retries_exhausted = ?".to_string());
                values.push(Box::new(i64::from(n)));
            }
            if sets.is_empty() {
                return Ok(());
            }
            values.push(Box::new(id.as_str().to_string()));
            let sql = format!(
                "UPDATE dead_letters SET {} WHERE letter_id = ?",
                sets.join(", ")
            );
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params_ref.as_slice())?;
            Ok(())
        })
        .await;
    }

    /// Load all dead letters that have not been replayed.
    pub async fn load_dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.run("load_dead_letters", move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM dead_letters WHERE replayed = 0")?;
            let rows = stmt
                .query_map([], row_to_dead_letter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Outbox (memory write-back queue)
    // ------------------------------------------------------------------

    /// Add an entry to the outbox queue. The id is returned even when the
    /// write fails (the caller's in-memory view stays consistent and the
    /// entry is re-enqueued on the next write-through).
    pub async fn enqueue_outbox(&self, entry_type: &str, payload: JsonValue) -> OutboxId {
        let outbox_id = OutboxId::new();
        let id = outbox_id.clone();
        let entry_type = entry_type.to_string();
        self.run("enqueue_outbox", move |conn| {
            conn.execute(
                "INSERT INTO outbox (outbox_id, entry_type, payload, created_at, delivered, attempts)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
                params![
                    id.as_str(),
                    entry_type,
                    payload.to_string(),
                    Timestamp::now().to_iso(),
                ],
            )?;
            Ok(())
        })
        .await;
        outbox_id
    }

    /// Get undelivered outbox entries, oldest first.
    pub async fn get_pending_outbox(&self, limit: usize) -> Vec<OutboxEntry> {
        self.run("get_pending_outbox", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM outbox WHERE delivered = 0 ORDER BY created_at ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], row_to_outbox)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .unwrap_or_default()
    }

    /// Mark an outbox entry as delivered. Delivery counts as an attempt.
    pub async fn mark_delivered(&self, outbox_id: &OutboxId) {
        let id = outbox_id.clone();
        self.run("mark_delivered", move |conn| {
            conn.execute(
                "UPDATE outbox SET delivered = 1, delivered_at = ?1, attempts = attempts + 1
                 WHERE outbox_id = ?2",
                params![Timestamp::now().to_iso(), id.as_str()],
            )?;
            Ok(())
        })
        .await;
    }

    /// Increment the attempt counter after a failed delivery.
    pub async fn increment_attempt(&self, outbox_id: &OutboxId) {
        let id = outbox_id.clone();
        self.run("increment_attempt", move |conn| {
            conn.execute(
                "UPDATE outbox SET attempts = attempts + 1 WHERE outbox_id = ?1",
                params![id.as_str()],
            )?;
            Ok(())
        })
        .await;
    }

    // ------------------------------------------------------------------
    // Idempotency keys
    // ------------------------------------------------------------------

    /// Write an idempotency key with TTL (upsert).
    pub async fn persist_idempotency_key(
        &self,
        key: &str,
        action_id: &ActionId,
        result: JsonValue,
        ttl_seconds: f64,
    ) {
        let key = key.to_string();
        let action = action_id.clone();
        self.run("persist_idempotency_key", move |conn| {
            let now = Timestamp::now();
            let expires =
                now.plus(chrono::Duration::milliseconds((ttl_seconds * 1000.0) as i64));
            conn.execute(
                "INSERT OR REPLACE INTO idempotency_keys
                 (idempotency_key, action_id, result_json, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key,
                    action.as_str(),
                    result.to_string(),
                    now.to_iso(),
                    expires.to_iso(),
                ],
            )?;
            Ok(())
        })
        .await;
    }

    /// Look up a non-expired idempotency key.
    pub async fn get_idempotency_key(&self, key: &str) -> Option<IdempotencyRecord> {
        let key = key.to_string();
        self.run("get_idempotency_key", move |conn| {
            let now = Timestamp::now().to_iso();
            let record = conn
                .query_row(
                    "SELECT * FROM idempotency_keys
                     WHERE idempotency_key = ?1 AND expires_at > ?2",
                    params![key, now],
                    row_to_idempotency,
                )
                .optional()?;
            Ok(record)
        })
        .await
        .flatten()
    }

    /// Remove expired idempotency keys. Returns the count deleted.
    pub async fn prune_expired_idempotency_keys(&self) -> usize {
        self.run("prune_expired_idempotency_keys", move |conn| {
            let count = conn.execute(
                "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                params![Timestamp::now().to_iso()],
            )?;
            Ok(count)
        })
        .await
        .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Bulk restore
    // ------------------------------------------------------------------

    /// Load active-state counts for startup diagnostics.
    pub async fn restore_all(&self) -> RestoreCounts {
        RestoreCounts {
            sessions: self.load_active_sessions().await.len(),
            confirmations: self.load_pending_confirmations().await.len(),
            dead_letters: self.load_dead_letters().await.len(),
            outbox_pending: self.get_pending_outbox(9999).await.len(),
        }
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(col)?;
    Timestamp::parse_iso(&raw, col).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        Some(s) => ts_from_str(&s, col).map(Some),
        None => Ok(None),
    }
}

fn ts_from_str(raw: &str, col: &str) -> rusqlite::Result<Timestamp> {
    Timestamp::parse_iso(raw, col).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn json_col(row: &Row<'_>, col: &str) -> rusqlite::Result<JsonValue> {
    let raw: String = row.get(col)?;
    Ok(serde_json::from_str(&raw).unwrap_or(JsonValue::Object(serde_json::Map::new())))
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get("status")?;
    Ok(SessionRecord {
        session_id: SessionId::from_string(row.get::<_, String>("session_id")?),
        user_id: row.get("user_id")?,
        conversation_id: row.get("conversation_id")?,
        profile: row.get("profile")?,
        status: SessionStatus::parse(&status),
        created_at: ts(row, "created_at")?,
        expires_at: ts(row, "expires_at")?,
        last_activity: ts(row, "last_activity")?,
        turn_count: row.get::<_, i64>("turn_count")? as u64,
        metadata: json_col(row, "metadata")?,
    })
}

fn row_to_confirmation(row: &Row<'_>) -> rusqlite::Result<ConfirmationRecord> {
    let status: String = row.get("status")?;
    Ok(ConfirmationRecord {
        confirmation_id: ConfirmationId::from_string(row.get::<_, String>("confirmation_id")?),
        session_id: SessionId::from_string(row.get::<_, String>("session_id")?),
        turn_id: TurnId::from_string(row.get::<_, String>("turn_id")?),
        tool_name: row.get("tool_name")?,
        args: json_col(row, "args")?,
        summary: row.get("summary")?,
        status: ConfirmationStatus::parse(&status),
        created_at: ts(row, "created_at")?,
        ttl_seconds: row.get("ttl_seconds")?,
        decided_at: opt_ts(row, "decided_at")?,
    })
}

fn row_to_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    Ok(DeadLetterRecord {
        letter_id: LetterId::from_string(row.get::<_, String>("letter_id")?),
        action_id: ActionId::from_string(row.get::<_, String>("action_id")?),
        intent: row.get("intent")?,
        params: json_col(row, "params")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        failure_class: row.get("failure_class")?,
        correlation_id: row.get("correlation_id")?,
        session_id: row
            .get::<_, Option<String>>("session_id")?
            .map(SessionId::from_string),
        created_at: ts(row, "created_at")?,
        retries_exhausted: row.get::<_, i64>("retries_exhausted")? as u32,
        replayed: row.get::<_, i64>("replayed")? != 0,
        replayed_at: opt_ts(row, "replayed_at")?,
        replay_action_id: row
            .get::<_, Option<String>>("replay_action_id")?
            .map(ActionId::from_string),
    })
}

fn row_to_outbox(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        outbox_id: OutboxId::from_string(row.get::<_, String>("outbox_id")?),
        entry_type: row.get("entry_type")?,
        payload: json_col(row, "payload")?,
        created_at: ts(row, "created_at")?,
        delivered: row.get::<_, i64>("delivered")? != 0,
        delivered_at: opt_ts(row, "delivered_at")?,
        attempts: row.get::<_, i64>("attempts")? as u32,
    })
}

fn row_to_idempotency(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        key: row.get("idempotency_key")?,
        action_id: ActionId::from_string(row.get::<_, String>("action_id")?),
        result: json_col(row, "result_json")?,
        created_at: ts(row, "created_at")?,
        expires_at: ts(row, "expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(user: &str) -> SessionRecord {
        let now = Timestamp::now();
        SessionRecord {
            session_id: SessionId::new(),
            user_id: user.to_string(),
            conversation_id: "conv-1".to_string(),
            profile: "chat_low_latency".to_string(),
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now.plus(chrono::Duration::hours(1)),
            last_activity: now,
            turn_count: 0,
            metadata: json!({"client": "test"}),
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = StateStore::in_memory().unwrap();
        let s = session("u1");
        store.persist_session(&s).await;

        let loaded = store.load_active_sessions().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session_id, s.session_id);
        assert_eq!(loaded[0].metadata["client"], "test");
    }

    #[tokio::test]
    async fn test_update_session_fields() {
        let store = StateStore::in_memory().unwrap();
        let s = session("u1");
        store.persist_session(&s).await;

        store
            .update_session(
                &s.session_id,
                SessionUpdate {
                    status: Some(SessionStatus::Closed),
                    turn_count: Some(5),
                    ..SessionUpdate::default()
                },
            )
            .await;

        // Closed sessions no longer load as active
        assert!(store.load_active_sessions().await.is_empty());
    }

    // -----------------------------------------------------------------------
    // Confirmations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_confirmation_round_trip() {
        let store = StateStore::in_memory().unwrap();
        let token = ConfirmationRecord {
            confirmation_id: ConfirmationId::new(),
            session_id: SessionId::new(),
            turn_id: TurnId::new(),
            tool_name: "file.write".to_string(),
            args: json!({"path": "notes.txt"}),
            summary: "write notes.txt".to_string(),
            status: ConfirmationStatus::Pending,
            created_at: Timestamp::now(),
            ttl_seconds: 120.0,
            decided_at: None,
        };
        store.persist_confirmation(&token).await;

        let pending = store.load_pending_confirmations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_name, "file.write");

        store
            .update_confirmation(
                &token.confirmation_id,
                ConfirmationStatus::Approved,
                Some(Timestamp::now()),
            )
            .await;
        assert!(store.load_pending_confirmations().await.is_empty());
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_outbox_fifo_and_delivery() {
        let store = StateStore::in_memory().unwrap();
        let first = store
            .enqueue_outbox("memory_writeback", json!({"seq": 1}))
            .await;
        let _second = store
            .enqueue_outbox("memory_writeback", json!({"seq": 2}))
            .await;

        let pending = store.get_pending_outbox(10).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].outbox_id, first);

        store.mark_delivered(&first).await;
        let pending = store.get_pending_outbox(10).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["seq"], 2);
    }

    #[tokio::test]
    async fn test_increment_attempt_retains_entry() {
        let store = StateStore::in_memory().unwrap();
        let id = store.enqueue_outbox("memory_writeback", json!({})).await;
        store.increment_attempt(&id).await;
        store.increment_attempt(&id).await;

        let pending = store.get_pending_outbox(10).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert!(!pending[0].delivered);
    }

    // -----------------------------------------------------------------------
    // Idempotency keys
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_idempotency_key_within_ttl() {
        let store = StateStore::in_memory().unwrap();
        let action = ActionId::new();
        store
            .persist_idempotency_key("key-1", &action, json!({"ok": true}), 300.0)
            .await;

        let hit = store.get_idempotency_key("key-1").await.unwrap();
        assert_eq!(hit.action_id, action);
        assert_eq!(hit.result["ok"], true);
    }

    #[tokio::test]
    async fn test_idempotency_key_expired_returns_none() {
        let store = StateStore::in_memory().unwrap();
        store
            .persist_idempotency_key("key-2", &ActionId::new(), json!({}), -1.0)
            .await;
        assert!(store.get_idempotency_key("key-2").await.is_none());
    }

    #[tokio::test]
    async fn test_prune_expired_keys() {
        let store = StateStore::in_memory().unwrap();
        store
            .persist_idempotency_key("live", &ActionId::new(), json!({}), 300.0)
            .await;
        store
            .persist_idempotency_key("dead", &ActionId::new(), json!({}), -1.0)
            .await;

        assert_eq!(store.prune_expired_idempotency_keys().await, 1);
        assert!(store.get_idempotency_key("live").await.is_some());
    }

    // -----------------------------------------------------------------------
    // Dead letters + restore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_dead_letter_round_trip_and_replay_flag() {
        let store = StateStore::in_memory().unwrap();
        let letter = DeadLetterRecord {
            letter_id: LetterId::new(),
            action_id: ActionId::new(),
            intent: "shell.run".to_string(),
            params: json!({"command": "Get-Item"}),
            error_code: "E500".to_string(),
            error_message: "boom".to_string(),
            failure_class: Some("execution_error".to_string()),
            correlation_id: Some("corr-1".to_string()),
            session_id: None,
            created_at: Timestamp::now(),
            retries_exhausted: 2,
            replayed: false,
            replayed_at: None,
            replay_action_id: None,
        };
        store.persist_dead_letter(&letter).await;
        assert_eq!(store.load_dead_letters().await.len(), 1);

        store
            .update_dead_letter(
                &letter.letter_id,
                DeadLetterUpdate {
                    replayed: Some(true),
                    replayed_at: Some(Timestamp::now()),
                    replay_action_id: Some(ActionId::new()),
                    ..DeadLetterUpdate::default()
                },
            )
            .await;
        assert!(store.load_dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_all_counts() {
        let store = StateStore::in_memory().unwrap();
        store.persist_session(&session("u1")).await;
        store.enqueue_outbox("memory_writeback", json!({})).await;

        let counts = store.restore_all().await;
        assert_eq!(counts.sessions, 1);
        assert_eq!(counts.confirmations, 0);
        assert_eq!(counts.dead_letters, 0);
        assert_eq!(counts.outbox_pending, 1);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway_state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.persist_session(&session("disk")).await;
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.load_active_sessions().await.len(), 1);
    }
}
