//! The memory ledger database.
//!
//! SQLite-backed, ACID, single writer behind a mutex. The API is
//! synchronous (calls are short and local); async callers hop through
//! `spawn_blocking` at their own boundary.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use sonia_core::{AuditId, MemoryId, Timestamp};

use crate::conflict::ConflictDetector;
use crate::decay::{MemoryConsolidation, MemoryDecay};
use crate::error::{LedgerError, LedgerResult};
use crate::migrations;
use crate::record::{
    ConflictRecord, MemoryRecord, QueryOutcome, RedactionAuditRecord, StoreOutcome,
    REDACTED_PLACEHOLDER,
};
use crate::schema::{MemorySubtype, TypedMemoryValidator};

/// Parameters of a budgeted query.
#[derive(Debug, Clone)]
pub struct BudgetQuery {
    /// Substring matched against content and metadata (ignored when
    /// `ordered_ids` is set).
    pub query: String,
    /// Maximum rows fetched.
    pub limit: usize,
    /// Character budget over accepted content.
    pub max_chars: usize,
    /// Restrict to these subtypes.
    pub type_filters: Option<Vec<MemorySubtype>>,
    /// Include redacted rows (content replaced by `[REDACTED]`).
    pub include_redacted: bool,
    /// Pre-ranked ids from hybrid search; ordering is preserved.
    pub ordered_ids: Option<Vec<MemoryId>>,
}

impl BudgetQuery {
    /// A plain substring query with default budget.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 10,
            max_chars: 7000,
            type_filters: None,
            include_redacted: false,
            ordered_ids: None,
        }
    }
}

/// Ledger statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    /// All rows, archived included.
    pub total_memories: u64,
    /// Non-archived rows.
    pub active_memories: u64,
    /// Active row counts per legacy type.
    pub by_type: HashMap<String, u64>,
    /// The database file, when on disk.
    pub database_path: Option<String>,
}

/// Report of one event-compaction pass.
#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    /// Rows examined.
    pub examined: usize,
    /// Originals archived.
    pub archived: usize,
    /// Summary rows written.
    pub summaries: usize,
}

/// SQLite-backed memory store with ACID guarantees.
#[derive(Clone)]
pub struct MemoryDatabase {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    validator: TypedMemoryValidator,
    detector: ConflictDetector,
    decay: MemoryDecay,
}

impl MemoryDatabase {
    /// Open (or create) the ledger at `path` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the database cannot be opened or a
    /// migration fails.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        migrations::apply(&conn)?;
        info!(path = %path.display(), "memory ledger opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            validator: TypedMemoryValidator,
            detector: ConflictDetector,
            decay: MemoryDecay::default(),
        })
    }

    /// Open an in-memory ledger (tests).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when SQLite initialization fails.
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            validator: TypedMemoryValidator,
            detector: ConflictDetector,
            decay: MemoryDecay::default(),
        })
    }

    fn configure(conn: &Connection) -> LedgerResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(())
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Internal("ledger mutex poisoned".to_string()))
    }

    /// The on-disk database file, when not in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the decay policy (defaults to exponential, 30-day
    /// half-life, 0.1 forget threshold).
    #[must_use]
    pub fn with_decay(mut self, decay: MemoryDecay) -> Self {
        self.decay = decay;
        self
    }

    /// The active decay policy.
    #[must_use]
    pub fn decay(&self) -> &MemoryDecay {
        &self.decay
    }

    /// Verify that durability pragmas are in effect. Used by the runtime
    /// gate.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the pragma reads.
    pub fn verify_pragmas(&self) -> LedgerResult<JsonValue> {
        let conn = self.lock()?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        let synchronous: i64 = conn.query_row("PRAGMA synchronous", [], |r| r.get(0))?;
        let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
        let busy_timeout: i64 = conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0))?;

        // In-memory databases cannot use WAL; on disk it is required.
        let wal_ok = journal_mode.eq_ignore_ascii_case("wal") || self.path.is_none();
        let all_ok = wal_ok && synchronous == 1 && foreign_keys == 1 && busy_timeout == 5000;
        Ok(json!({
            "journal_mode": journal_mode,
            "synchronous": synchronous,
            "foreign_keys": foreign_keys,
            "busy_timeout": busy_timeout,
            "all_ok": all_ok,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Legacy CRUD
    // ─────────────────────────────────────────────────────────────────────

    /// Store a legacy (untyped) memory. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the insert.
    pub fn store(
        &self,
        memory_type: &str,
        content: &str,
        metadata: Option<&JsonValue>,
    ) -> LedgerResult<MemoryId> {
        let memory_id = MemoryId::new();
        let now = Timestamp::now().to_iso();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ledger (id, type, content, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                memory_id.as_str(),
                memory_type,
                content,
                metadata.map(JsonValue::to_string),
                now,
                now,
            ],
        )?;
        audit(&conn, "CREATE", &memory_id, &now)?;
        info!(memory_id = memory_id.as_str(), memory_type, "stored memory");
        Ok(memory_id)
    }

    /// Retrieve a memory by id. Archived rows are invisible.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the lookup.
    pub fn get(&self, memory_id: &MemoryId) -> LedgerResult<Option<MemoryRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT * FROM ledger WHERE id = ?1 AND archived_at IS NULL",
                [memory_id.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Substring search over content and metadata, newest first.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn search(&self, query: &str, limit: usize) -> LedgerResult<Vec<MemoryRecord>> {
        let pattern = format!("%{query}%");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT l.* FROM ledger l
             WHERE l.archived_at IS NULL
               AND (l.content LIKE ?1 OR l.metadata LIKE ?1)
             ORDER BY l.created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pattern, limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Legacy update. For typed rows (`validation_schema` set) this
    /// silently redirects to [`Self::create_version`] to preserve content
    /// immutability; legacy rows update in place.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors; a redirected update that loses the
    /// supersede race returns `false` rather than erroring, matching the
    /// legacy contract.
    pub fn update(
        &self,
        memory_id: &MemoryId,
        content: Option<&str>,
        metadata: Option<&JsonValue>,
    ) -> LedgerResult<bool> {
        let existing = match self.get(memory_id)? {
            Some(r) => r,
            None => {
                warn!(memory_id = memory_id.as_str(), "memory not found for update");
                return Ok(false);
            }
        };

        if existing.validation_schema.is_some() {
            let new_content = content.unwrap_or(&existing.content);
            let new_metadata = metadata.cloned().or(existing.metadata.clone());
            match self.create_version(memory_id, new_content, new_metadata.as_ref(), None, None) {
                Ok(new_id) => {
                    info!(
                        memory_id = memory_id.as_str(),
                        new_id = new_id.as_str(),
                        "legacy update redirected to create_version"
                    );
                    Ok(true)
                }
                Err(e) => {
                    warn!(memory_id = memory_id.as_str(), error = %e, "create_version failed for legacy update");
                    Ok(false)
                }
            }
        } else {
            let now = Timestamp::now().to_iso();
            let new_content = content.unwrap_or(&existing.content);
            let new_metadata = metadata
                .map(JsonValue::to_string)
                .or_else(|| existing.metadata.as_ref().map(JsonValue::to_string));
            let conn = self.lock()?;
            conn.execute(
                "UPDATE ledger SET content = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                params![new_content, new_metadata, now, memory_id.as_str()],
            )?;
            audit(&conn, "UPDATE", memory_id, &now)?;
            Ok(true)
        }
    }

    /// Soft-delete (archive) a legacy memory.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the update.
    pub fn delete(&self, memory_id: &MemoryId) -> LedgerResult<bool> {
        let now = Timestamp::now().to_iso();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ledger SET archived_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
            params![now, memory_id.as_str()],
        )?;
        if changed == 0 {
            warn!(memory_id = memory_id.as_str(), "memory not found for delete");
            return Ok(false);
        }
        audit(&conn, "DELETE", memory_id, &now)?;
        Ok(true)
    }

    /// Id and content of every non-archived row, for search indexing.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn all_active_contents(&self) -> LedgerResult<Vec<(MemoryId, String)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, content FROM ledger WHERE archived_at IS NULL")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    MemoryId::from_string(row.get::<_, String>(0)?),
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// List active memories of a legacy type, newest first.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn list_by_type(&self, memory_type: &str, limit: usize) -> LedgerResult<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM ledger
             WHERE type = ?1 AND archived_at IS NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![memory_type, limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count of active memories.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the count.
    pub fn count(&self) -> LedgerResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger WHERE archived_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Database statistics.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scans.
    pub fn get_stats(&self) -> LedgerResult<LedgerStats> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM ledger", [], |r| r.get(0))?;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger WHERE archived_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT type, COUNT(*) FROM ledger WHERE archived_at IS NULL GROUP BY type",
        )?;
        let by_type = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(LedgerStats {
            total_memories: total as u64,
            active_memories: active as u64,
            by_type,
            database_path: self.path.as_ref().map(|p| p.display().to_string()),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed memory
    // ─────────────────────────────────────────────────────────────────────

    /// Store a typed memory with validation and conflict detection.
    ///
    /// The insert, its audit row, and any conflict rows commit in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors; validation failures are reported inside the
    /// outcome, not as errors.
    pub fn store_typed(
        &self,
        memory_type: &str,
        subtype: &str,
        content: &str,
        metadata: Option<&JsonValue>,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> LedgerResult<StoreOutcome> {
        let validation = self
            .validator
            .validate(subtype, content, valid_from, valid_until);
        if !validation.valid {
            return Ok(StoreOutcome {
                memory_id: None,
                valid: false,
                validation_errors: validation.errors,
                conflicts: Vec::new(),
            });
        }
        let parsed = validation
            .parsed
            .ok_or_else(|| LedgerError::Internal("valid outcome without parse".to_string()))?;
        // Validation guarantees the subtype parses
        let sub = MemorySubtype::from_str(subtype)
            .map_err(|e| LedgerError::Internal(e))?;

        let memory_id = MemoryId::new();
        let now = Timestamp::now().to_iso();

        let mut guard = self.lock()?;
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT INTO ledger
             (id, type, content, metadata, created_at, updated_at,
              memory_subtype, valid_from, valid_until, recorded_at,
              superseded_by, version_chain_head, redacted,
              validation_schema, content_format)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?5, NULL, ?1, 0, ?9, 'json')",
            params![
                memory_id.as_str(),
                memory_type,
                content,
                metadata.map(JsonValue::to_string),
                now,
                sub.as_str(),
                valid_from,
                valid_until,
                sub.schema_version(),
            ],
        )?;
        audit(&tx, "CREATE_TYPED", &memory_id, &now)?;

        let conflicts = self.detector.detect_conflicts(
            &tx,
            &memory_id,
            sub,
            &parsed,
            valid_from,
            valid_until,
        )?;
        tx.commit()?;

        Ok(StoreOutcome {
            memory_id: Some(memory_id),
            valid: true,
            validation_errors: Vec::new(),
            conflicts,
        })
    }

    /// Create a new version superseding `original_id`.
    ///
    /// Optimistic concurrency: the supersede update only matches while
    /// `superseded_by IS NULL`; zero rows affected rolls back the
    /// speculative insert.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] when the original is missing;
    /// [`LedgerError::AlreadySuperseded`] when a concurrent writer won the
    /// race.
    pub fn create_version(
        &self,
        original_id: &MemoryId,
        new_content: &str,
        metadata: Option<&JsonValue>,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> LedgerResult<MemoryId> {
        let now = Timestamp::now().to_iso();
        let new_id = MemoryId::new();

        let mut guard = self.lock()?;
        let tx = guard.transaction()?;

        let original = tx
            .query_row(
                "SELECT type, memory_subtype, version_chain_head, validation_schema, content_format
                 FROM ledger WHERE id = ?1",
                [original_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        let (memory_type, subtype, chain_head, validation_schema, content_format) =
            original.ok_or_else(|| LedgerError::NotFound(original_id.to_string()))?;

        let chain_head = chain_head.unwrap_or_else(|| original_id.as_str().to_string());
        let content_format = content_format.unwrap_or_else(|| "json".to_string());

        // Insert the new version first; the supersede CAS decides whether
        // it survives.
        tx.execute(
            "INSERT INTO ledger
             (id, type, content, metadata, created_at, updated_at,
              memory_subtype, valid_from, valid_until, recorded_at,
              superseded_by, version_chain_head, redacted,
              validation_schema, content_format)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?5, NULL, ?9, 0, ?10, ?11)",
            params![
                new_id.as_str(),
                memory_type,
                new_content,
                metadata.map(JsonValue::to_string),
                now,
                subtype,
                valid_from,
                valid_until,
                chain_head,
                validation_schema,
                content_format,
            ],
        )?;

        let changed = tx.execute(
            "UPDATE ledger SET superseded_by = ?1, updated_at = ?2
             WHERE id = ?3 AND superseded_by IS NULL",
            params![new_id.as_str(), now, original_id.as_str()],
        )?;
        if changed == 0 {
            tx.execute("DELETE FROM ledger WHERE id = ?1", [new_id.as_str()])?;
            tx.commit()?;
            return Err(LedgerError::AlreadySuperseded(original_id.to_string()));
        }

        audit(&tx, "CREATE_VERSION", &new_id, &now)?;
        tx.commit()?;
        Ok(new_id)
    }

    /// Ordered version history for the chain containing `memory_id`.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan; an unknown id yields an empty
    /// history.
    pub fn get_version_history(&self, memory_id: &MemoryId) -> LedgerResult<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let chain_head: Option<Option<String>> = conn
            .query_row(
                "SELECT version_chain_head FROM ledger WHERE id = ?1",
                [memory_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(head) = chain_head else {
            return Ok(Vec::new());
        };
        let head = head.unwrap_or_else(|| memory_id.as_str().to_string());

        let mut stmt = conn.prepare(
            "SELECT * FROM ledger
             WHERE version_chain_head = ?1
             ORDER BY COALESCE(recorded_at, created_at) ASC",
        )?;
        let rows = stmt
            .query_map([head], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The current (non-superseded) version of a chain.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the lookup.
    pub fn get_current_version(&self, chain_head: &MemoryId) -> LedgerResult<Option<MemoryRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT * FROM ledger
                 WHERE version_chain_head = ?1 AND superseded_by IS NULL
                 LIMIT 1",
                [chain_head.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Budgeted query with first-row bypass.
    ///
    /// Iterates fetched rows accumulating content length; stops before a
    /// row that would exceed `max_chars` unless nothing has been accepted
    /// yet. The ordering is the contract: with `ordered_ids`, hybrid rank
    /// is preserved; otherwise recency wins.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn query_with_budget(&self, request: &BudgetQuery) -> LedgerResult<QueryOutcome> {
        let conn = self.lock()?;
        let mut sql;
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ordered) = &request.ordered_ids {
            let placeholders = vec!["?"; ordered.len().max(1)].join(",");
            sql = format!(
                "SELECT * FROM ledger WHERE id IN ({placeholders}) AND archived_at IS NULL"
            );
            if ordered.is_empty() {
                values.push(Box::new(String::new()));
            } else {
                for id in ordered {
                    values.push(Box::new(id.as_str().to_string()));
                }
            }
        } else {
            sql = "SELECT * FROM ledger
                   WHERE archived_at IS NULL
                   AND (content LIKE ? OR metadata LIKE ?)"
                .to_string();
            let pattern = format!("%{}%", request.query);
            values.push(Box::new(pattern.clone()));
            values.push(Box::new(pattern));
        }

        sql.push_str(" AND superseded_by IS NULL");
        if !request.include_redacted {
            sql.push_str(" AND (redacted = 0 OR redacted IS NULL)");
        }
        if let Some(filters) = &request.type_filters {
            if !filters.is_empty() {
                let placeholders = vec!["?"; filters.len()].join(",");
                sql.push_str(&format!(" AND memory_subtype IN ({placeholders})"));
                for f in filters {
                    values.push(Box::new(f.as_str().to_string()));
                }
            }
        }

        if let Some(ordered) = &request.ordered_ids {
            // Preserve hybrid search ordering
            let mut order = String::from(" ORDER BY CASE id ");
            for (i, id) in ordered.iter().enumerate() {
                order.push_str(&format!("WHEN ? THEN {i} "));
                values.push(Box::new(id.as_str().to_string()));
            }
            order.push_str(&format!("ELSE {} END", ordered.len()));
            sql.push_str(&order);
        } else {
            sql.push_str(" ORDER BY COALESCE(recorded_at, created_at) DESC");
        }
        sql.push_str(" LIMIT ?");
        values.push(Box::new(request.limit as i64));

        let params_ref: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // Character budget with first-row bypass; rows whose decay score
        // has fallen below the forget threshold never surface
        let mut results = Vec::new();
        let mut budget_used = 0usize;
        let mut truncated = false;
        for mut record in rows {
            if self.decay.should_forget_record(&record) {
                debug!(memory_id = record.id.as_str(), "row forgotten by decay");
                continue;
            }
            if record.redacted {
                record.content = REDACTED_PLACEHOLDER.to_string();
            }
            let content_len = record.content.len();
            if budget_used + content_len > request.max_chars && !results.is_empty() {
                truncated = true;
                break;
            }
            budget_used += content_len;
            results.push(record);
        }

        Ok(QueryOutcome {
            count: results.len(),
            results,
            budget_used,
            budget_limit: request.max_chars,
            truncated,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────

    /// List conflicts, optionally filtered by member id and resolution.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn get_conflicts(
        &self,
        memory_id: Option<&MemoryId>,
        resolved: Option<bool>,
        limit: usize,
    ) -> LedgerResult<Vec<ConflictRecord>> {
        let conn = self.lock()?;
        let mut sql = "SELECT * FROM memory_conflicts WHERE 1=1".to_string();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = memory_id {
            sql.push_str(" AND (memory_id_a = ? OR memory_id_b = ?)");
            values.push(Box::new(id.as_str().to_string()));
            values.push(Box::new(id.as_str().to_string()));
        }
        if let Some(resolved) = resolved {
            sql.push_str(" AND resolved = ?");
            values.push(Box::new(i64::from(resolved)));
        }
        sql.push_str(" ORDER BY detected_at DESC LIMIT ?");
        values.push(Box::new(limit as i64));

        let params_ref: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), row_to_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark a conflict as resolved. Returns `false` when already resolved
    /// or unknown.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the update.
    pub fn resolve_conflict(&self, conflict_id: &str, note: &str) -> LedgerResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE memory_conflicts SET resolved = 1, resolution_note = ?1
             WHERE conflict_id = ?2 AND resolved = 0",
            params![note, conflict_id],
        )?;
        Ok(changed > 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Redaction
    // ─────────────────────────────────────────────────────────────────────

    /// Redact a memory. Chain pointers are preserved; a governance audit
    /// row is appended. Returns `false` when already redacted or unknown.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the update.
    pub fn redact(&self, memory_id: &MemoryId, reason: &str, performer: &str) -> LedgerResult<bool> {
        let now = Timestamp::now().to_iso();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ledger SET redacted = 1, updated_at = ?1 WHERE id = ?2 AND redacted = 0",
            params![now, memory_id.as_str()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        redaction_audit(&conn, memory_id, "REDACT", reason, &now, performer)?;
        Ok(true)
    }

    /// Unredact a memory. Admin operation, also audited.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the update.
    pub fn unredact(&self, memory_id: &MemoryId, performer: &str) -> LedgerResult<bool> {
        let now = Timestamp::now().to_iso();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ledger SET redacted = 0, updated_at = ?1 WHERE id = ?2 AND redacted = 1",
            params![now, memory_id.as_str()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        redaction_audit(&conn, memory_id, "UNREDACT", "admin_unredact", &now, performer)?;
        Ok(true)
    }

    /// The redaction audit trail for a memory, oldest first.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan.
    pub fn get_redaction_audit(
        &self,
        memory_id: &MemoryId,
    ) -> LedgerResult<Vec<RedactionAuditRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT redaction_id, memory_id, action, reason, performed_at, performed_by
             FROM redaction_audit WHERE memory_id = ?1 ORDER BY performed_at ASC",
        )?;
        let rows = stmt
            .query_map([memory_id.as_str()], |row| {
                Ok(RedactionAuditRecord {
                    redaction_id: row.get(0)?,
                    memory_id: MemoryId::from_string(row.get::<_, String>(1)?),
                    action: row.get(2)?,
                    reason: row.get(3)?,
                    performed_at: parse_ts(row.get::<_, String>(4)?)?,
                    performed_by: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Decay maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Archive every active row whose decay score has fallen below the
    /// forget threshold. Returns the archived ids.
    ///
    /// Forgotten rows are already invisible to queries; this sweep moves
    /// them to the soft archive so storage and indexes stop carrying
    /// them.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan or the archive updates.
    pub fn archive_forgotten(&self) -> LedgerResult<Vec<MemoryId>> {
        let candidates = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT * FROM ledger WHERE archived_at IS NULL")?;
            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let outcome = self.decay.compute_batch_decay(candidates);
        let mut archived = Vec::with_capacity(outcome.forgotten.len());
        for record in outcome.forgotten {
            if self.delete(&record.id)? {
                archived.push(record.id);
            }
        }
        if !archived.is_empty() {
            info!(count = archived.len(), "forgotten memories archived");
        }
        Ok(archived)
    }

    /// Compact old event rows of one legacy type: events past
    /// `days_threshold` are consolidated into a single summary row per
    /// event type and the originals are archived.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan, the summary insert, or the
    /// archive updates.
    pub fn compact_events(
        &self,
        memory_type: &str,
        days_threshold: u32,
    ) -> LedgerResult<CompactReport> {
        let rows = self.list_by_type(memory_type, 10_000)?;
        let examined = rows.len();

        let events: Vec<JsonValue> = rows
            .iter()
            .map(|record| {
                json!({
                    "event_type": memory_type,
                    "timestamp": record.created_at.to_iso(),
                    "id": record.id,
                    "content": record.content,
                })
            })
            .collect();

        let compressed = MemoryConsolidation::compress_old_events(&events, days_threshold);
        if compressed.archived.is_empty() {
            return Ok(CompactReport {
                examined,
                archived: 0,
                summaries: 0,
            });
        }

        let consolidated = MemoryConsolidation::consolidate_similar(&compressed.archived);
        let summary_type = format!("{memory_type}_summary");
        let mut summaries = 0usize;
        for group in &consolidated {
            self.store(&summary_type, &group.to_string(), None)?;
            summaries += 1;
        }

        let mut archived = 0usize;
        for event in &compressed.archived {
            if let Some(id) = event["id"].as_str() {
                if self.delete(&MemoryId::from_string(id))? {
                    archived += 1;
                }
            }
        }

        info!(examined, archived, summaries, memory_type, "event compaction");
        Ok(CompactReport {
            examined,
            archived,
            summaries,
        })
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Row mapping + audit helpers
// ---------------------------------------------------------------------------

fn audit(conn: &Connection, operation: &str, memory_id: &MemoryId, now: &str) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO audit_log (id, operation, ledger_id, performed_at) VALUES (?1, ?2, ?3, ?4)",
        params![AuditId::new().as_str(), operation, memory_id.as_str(), now],
    )?;
    Ok(())
}

fn redaction_audit(
    conn: &Connection,
    memory_id: &MemoryId,
    action: &str,
    reason: &str,
    now: &str,
    performer: &str,
) -> LedgerResult<()> {
    let redaction_id = format!("redact_{}", &uuid_tail());
    conn.execute(
        "INSERT INTO redaction_audit
         (redaction_id, memory_id, action, reason, performed_at, performed_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![redaction_id, memory_id.as_str(), action, reason, now, performer],
    )?;
    Ok(())
}

fn uuid_tail() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..12].to_string()
}

fn parse_ts(raw: String) -> rusqlite::Result<Timestamp> {
    Timestamp::parse_iso(&raw, "timestamp").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<Timestamp>> {
    raw.map(parse_ts).transpose()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let metadata: Option<String> = row.get("metadata")?;
    Ok(MemoryRecord {
        id: MemoryId::from_string(row.get::<_, String>("id")?),
        record_type: row.get("type")?,
        content: row.get("content")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_ts(row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(row.get::<_, String>("updated_at")?)?,
        archived_at: parse_opt_ts(row.get::<_, Option<String>>("archived_at")?)?,
        memory_subtype: row.get("memory_subtype")?,
        valid_from: row.get("valid_from")?,
        valid_until: row.get("valid_until")?,
        recorded_at: parse_opt_ts(row.get::<_, Option<String>>("recorded_at")?)?,
        superseded_by: row
            .get::<_, Option<String>>("superseded_by")?
            .map(MemoryId::from_string),
        version_chain_head: row
            .get::<_, Option<String>>("version_chain_head")?
            .map(MemoryId::from_string),
        redacted: row.get::<_, Option<i64>>("redacted")?.unwrap_or(0) != 0,
        validation_schema: row.get("validation_schema")?,
        content_format: row.get("content_format")?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let metadata: String = row.get("metadata")?;
    Ok(ConflictRecord {
        conflict_id: sonia_core::ConflictId::from_string(row.get::<_, String>("conflict_id")?),
        memory_id_a: MemoryId::from_string(row.get::<_, String>("memory_id_a")?),
        memory_id_b: MemoryId::from_string(row.get::<_, String>("memory_id_b")?),
        conflict_type: row.get("conflict_type")?,
        severity: row.get("severity")?,
        detected_at: parse_ts(row.get::<_, String>("detected_at")?)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(JsonValue::Null),
        resolved: row.get::<_, i64>("resolved")? != 0,
        resolution_note: row.get("resolution_note")?,
    })
}
