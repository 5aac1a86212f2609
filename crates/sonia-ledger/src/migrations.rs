//! Ledger schema migrations, ordered and tracked.

use rusqlite::Connection;
use tracing::info;

use crate::error::LedgerResult;

/// All migrations in application order.
pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_ledger_base",
        r"
CREATE TABLE IF NOT EXISTS ledger (
    id          TEXT PRIMARY KEY,
    type        TEXT NOT NULL,
    content     TEXT NOT NULL,
    metadata    TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    archived_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    id           TEXT PRIMARY KEY,
    operation    TEXT NOT NULL,
    ledger_id    TEXT NOT NULL,
    performed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_type ON ledger (type);
CREATE INDEX IF NOT EXISTS idx_ledger_created ON ledger (created_at);
",
    ),
    (
        "0002_typed_memory",
        r"
ALTER TABLE ledger ADD COLUMN memory_subtype TEXT;
ALTER TABLE ledger ADD COLUMN valid_from TEXT;
ALTER TABLE ledger ADD COLUMN valid_until TEXT;
ALTER TABLE ledger ADD COLUMN recorded_at TEXT;
ALTER TABLE ledger ADD COLUMN superseded_by TEXT;
ALTER TABLE ledger ADD COLUMN version_chain_head TEXT;
ALTER TABLE ledger ADD COLUMN redacted INTEGER NOT NULL DEFAULT 0;
ALTER TABLE ledger ADD COLUMN validation_schema TEXT;
ALTER TABLE ledger ADD COLUMN content_format TEXT;

CREATE TABLE IF NOT EXISTS memory_conflicts (
    conflict_id     TEXT PRIMARY KEY,
    memory_id_a     TEXT NOT NULL,
    memory_id_b     TEXT NOT NULL,
    conflict_type   TEXT NOT NULL,
    severity        TEXT NOT NULL DEFAULT 'medium',
    detected_at     TEXT NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    resolved        INTEGER NOT NULL DEFAULT 0,
    resolution_note TEXT
);

CREATE TABLE IF NOT EXISTS redaction_audit (
    redaction_id TEXT PRIMARY KEY,
    memory_id    TEXT NOT NULL,
    action       TEXT NOT NULL,
    reason       TEXT NOT NULL,
    performed_at TEXT NOT NULL,
    performed_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_subtype_current
    ON ledger (memory_subtype, superseded_by, redacted);
CREATE INDEX IF NOT EXISTS idx_ledger_chain ON ledger (version_chain_head);
CREATE INDEX IF NOT EXISTS idx_conflicts_members
    ON memory_conflicts (memory_id_a, memory_id_b);
",
    ),
];

/// Apply all pending migrations to `conn`.
///
/// # Errors
///
/// Returns the SQLite error when a migration statement fails.
pub fn apply(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name       TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    for (name, sql) in MIGRATIONS {
        let applied: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE name = ?1")?
            .exists([name])?;
        if applied {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![name, sonia_core::Timestamp::now().to_iso()],
        )?;
        info!(migration = name, "applied ledger migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_typed_columns_present() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        // Insert touching every typed column
        conn.execute(
            "INSERT INTO ledger
             (id, type, content, created_at, updated_at, memory_subtype,
              valid_from, valid_until, recorded_at, superseded_by,
              version_chain_head, redacted, validation_schema, content_format)
             VALUES ('mem_x', 'knowledge', '{}', 't', 't', 'FACT',
                     NULL, NULL, 't', NULL, 'mem_x', 0, 'FACT:v1', 'json')",
            [],
        )
        .unwrap();
    }
}
