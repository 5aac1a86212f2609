//! Ordered, tracked schema migrations.
//!
//! Each migration runs at most once; applied names are recorded in the
//! `schema_migrations` table. New migrations are appended to
//! [`MIGRATIONS`] with the next number prefix and must never be edited
//! after shipping.

use rusqlite::Connection;
use tracing::info;

use crate::error::StateResult;

/// All migrations in application order.
pub const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_gateway_state",
    r"
CREATE TABLE IF NOT EXISTS sessions (
    session_id      TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    profile         TEXT NOT NULL DEFAULT 'chat_low_latency',
    status          TEXT NOT NULL DEFAULT 'active',
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    last_activity   TEXT NOT NULL,
    turn_count      INTEGER NOT NULL DEFAULT 0,
    metadata        TEXT NOT NULL DEFAULT '{}',
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS confirmations (
    confirmation_id TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL,
    turn_id         TEXT NOT NULL,
    tool_name       TEXT NOT NULL,
    args            TEXT NOT NULL DEFAULT '{}',
    summary         TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL DEFAULT 'pending',
    created_at      TEXT NOT NULL,
    ttl_seconds     REAL NOT NULL DEFAULT 120.0,
    decided_at      TEXT
);

CREATE TABLE IF NOT EXISTS dead_letters (
    letter_id         TEXT PRIMARY KEY,
    action_id         TEXT NOT NULL,
    intent            TEXT NOT NULL,
    params            TEXT NOT NULL DEFAULT '{}',
    error_code        TEXT NOT NULL,
    error_message     TEXT NOT NULL DEFAULT '',
    failure_class     TEXT,
    correlation_id    TEXT,
    session_id        TEXT,
    created_at        TEXT NOT NULL,
    retries_exhausted INTEGER NOT NULL DEFAULT 0,
    replayed          INTEGER NOT NULL DEFAULT 0,
    replayed_at       TEXT,
    replay_action_id  TEXT
);

CREATE TABLE IF NOT EXISTS outbox (
    outbox_id    TEXT PRIMARY KEY,
    entry_type   TEXT NOT NULL,
    payload      TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL,
    delivered    INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    idempotency_key TEXT PRIMARY KEY,
    action_id       TEXT NOT NULL,
    result_json     TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending
    ON outbox (delivered, created_at);
CREATE INDEX IF NOT EXISTS idx_confirmations_status
    ON confirmations (status);
CREATE INDEX IF NOT EXISTS idx_dead_letters_replayed
    ON dead_letters (replayed);
",
)];

/// Apply all pending migrations to `conn`.
///
/// # Errors
///
/// Returns the SQLite error when a migration statement fails; nothing is
/// recorded for a failed migration.
pub fn apply(conn: &Connection) -> StateResult<()> {
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
        info!(migration = name, "applied schema migration");
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
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        for table in [
            "sessions",
            "confirmations",
            "dead_letters",
            "outbox",
            "idempotency_keys",
        ] {
            let exists: bool = conn
                .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
                .unwrap()
                .exists([table])
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }
}
