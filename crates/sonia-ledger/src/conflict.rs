//! Identity-key conflict detection.
//!
//! Runs inside the storing transaction so a conflicting pair and its
//! conflict rows commit atomically. Only FACT and PREFERENCE have
//! identity keys; other subtypes never conflict.

use rusqlite::Connection;
use serde_json::{json, Value as JsonValue};
use sonia_core::{ConflictId, MemoryId, Timestamp};
use tracing::debug;

use crate::error::LedgerResult;
use crate::record::ConflictRecord;
use crate::schema::MemorySubtype;

/// Detects conflicts between a newly inserted record and existing current
/// (non-superseded, non-redacted, json-format) records.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Run detection for `memory_id` and insert conflict rows for every
    /// hit. Returns the detected conflicts.
    ///
    /// # Errors
    ///
    /// Returns SQLite errors from the scan or the conflict inserts.
    pub fn detect_conflicts(
        &self,
        conn: &Connection,
        memory_id: &MemoryId,
        subtype: MemorySubtype,
        content: &JsonValue,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> LedgerResult<Vec<ConflictRecord>> {
        let mut conflicts = match subtype {
            MemorySubtype::Fact => {
                self.detect_fact_conflicts(conn, memory_id, content, valid_from, valid_until)?
            }
            MemorySubtype::Preference => {
                self.detect_preference_conflicts(conn, memory_id, content)?
            }
            _ => Vec::new(),
        };

        for conflict in &mut conflicts {
            conn.execute(
                "INSERT INTO memory_conflicts
                 (conflict_id, memory_id_a, memory_id_b, conflict_type, severity, detected_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    conflict.conflict_id.as_str(),
                    conflict.memory_id_a.as_str(),
                    conflict.memory_id_b.as_str(),
                    conflict.conflict_type,
                    conflict.severity,
                    conflict.detected_at.to_iso(),
                    conflict.metadata.to_string(),
                ],
            )?;
            debug!(
                conflict_id = conflict.conflict_id.as_str(),
                conflict_type = conflict.conflict_type,
                "conflict recorded"
            );
        }

        Ok(conflicts)
    }

    /// FACT conflicts: same `(subject, predicate)`, different `object`,
    /// overlapping temporal windows, both confidences above 0.5.
    fn detect_fact_conflicts(
        &self,
        conn: &Connection,
        memory_id: &MemoryId,
        content: &JsonValue,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> LedgerResult<Vec<ConflictRecord>> {
        let subject = content["subject"].as_str().unwrap_or_default();
        let predicate = content["predicate"].as_str().unwrap_or_default();
        let object = content["object"].as_str().unwrap_or_default();
        let confidence = content["confidence"].as_f64().unwrap_or(1.0);

        if confidence <= 0.5 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT id, content, valid_from, valid_until
             FROM ledger
             WHERE memory_subtype = 'FACT'
               AND superseded_by IS NULL
               AND redacted = 0
               AND content_format = 'json'
               AND id != ?1",
        )?;
        let rows = stmt
            .query_map([memory_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut conflicts = Vec::new();
        for (existing_id, existing_content, existing_from, existing_until) in rows {
            let Ok(existing) = serde_json::from_str::<JsonValue>(&existing_content) else {
                continue;
            };

            if existing["subject"].as_str() != Some(subject)
                || existing["predicate"].as_str() != Some(predicate)
            {
                continue;
            }
            // Same object means the records agree
            if existing["object"].as_str() == Some(object) {
                continue;
            }
            if existing["confidence"].as_f64().unwrap_or(1.0) <= 0.5 {
                continue;
            }

            // Untimed on either side skips the overlap check but still
            // conflicts; two bounded windows must actually overlap.
            let new_untimed = valid_from.is_none() && valid_until.is_none();
            let existing_untimed = existing_from.is_none() && existing_until.is_none();
            if !new_untimed
                && !existing_untimed
                && !ranges_overlap(
                    valid_from,
                    valid_until,
                    existing_from.as_deref(),
                    existing_until.as_deref(),
                )
            {
                continue;
            }

            conflicts.push(ConflictRecord {
                conflict_id: ConflictId::new(),
                memory_id_a: memory_id.clone(),
                memory_id_b: MemoryId::from_string(existing_id),
                conflict_type: "FACT_CONTRADICTION".to_string(),
                severity: "high".to_string(),
                detected_at: Timestamp::now(),
                metadata: json!({
                    "identity_key": format!("{subject}:{predicate}"),
                    "new_object": object,
                    "existing_object": existing["object"],
                }),
                resolved: false,
                resolution_note: None,
            });
        }
        Ok(conflicts)
    }

    /// PREFERENCE conflicts: same `(category, key)`, different `value`.
    fn detect_preference_conflicts(
        &self,
        conn: &Connection,
        memory_id: &MemoryId,
        content: &JsonValue,
    ) -> LedgerResult<Vec<ConflictRecord>> {
        let category = content["category"].as_str().unwrap_or_default();
        let key = content["key"].as_str().unwrap_or_default();
        let value = content["value"].as_str().unwrap_or_default();

        let mut stmt = conn.prepare(
            "SELECT id, content
             FROM ledger
             WHERE memory_subtype = 'PREFERENCE'
               AND superseded_by IS NULL
               AND redacted = 0
               AND content_format = 'json'
               AND id != ?1",
        )?;
        let rows = stmt
            .query_map([memory_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut conflicts = Vec::new();
        for (existing_id, existing_content) in rows {
            let Ok(existing) = serde_json::from_str::<JsonValue>(&existing_content) else {
                continue;
            };
            if existing["category"].as_str() != Some(category)
                || existing["key"].as_str() != Some(key)
            {
                continue;
            }
            // Same value is a duplicate, not a conflict
            if existing["value"].as_str() == Some(value) {
                continue;
            }

            conflicts.push(ConflictRecord {
                conflict_id: ConflictId::new(),
                memory_id_a: memory_id.clone(),
                memory_id_b: MemoryId::from_string(existing_id),
                conflict_type: "PREFERENCE_CONFLICT".to_string(),
                severity: "medium".to_string(),
                detected_at: Timestamp::now(),
                metadata: json!({
                    "identity_key": format!("{category}:{key}"),
                    "new_value": value,
                    "existing_value": existing["value"],
                }),
                resolved: false,
                resolution_note: None,
            });
        }
        Ok(conflicts)
    }
}

/// Half-open range overlap over ISO strings; a missing bound is unbounded
/// in that direction. Lexical comparison is correct for the fixed ISO
/// format.
fn ranges_overlap(
    from_a: Option<&str>,
    until_a: Option<&str>,
    from_b: Option<&str>,
    until_b: Option<&str>,
) -> bool {
    const MAX: &str = "9999-12-31T23:59:59Z";
    let a_start = from_a.unwrap_or("");
    let b_start = from_b.unwrap_or("");
    let a_end = until_a.unwrap_or(MAX);
    let b_end = until_b.unwrap_or(MAX);
    a_start < b_end && b_start < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_basic() {
        assert!(ranges_overlap(
            Some("2024-01-01T00:00:00Z"),
            Some("2025-01-01T00:00:00Z"),
            Some("2024-06-01T00:00:00Z"),
            Some("2025-06-01T00:00:00Z"),
        ));
    }

    #[test]
    fn test_disjoint_ranges() {
        assert!(!ranges_overlap(
            Some("2024-01-01T00:00:00Z"),
            Some("2024-06-01T00:00:00Z"),
            Some("2024-06-01T00:00:00Z"),
            Some("2025-01-01T00:00:00Z"),
        ));
    }

    #[test]
    fn test_open_ended_overlaps() {
        assert!(ranges_overlap(
            Some("2024-01-01T00:00:00Z"),
            None,
            Some("2030-01-01T00:00:00Z"),
            None,
        ));
        assert!(ranges_overlap(None, Some("2024-01-01T00:00:00Z"), None, None));
    }
}
