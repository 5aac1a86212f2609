//! Memory decay, forgetting, and consolidation.
//!
//! A decay score in `[0, 1]` (0 = forgotten, 1 = fresh) is computed from
//! a record's age, its access count (accessed items fade slower), and an
//! initial relevance weight. Scores below the forget threshold drop the
//! record from query results and let the maintenance sweep archive it.
//! Consolidation groups dict-shaped event payloads by type and splits
//! old events out for archival.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;
use tracing::{info, warn};

use sonia_core::Timestamp;

use crate::record::MemoryRecord;

/// How a memory's base decay falls off with age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayStrategy {
    /// Half-life falloff: `exp(-ln2 / half_life * age)`.
    Exponential,
    /// Straight line to zero at `half_life_days`.
    Linear,
    /// Full score inside `half_life_days`, zero beyond it.
    Threshold,
}

impl DecayStrategy {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Threshold => "threshold",
        }
    }
}

impl FromStr for DecayStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "threshold" => Ok(Self::Threshold),
            other => Err(format!("unknown decay strategy: {other}")),
        }
    }
}

/// A record paired with its computed decay score.
#[derive(Debug, Clone)]
pub struct DecayedRecord {
    /// The retained record.
    pub record: MemoryRecord,
    /// Its decay score at evaluation time.
    pub decay_score: f64,
}

/// Result of a batch decay pass.
#[derive(Debug, Default)]
pub struct BatchDecayOutcome {
    /// Records above the forget threshold, with their scores.
    pub retained: Vec<DecayedRecord>,
    /// Records below the forget threshold.
    pub forgotten: Vec<MemoryRecord>,
}

/// Result of blending decay into a relevance score.
#[derive(Debug, Clone, Copy)]
pub struct RankAdjustment {
    /// The blended relevance.
    pub relevance: f64,
    /// The decay score that fed the blend.
    pub decay_factor: f64,
}

/// Decay and forgetting engine for memory records.
#[derive(Debug, Clone)]
pub struct MemoryDecay {
    strategy: DecayStrategy,
    half_life_days: f64,
    threshold_score: f64,
    lambda_exp: f64,
}

impl MemoryDecay {
    /// Build a decay engine.
    #[must_use]
    pub fn new(strategy: DecayStrategy, half_life_days: f64, threshold_score: f64) -> Self {
        Self {
            strategy,
            half_life_days,
            threshold_score,
            lambda_exp: std::f64::consts::LN_2 / half_life_days,
        }
    }

    /// The forget threshold.
    #[must_use]
    pub fn threshold_score(&self) -> f64 {
        self.threshold_score
    }

    /// Decay score for an item created at `created`, evaluated now.
    #[must_use]
    pub fn compute_decay_score(&self, created: Timestamp, access_count: u32, relevance: f64) -> f64 {
        self.compute_decay_score_at(created, access_count, relevance, Timestamp::now())
    }

    /// Decay score evaluated at an explicit instant.
    #[must_use]
    pub fn compute_decay_score_at(
        &self,
        created: Timestamp,
        access_count: u32,
        relevance: f64,
        current: Timestamp,
    ) -> f64 {
        let age_days = (current.0 - created.0).num_milliseconds() as f64 / 86_400_000.0;

        let decay = match self.strategy {
            DecayStrategy::Exponential => (-self.lambda_exp * age_days).exp(),
            DecayStrategy::Linear => (1.0 - age_days / self.half_life_days).max(0.0),
            DecayStrategy::Threshold => {
                if age_days < self.half_life_days {
                    1.0
                } else {
                    0.0
                }
            }
        };

        // Accessed items fade slower
        let access_boost = (1.0 + f64::from(access_count) * 0.1).min(2.0);
        (decay * access_boost * relevance).clamp(0.0, 1.0)
    }

    /// Whether an item's score has fallen below the forget threshold.
    #[must_use]
    pub fn should_forget(&self, created: Timestamp, access_count: u32, relevance: f64) -> bool {
        self.compute_decay_score(created, access_count, relevance) < self.threshold_score
    }

    /// Whether a ledger record should be forgotten, reading its access
    /// count and relevance from metadata.
    #[must_use]
    pub fn should_forget_record(&self, record: &MemoryRecord) -> bool {
        self.should_forget(
            effective_created(record),
            access_count_of(record),
            relevance_of(record),
        )
    }

    /// Apply decay to a batch of records, splitting retained from
    /// forgotten.
    #[must_use]
    pub fn compute_batch_decay(&self, records: Vec<MemoryRecord>) -> BatchDecayOutcome {
        let mut outcome = BatchDecayOutcome::default();
        for record in records {
            let created = effective_created(&record);
            let access_count = access_count_of(&record);
            let relevance = relevance_of(&record);
            let decay_score = self.compute_decay_score(created, access_count, relevance);

            if decay_score < self.threshold_score {
                outcome.forgotten.push(record);
            } else {
                outcome.retained.push(DecayedRecord {
                    record,
                    decay_score,
                });
            }
        }
        info!(
            retained = outcome.retained.len(),
            forgotten = outcome.forgotten.len(),
            "applied decay"
        );
        outcome
    }

    /// Blend decay into a relevance score so recent, frequently-accessed
    /// items rank higher.
    #[must_use]
    pub fn adjust_relevance(
        &self,
        created: Timestamp,
        access_count: u32,
        original_relevance: f64,
        decay_weight: f64,
    ) -> RankAdjustment {
        let decay_factor = self.compute_decay_score(created, access_count, 1.0);
        RankAdjustment {
            relevance: (1.0 - decay_weight) * original_relevance + decay_weight * decay_factor,
            decay_factor,
        }
    }
}

impl Default for MemoryDecay {
    fn default() -> Self {
        Self::new(DecayStrategy::Exponential, 30.0, 0.1)
    }
}

/// Observation time when present, insert time otherwise.
fn effective_created(record: &MemoryRecord) -> Timestamp {
    record.recorded_at.unwrap_or(record.created_at)
}

/// `access_count` from the record's metadata bag, zero when absent.
fn access_count_of(record: &MemoryRecord) -> u32 {
    record
        .metadata
        .as_ref()
        .and_then(|m| m["access_count"].as_u64())
        .map_or(0, |n| n.min(u64::from(u32::MAX)) as u32)
}

/// `relevance` from the record's metadata bag, `1.0` when absent.
fn relevance_of(record: &MemoryRecord) -> f64 {
    record
        .metadata
        .as_ref()
        .and_then(|m| m["relevance"].as_f64())
        .unwrap_or(1.0)
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

/// Old and recent events separated by [`MemoryConsolidation::compress_old_events`].
#[derive(Debug, Default)]
pub struct CompressedEvents {
    /// Events younger than the threshold.
    pub recent: Vec<JsonValue>,
    /// Events old enough to archive.
    pub archived: Vec<JsonValue>,
}

/// Consolidates and compresses dict-shaped event payloads over time.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryConsolidation;

impl MemoryConsolidation {
    /// Consolidate similar events by grouping on `event_type`. Groups
    /// with more than one member collapse into a summary item carrying
    /// the count and the originals; singletons pass through unchanged.
    #[must_use]
    pub fn consolidate_similar(items: &[JsonValue]) -> Vec<JsonValue> {
        if items.is_empty() {
            return Vec::new();
        }

        // Group in first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut groups: std::collections::HashMap<String, Vec<JsonValue>> =
            std::collections::HashMap::new();
        for item in items {
            let key = item["event_type"].as_str().unwrap_or("unknown").to_string();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(item.clone());
        }

        let mut result = Vec::new();
        for key in order {
            let members = groups.remove(&key).unwrap_or_default();
            if members.len() > 1 {
                result.push(json!({
                    "event_type": key,
                    "count": members.len(),
                    "consolidated": true,
                    "items": members,
                }));
            } else {
                result.extend(members);
            }
        }
        info!(input = items.len(), output = result.len(), "consolidated events");
        result
    }

    /// Separate old events (archivable) from recent ones by the
    /// `timestamp` field. Events with a missing or unparseable timestamp
    /// stay recent.
    #[must_use]
    pub fn compress_old_events(items: &[JsonValue], days_threshold: u32) -> CompressedEvents {
        let now = Timestamp::now();
        let mut compressed = CompressedEvents::default();

        for item in items {
            let archived = item["timestamp"]
                .as_str()
                .and_then(|raw| match Timestamp::parse_iso(raw, "timestamp") {
                    Ok(ts) => Some(ts),
                    Err(e) => {
                        warn!(error = e, "event timestamp parse failed");
                        None
                    }
                })
                .is_some_and(|ts| {
                    let age_days = (now.0 - ts.0).num_milliseconds() as f64 / 86_400_000.0;
                    age_days >= f64::from(days_threshold)
                });

            if archived {
                compressed.archived.push(item.clone());
            } else {
                compressed.recent.push(item.clone());
            }
        }
        info!(
            recent = compressed.recent.len(),
            archived = compressed.archived.len(),
            "compressed events"
        );
        compressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(value: &str) -> Timestamp {
        Timestamp::parse_iso(value, "test").unwrap()
    }

    fn days_ago(days: i64) -> Timestamp {
        Timestamp::now().plus(Duration::days(-days))
    }

    fn record(created: Timestamp, metadata: Option<JsonValue>) -> MemoryRecord {
        MemoryRecord {
            id: sonia_core::MemoryId::new(),
            record_type: "event".to_string(),
            content: "{}".to_string(),
            metadata,
            created_at: created,
            updated_at: created,
            archived_at: None,
            memory_subtype: None,
            valid_from: None,
            valid_until: None,
            recorded_at: Some(created),
            superseded_by: None,
            version_chain_head: None,
            redacted: false,
            validation_schema: None,
            content_format: None,
        }
    }

    // -----------------------------------------------------------------------
    // Decay strategies
    // -----------------------------------------------------------------------

    #[test]
    fn test_exponential_decay() {
        let decay = MemoryDecay::new(DecayStrategy::Exponential, 30.0, 0.1);
        let current = ts("2024-01-31T00:00:00Z");

        // Fresh item
        let score = decay.compute_decay_score_at(current, 0, 1.0, current);
        assert!(score > 0.9);

        // One half-life ago is exactly 0.5
        let score =
            decay.compute_decay_score_at(ts("2024-01-01T00:00:00Z"), 0, 1.0, current);
        assert!((0.4..0.6).contains(&score));
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_linear_decay() {
        let decay = MemoryDecay::new(DecayStrategy::Linear, 30.0, 0.1);
        let current = ts("2024-01-16T00:00:00Z");

        let score = decay.compute_decay_score_at(current, 0, 1.0, current);
        assert!(score > 0.95);

        // Half the half-life elapsed is exactly 0.5
        let score =
            decay.compute_decay_score_at(ts("2024-01-01T00:00:00Z"), 0, 1.0, current);
        assert!((0.45..0.55).contains(&score));
    }

    #[test]
    fn test_threshold_decay() {
        let decay = MemoryDecay::new(DecayStrategy::Threshold, 30.0, 0.1);
        let current = ts("2024-02-10T00:00:00Z");

        let score = decay.compute_decay_score_at(current, 0, 1.0, current);
        assert!((score - 1.0).abs() < f64::EPSILON);

        // 40 days old, beyond the 30-day threshold
        let score =
            decay.compute_decay_score_at(ts("2024-01-01T00:00:00Z"), 0, 1.0, current);
        assert!(score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_access_boost_slows_fade() {
        let decay = MemoryDecay::new(DecayStrategy::Exponential, 30.0, 0.1);
        let created = ts("2024-01-01T00:00:00Z");
        let current = ts("2024-01-21T00:00:00Z");

        let unaccessed = decay.compute_decay_score_at(created, 0, 1.0, current);
        let accessed = decay.compute_decay_score_at(created, 5, 1.0, current);
        assert!(accessed > unaccessed);
    }

    #[test]
    fn test_access_boost_capped() {
        let decay = MemoryDecay::new(DecayStrategy::Exponential, 30.0, 0.1);
        let created = ts("2024-01-01T00:00:00Z");
        let current = ts("2024-03-01T00:00:00Z");

        let many = decay.compute_decay_score_at(created, 10, 1.0, current);
        let more = decay.compute_decay_score_at(created, 100, 1.0, current);
        assert!((many - more).abs() < f64::EPSILON);
    }

    #[test]
    fn test_relevance_weights_score() {
        let decay = MemoryDecay::new(DecayStrategy::Threshold, 30.0, 0.1);
        let current = ts("2024-01-02T00:00:00Z");
        let score =
            decay.compute_decay_score_at(ts("2024-01-01T00:00:00Z"), 0, 0.3, current);
        assert!((score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamped_to_unit_range() {
        let decay = MemoryDecay::new(DecayStrategy::Exponential, 30.0, 0.1);
        let current = ts("2024-01-02T00:00:00Z");
        // Heavy access boost on a fresh item cannot exceed 1
        let score =
            decay.compute_decay_score_at(ts("2024-01-01T23:00:00Z"), 10, 1.0, current);
        assert!(score <= 1.0);
    }

    // -----------------------------------------------------------------------
    // Forgetting
    // -----------------------------------------------------------------------

    #[test]
    fn test_should_forget() {
        let decay = MemoryDecay::new(DecayStrategy::Linear, 30.0, 0.3);

        assert!(!decay.should_forget(Timestamp::now(), 0, 1.0));
        assert!(decay.should_forget(days_ago(100), 0, 1.0));
    }

    #[test]
    fn test_compute_batch_decay_splits_retained_and_forgotten() {
        let decay = MemoryDecay::new(DecayStrategy::Linear, 30.0, 0.3);
        let fresh = record(Timestamp::now(), None);
        let fresh_id = fresh.id.clone();
        let stale = record(days_ago(100), None);

        let outcome = decay.compute_batch_decay(vec![fresh, stale]);
        assert_eq!(outcome.retained.len(), 1);
        assert_eq!(outcome.retained[0].record.id, fresh_id);
        assert!(outcome.retained[0].decay_score > 0.9);
        assert_eq!(outcome.forgotten.len(), 1);
    }

    #[test]
    fn test_metadata_overrides_feed_forgetting() {
        let decay = MemoryDecay::new(DecayStrategy::Linear, 30.0, 0.3);
        // 20 days old: base score ~0.33 survives, but a low relevance
        // weight pushes it under the threshold
        let low_relevance = record(days_ago(20), Some(json!({"relevance": 0.5})));
        assert!(decay.should_forget_record(&low_relevance));

        // The same record with accesses survives
        let accessed = record(
            days_ago(20),
            Some(json!({"relevance": 0.5, "access_count": 10})),
        );
        assert!(!decay.should_forget_record(&accessed));
    }

    // -----------------------------------------------------------------------
    // Ranking adjustment
    // -----------------------------------------------------------------------

    #[test]
    fn test_adjust_ranking_prefers_fresh() {
        let decay = MemoryDecay::new(DecayStrategy::Exponential, 30.0, 0.1);

        // Fresh, low-relevance item vs old, high-relevance item
        let fresh = decay.adjust_relevance(Timestamp::now(), 0, 0.5, 0.5);
        let old = decay.adjust_relevance(days_ago(50), 0, 0.9, 0.5);

        assert!(fresh.relevance > old.relevance);
        assert!(fresh.decay_factor > old.decay_factor);
    }

    #[test]
    fn test_adjust_ranking_zero_weight_is_identity() {
        let decay = MemoryDecay::default();
        let adjusted = decay.adjust_relevance(days_ago(50), 0, 0.9, 0.0);
        assert!((adjusted.relevance - 0.9).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Consolidation
    // -----------------------------------------------------------------------

    #[test]
    fn test_consolidate_similar_groups_by_type() {
        let items = vec![
            json!({"event_type": "user_turn", "content": "hello"}),
            json!({"event_type": "user_turn", "content": "world"}),
            json!({"event_type": "tool_call", "content": "action"}),
        ];
        let consolidated = MemoryConsolidation::consolidate_similar(&items);

        assert!(consolidated.len() < items.len());
        let turns = &consolidated[0];
        assert_eq!(turns["event_type"], "user_turn");
        assert_eq!(turns["count"], 2);
        assert_eq!(turns["consolidated"], true);
        // Singleton passes through unchanged
        assert_eq!(consolidated[1]["event_type"], "tool_call");
        assert!(consolidated[1].get("consolidated").is_none());
    }

    #[test]
    fn test_consolidate_empty() {
        assert!(MemoryConsolidation::consolidate_similar(&[]).is_empty());
    }

    #[test]
    fn test_compress_old_events_separates_by_age() {
        let items = vec![
            json!({"event_id": "recent", "timestamp": Timestamp::now().to_iso()}),
            json!({"event_id": "old", "timestamp": days_ago(50).to_iso()}),
        ];
        let compressed = MemoryConsolidation::compress_old_events(&items, 30);

        assert_eq!(compressed.recent.len(), 1);
        assert_eq!(compressed.archived.len(), 1);
        assert_eq!(compressed.recent[0]["event_id"], "recent");
        assert_eq!(compressed.archived[0]["event_id"], "old");
    }

    #[test]
    fn test_compress_keeps_unparseable_timestamps_recent() {
        let items = vec![
            json!({"event_id": "no_ts"}),
            json!({"event_id": "bad_ts", "timestamp": "not-a-date"}),
        ];
        let compressed = MemoryConsolidation::compress_old_events(&items, 30);
        assert_eq!(compressed.recent.len(), 2);
        assert!(compressed.archived.is_empty());
    }
}
