//! Memory subtypes and their content schemas.
//!
//! Each subtype has a serde schema with an identity key used for conflict
//! detection (FACT: subject+predicate, PREFERENCE: category+key). The
//! validator checks subtype, JSON shape, field ranges, and temporal
//! bounds; the parsed model never reaches storage, which keeps the
//! content column opaque.

use serde::{Deserialize, Serialize};
use sonia_core::Timestamp;
use std::fmt;
use std::str::FromStr;

/// The five typed memory subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemorySubtype {
    /// A subject-predicate-object assertion with confidence.
    Fact,
    /// A user preference keyed by category+key.
    Preference,
    /// Project context notes.
    Project,
    /// Per-session ephemeral context.
    SessionContext,
    /// Component state snapshots.
    SystemState,
}

impl MemorySubtype {
    /// All subtypes, in registry order.
    pub const ALL: [Self; 5] = [
        Self::Fact,
        Self::Preference,
        Self::Project,
        Self::SessionContext,
        Self::SystemState,
    ];

    /// Stable column value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "FACT",
            Self::Preference => "PREFERENCE",
            Self::Project => "PROJECT",
            Self::SessionContext => "SESSION_CONTEXT",
            Self::SystemState => "SYSTEM_STATE",
        }
    }

    /// The `subtype:version` string stored in `validation_schema`.
    #[must_use]
    pub fn schema_version(&self) -> String {
        format!("{}:v1", self.as_str())
    }
}

impl fmt::Display for MemorySubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemorySubtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FACT" => Ok(Self::Fact),
            "PREFERENCE" => Ok(Self::Preference),
            "PROJECT" => Ok(Self::Project),
            "SESSION_CONTEXT" => Ok(Self::SessionContext),
            "SYSTEM_STATE" => Ok(Self::SystemState),
            other => Err(format!("Unknown subtype: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Content schemas (one per subtype)
// ---------------------------------------------------------------------------

fn default_confidence() -> f64 {
    1.0
}

fn default_priority() -> f64 {
    5.0
}

/// FACT content: identity key is `(subject, predicate)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactContent {
    /// The entity the fact is about.
    pub subject: String,
    /// The relation.
    pub predicate: String,
    /// The asserted value.
    pub object: String,
    /// Assertion confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Optional provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// PREFERENCE content: identity key is `(category, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreferenceContent {
    /// Preference category.
    pub category: String,
    /// Preference key within the category.
    pub key: String,
    /// Preference value.
    pub value: String,
    /// Priority in `[0, 10]`.
    #[serde(default = "default_priority")]
    pub priority: f64,
}

/// PROJECT content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectContent {
    /// The project.
    pub project_id: String,
    /// The kind of context captured.
    pub context_type: String,
    /// Summary text.
    pub summary: String,
    /// Labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// SESSION_CONTEXT content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionContextContent {
    /// The owning session.
    pub session_id: String,
    /// Context key.
    pub context_key: String,
    /// Context value.
    pub context_value: String,
    /// Optional soft TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// SYSTEM_STATE content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemStateContent {
    /// The reporting component.
    pub component: String,
    /// State key.
    pub state_key: String,
    /// State value.
    pub state_value: String,
    /// Optional health annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Result of validating typed content.
#[derive(Debug)]
pub struct ValidationOutcome {
    /// Whether the content passed.
    pub valid: bool,
    /// Specific validation messages when it did not.
    pub errors: Vec<String>,
    /// The parsed content as canonical JSON, when valid.
    pub parsed: Option<serde_json::Value>,
}

/// Validates typed memory content against schema and temporal invariants.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypedMemoryValidator;

impl TypedMemoryValidator {
    /// Validate `content_json` for `subtype` together with optional
    /// temporal bounds.
    #[must_use]
    pub fn validate(
        &self,
        subtype: &str,
        content_json: &str,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> ValidationOutcome {
        let sub = match MemorySubtype::from_str(subtype) {
            Ok(s) => s,
            Err(e) => {
                return ValidationOutcome {
                    valid: false,
                    errors: vec![e],
                    parsed: None,
                }
            }
        };

        let parsed = match self.parse_content(sub, content_json) {
            Ok(v) => v,
            Err(e) => {
                return ValidationOutcome {
                    valid: false,
                    errors: vec![e],
                    parsed: None,
                }
            }
        };

        let mut errors = Vec::new();
        if let Err(e) = sonia_core::time::validate_optional_iso(valid_from, "valid_from") {
            errors.push(e);
        }
        if let Err(e) = sonia_core::time::validate_optional_iso(valid_until, "valid_until") {
            errors.push(e);
        }
        if let (Some(from), Some(until)) = (valid_from, valid_until) {
            if errors.is_empty() {
                let from_ts = Timestamp::parse_iso(from, "valid_from");
                let until_ts = Timestamp::parse_iso(until, "valid_until");
                if let (Ok(f), Ok(u)) = (from_ts, until_ts) {
                    if u <= f {
                        errors.push("valid_until must be strictly after valid_from".to_string());
                    }
                }
            }
        }

        if errors.is_empty() {
            ValidationOutcome {
                valid: true,
                errors,
                parsed: Some(parsed),
            }
        } else {
            ValidationOutcome {
                valid: false,
                errors,
                parsed: None,
            }
        }
    }

    fn parse_content(
        &self,
        subtype: MemorySubtype,
        content_json: &str,
    ) -> Result<serde_json::Value, String> {
        let value: serde_json::Value = serde_json::from_str(content_json)
            .map_err(|e| format!("Invalid JSON content: {e}"))?;

        let schema_err = |e: serde_json::Error| format!("Schema validation failed: {e}");
        match subtype {
            MemorySubtype::Fact => {
                let fact: FactContent =
                    serde_json::from_value(value.clone()).map_err(schema_err)?;
                if !(0.0..=1.0).contains(&fact.confidence) {
                    return Err(format!(
                        "Schema validation failed: confidence must be in [0, 1], got {}",
                        fact.confidence
                    ));
                }
            }
            MemorySubtype::Preference => {
                let pref: PreferenceContent =
                    serde_json::from_value(value.clone()).map_err(schema_err)?;
                if !(0.0..=10.0).contains(&pref.priority) {
                    return Err(format!(
                        "Schema validation failed: priority must be in [0, 10], got {}",
                        pref.priority
                    ));
                }
            }
            MemorySubtype::Project => {
                serde_json::from_value::<ProjectContent>(value.clone()).map_err(schema_err)?;
            }
            MemorySubtype::SessionContext => {
                serde_json::from_value::<SessionContextContent>(value.clone())
                    .map_err(schema_err)?;
            }
            MemorySubtype::SystemState => {
                serde_json::from_value::<SystemStateContent>(value.clone()).map_err(schema_err)?;
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(confidence: f64) -> String {
        json!({
            "subject": "Alice",
            "predicate": "lives_in",
            "object": "NYC",
            "confidence": confidence,
        })
        .to_string()
    }

    // -----------------------------------------------------------------------
    // Subtype parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_subtype_round_trip() {
        for sub in MemorySubtype::ALL {
            assert_eq!(MemorySubtype::from_str(sub.as_str()).unwrap(), sub);
        }
        assert!(MemorySubtype::from_str("GOSSIP").is_err());
    }

    #[test]
    fn test_schema_version_string() {
        assert_eq!(MemorySubtype::Fact.schema_version(), "FACT:v1");
        assert_eq!(
            MemorySubtype::SessionContext.schema_version(),
            "SESSION_CONTEXT:v1"
        );
    }

    // -----------------------------------------------------------------------
    // Content validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_valid_fact() {
        let outcome = TypedMemoryValidator.validate("FACT", &fact(0.9), None, None);
        assert!(outcome.valid, "{:?}", outcome.errors);
        assert!(outcome.parsed.is_some());
    }

    #[test]
    fn test_unknown_subtype_rejected() {
        let outcome = TypedMemoryValidator.validate("GOSSIP", &fact(0.9), None, None);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("Unknown subtype"));
    }

    #[test]
    fn test_bad_json_rejected() {
        let outcome = TypedMemoryValidator.validate("FACT", "{not json", None, None);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("Invalid JSON"));
    }

    #[test]
    fn test_missing_field_rejected() {
        let content = json!({"subject": "Alice", "predicate": "lives_in"}).to_string();
        let outcome = TypedMemoryValidator.validate("FACT", &content, None, None);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("Schema validation failed"));
    }

    #[test]
    fn test_confidence_range_enforced() {
        let outcome = TypedMemoryValidator.validate("FACT", &fact(1.5), None, None);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("confidence"));
    }

    #[test]
    fn test_priority_range_enforced() {
        let content = json!({
            "category": "ui", "key": "theme", "value": "dark", "priority": 11.0
        })
        .to_string();
        let outcome = TypedMemoryValidator.validate("PREFERENCE", &content, None, None);
        assert!(!outcome.valid);
    }

    #[test]
    fn test_defaults_applied() {
        let content = json!({"category": "ui", "key": "theme", "value": "dark"}).to_string();
        let outcome = TypedMemoryValidator.validate("PREFERENCE", &content, None, None);
        assert!(outcome.valid);
    }

    // -----------------------------------------------------------------------
    // Temporal bounds
    // -----------------------------------------------------------------------

    #[test]
    fn test_temporal_bounds_ordering() {
        let outcome = TypedMemoryValidator.validate(
            "FACT",
            &fact(0.9),
            Some("2025-01-01T00:00:00Z"),
            Some("2024-01-01T00:00:00Z"),
        );
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("strictly after"));
    }

    #[test]
    fn test_temporal_bounds_equal_rejected() {
        let outcome = TypedMemoryValidator.validate(
            "FACT",
            &fact(0.9),
            Some("2024-01-01T00:00:00Z"),
            Some("2024-01-01T00:00:00Z"),
        );
        assert!(!outcome.valid);
    }

    #[test]
    fn test_malformed_bound_named_in_error() {
        let outcome =
            TypedMemoryValidator.validate("FACT", &fact(0.9), Some("2024-01-01"), None);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("valid_from"));
    }
}
