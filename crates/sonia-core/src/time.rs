//! UTC timestamps in the wire format used across all services.
//!
//! Everything on the wire and in SQL columns is ISO-8601 UTC with a `Z`
//! suffix and whole-second precision (`2024-06-01T12:30:00Z`). Caller
//! supplied temporal bounds are validated strictly against this shape.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A UTC wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current UTC time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Render as ISO-8601 UTC with `Z` suffix, whole seconds.
    #[must_use]
    pub fn to_iso(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Parse a strict ISO-8601 UTC timestamp (`YYYY-MM-DDTHH:MM:SSZ`,
    /// fractional seconds tolerated).
    ///
    /// # Errors
    ///
    /// Returns a message naming `field` when the value is not UTC ISO-8601.
    pub fn parse_iso(value: &str, field: &str) -> Result<Self, String> {
        if !value.ends_with('Z') {
            return Err(format!(
                "{field} must be ISO 8601 UTC (YYYY-MM-DDTHH:MM:SSZ), got: {value}"
            ));
        }
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|_| format!("{field} is not a valid datetime: {value}"))
    }

    /// Add a duration, saturating on overflow.
    #[must_use]
    pub fn plus(&self, d: Duration) -> Self {
        Self(self.0.checked_add_signed(d).unwrap_or(self.0))
    }

    /// Whether this instant is in the past.
    #[must_use]
    pub fn is_past(&self) -> bool {
        self.0 < Utc::now()
    }

    /// Seconds elapsed since this instant (negative if in the future).
    #[must_use]
    pub fn age_seconds(&self) -> f64 {
        (Utc::now() - self.0).num_milliseconds() as f64 / 1000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

/// Validate an optional caller-supplied temporal bound.
///
/// # Errors
///
/// Returns the validation message when present and malformed.
pub fn validate_optional_iso(value: Option<&str>, field: &str) -> Result<(), String> {
    match value {
        Some(v) => Timestamp::parse_iso(v, field).map(|_| ()),
        None => Ok(()),
    }
}
