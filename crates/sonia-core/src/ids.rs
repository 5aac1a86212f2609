//! Prefixed opaque identifier types.
//!
//! Every id on the wire is an opaque string with a short type prefix
//! (`mem_`, `ses_`, `conf_`, `dl_`, `obx_`, `act_`, …) followed by the
//! first twelve hex characters of a v4 UUID. Ids serialize as plain
//! strings so they round-trip through JSON and SQL columns unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate the hex tail shared by all id constructors.
fn hex_tail() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..12].to_string()
}

macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh id with this type's prefix.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "{}"), hex_tail()))
            }

            /// Wrap an existing string (e.g. a value loaded from storage).
            #[must_use]
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// The id's wire prefix.
            #[must_use]
            pub fn prefix() -> &'static str {
                $prefix
            }

            /// Borrow the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

prefixed_id!(
    /// Identifier for a memory ledger record.
    MemoryId, "mem_"
);
prefixed_id!(
    /// Identifier for a gateway session.
    SessionId, "ses_"
);
prefixed_id!(
    /// Identifier for a confirmation token.
    ConfirmationId, "conf_"
);
prefixed_id!(
    /// Identifier for a dead letter.
    LetterId, "dl_"
);
prefixed_id!(
    /// Identifier for an outbox entry.
    OutboxId, "obx_"
);
prefixed_id!(
    /// Identifier for one tool action invocation.
    ActionId, "act_"
);
prefixed_id!(
    /// Identifier for one user turn.
    TurnId, "turn_"
);
prefixed_id!(
    /// Identifier for a detected memory conflict.
    ConflictId, "conflict_"
);
prefixed_id!(
    /// Identifier for an audit row (ledger or redaction).
    AuditId, "audit_"
);
