//! Sonia Ledger - Typed append-only memory store.
//!
//! The ledger is content-immutable: a stored record is never edited in
//! place. Mutation creates a new version and atomically supersedes the
//! prior chain head; redaction flips a visibility flag under governance
//! audit. Typed records (FACT, PREFERENCE, PROJECT, SESSION_CONTEXT,
//! SYSTEM_STATE) are schema-validated at the boundary while the stored
//! `content` column stays an opaque JSON blob.
//!
//! Stored records are subject to decay ([`decay`]): a score computed
//! from age, access count, and relevance hides forgotten records from
//! queries and lets a maintenance sweep archive them.
//!
//! The crate also owns hot online backup of the ledger file with
//! manifests, verification, restore, and retention ([`backup`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod backup;
pub mod conflict;
pub mod db;
pub mod decay;
pub mod error;
pub mod migrations;
pub mod record;
pub mod schema;

pub use backup::{BackupManager, BackupManifest};
pub use db::{BudgetQuery, CompactReport, MemoryDatabase};
pub use decay::{
    BatchDecayOutcome, CompressedEvents, DecayStrategy, DecayedRecord, MemoryConsolidation,
    MemoryDecay, RankAdjustment,
};
pub use error::{LedgerError, LedgerResult};
pub use record::{
    ConflictRecord, MemoryRecord, QueryOutcome, RedactionAuditRecord, StoreOutcome,
    REDACTED_PLACEHOLDER,
};
pub use schema::{MemorySubtype, TypedMemoryValidator, ValidationOutcome};
