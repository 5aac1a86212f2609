//! Configuration types for the Sonia core runtime.
//!
//! Self-contained (no dependencies on other internal crates); domain
//! crates convert at the boundary. Every struct implements [`Default`]
//! with working local values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ConfigError, ConfigResult};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the Sonia core runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoniaConfig {
    /// Data directory layout and database paths.
    pub storage: StorageSection,
    /// Gateway tunables: TTLs, queue caps, budgets.
    pub gateway: GatewaySection,
    /// Hybrid retrieval settings.
    pub retrieval: RetrievalSection,
    /// Tool executor plane settings.
    pub tools: ToolsSection,
    /// Supervised downstream services.
    pub supervisor: SupervisorSection,
    /// Ledger backup settings.
    pub backup: BackupSection,
}

impl SoniaConfig {
    /// Validate cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.gateway.max_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.gateway.confirmation_ttl_seconds <= 0.0 {
            return Err(ConfigError::Invalid(
                "gateway.confirmation_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.tools.default_timeout_seconds > self.tools.max_timeout_seconds {
            return Err(ConfigError::Invalid(format!(
                "tools.default_timeout_seconds ({}) exceeds tools.max_timeout_seconds ({})",
                self.tools.default_timeout_seconds, self.tools.max_timeout_seconds
            )));
        }
        if self.backup.max_backups == 0 {
            return Err(ConfigError::Invalid(
                "backup.max_backups must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Data directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Gateway durable state database, relative to `data_dir` unless absolute.
    pub gateway_db: PathBuf,
    /// Memory ledger database, relative to `data_dir` unless absolute.
    pub memory_db: PathBuf,
}

impl StorageSection {
    /// Absolute path of the gateway state database.
    #[must_use]
    pub fn gateway_db_path(&self) -> PathBuf {
        self.resolve(&self.gateway_db)
    }

    /// Absolute path of the memory ledger database.
    #[must_use]
    pub fn memory_db_path(&self) -> PathBuf {
        self.resolve(&self.memory_db)
    }

    fn resolve(&self, p: &PathBuf) -> PathBuf {
        if p.is_absolute() {
            p.clone()
        } else {
            self.data_dir.join(p)
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            gateway_db: PathBuf::from("gateway_state.db"),
            memory_db: PathBuf::from("memory.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Gateway turn-pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Listen address for the HTTP surface.
    pub bind: String,
    /// Maximum queued turns per session before shedding.
    pub max_queue_depth: usize,
    /// Confirmation token TTL.
    pub confirmation_ttl_seconds: f64,
    /// Session idle expiry.
    pub session_ttl_seconds: f64,
    /// Model call budget.
    pub model_timeout_seconds: f64,
    /// Character budget for recall context.
    pub recall_max_chars: usize,
    /// Idempotency key TTL.
    pub idempotency_ttl_seconds: f64,
    /// Model router base URL.
    pub model_router_url: String,
    /// Default routing profile.
    pub default_profile: String,
    /// Outbox drain interval.
    pub outbox_poll_seconds: f64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7000".to_string(),
            max_queue_depth: 8,
            confirmation_ttl_seconds: 120.0,
            session_ttl_seconds: 3600.0,
            model_timeout_seconds: 60.0,
            recall_max_chars: 7000,
            idempotency_ttl_seconds: 300.0,
            model_router_url: "http://127.0.0.1:7010".to_string(),
            default_profile: "chat_low_latency".to_string(),
            outbox_poll_seconds: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Hybrid retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Embeddings service base URL (Ollama-compatible).
    pub embeddings_url: String,
    /// Embeddings model name.
    pub embeddings_model: String,
    /// Embedding dimension.
    pub dimension: usize,
    /// Vector index file, relative to the data dir unless absolute.
    pub vector_index: PathBuf,
    /// Backfill batch size.
    pub backfill_batch: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            embeddings_url: "http://127.0.0.1:11434".to_string(),
            embeddings_model: "nomic-embed-text".to_string(),
            dimension: 768,
            vector_index: PathBuf::from("vector/sonia.hnsw"),
            backfill_batch: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Tool executor plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// Sandbox root containing all filesystem operations.
    pub sandbox_root: PathBuf,
    /// Default per-tool execution timeout.
    pub default_timeout_seconds: f64,
    /// Hard cap on per-tool execution timeout.
    pub max_timeout_seconds: f64,
    /// Output capture cap in bytes.
    pub max_output_bytes: usize,
    /// File read/write size cap in bytes.
    pub max_file_bytes: u64,
    /// Auto-approve tier-1 (local write) tools without confirmation.
    pub auto_approve_tier_1: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("sandbox"),
            default_timeout_seconds: 5.0,
            max_timeout_seconds: 15.0,
            max_output_bytes: 64 * 1024,
            max_file_bytes: 10 * 1024 * 1024,
            auto_approve_tier_1: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// One supervised downstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    /// Probe host.
    pub host: String,
    /// Probe port.
    pub port: u16,
    /// Health endpoint path.
    pub health_endpoint: String,
    /// Restart command argv; empty means the service cannot be restarted.
    pub restart_command: Vec<String>,
    /// Working directory for the restart command.
    pub restart_cwd: Option<PathBuf>,
    /// Services this one depends on (diagnostics only).
    pub depends_on: Vec<String>,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            health_endpoint: "/healthz".to_string(),
            restart_command: Vec::new(),
            restart_cwd: None,
            depends_on: Vec::new(),
        }
    }
}

/// Supervisor settings and service table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Listen address for the status surface.
    pub bind: String,
    /// Probe loop interval.
    pub poll_interval_seconds: f64,
    /// Per-probe timeout.
    pub probe_timeout_seconds: f64,
    /// Consecutive successes required to restore healthy.
    pub recovery_probes: u32,
    /// Maximum restarts per window.
    pub max_restarts: u32,
    /// Restart budget window in seconds.
    pub restart_window_seconds: f64,
    /// Restart backoff base in seconds.
    pub backoff_base_seconds: f64,
    /// Supervised services, keyed by name.
    pub services: HashMap<String, ServiceEntry>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let mut services = HashMap::new();
        for (name, port) in [
            ("api-gateway", 7000u16),
            ("model-router", 7010),
            ("memory-engine", 7020),
            ("openclaw", 7040),
        ] {
            services.insert(
                name.to_string(),
                ServiceEntry {
                    port,
                    ..ServiceEntry::default()
                },
            );
        }
        Self {
            bind: "127.0.0.1:7050".to_string(),
            poll_interval_seconds: 15.0,
            probe_timeout_seconds: 5.0,
            recovery_probes: 2,
            max_restarts: 3,
            restart_window_seconds: 300.0,
            backoff_base_seconds: 2.0,
            services,
        }
    }
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Ledger backup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// Backup directory, relative to the data dir unless absolute.
    pub backup_dir: PathBuf,
    /// Retained backups beyond which the oldest are pruned.
    pub max_backups: usize,
    /// Attempt platform file encryption on backups.
    pub encrypt: bool,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("backups"),
            max_backups: 7,
            encrypt: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_table() {
        let config = SoniaConfig::default();
        assert!(config.supervisor.services.contains_key("memory-engine"));
        assert_eq!(config.supervisor.services["model-router"].port, 7010);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = SoniaConfig::default();
        config.gateway.max_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_timeout_inversion() {
        let mut config = SoniaConfig::default();
        config.tools.default_timeout_seconds = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_db_path_resolution() {
        let storage = StorageSection {
            data_dir: PathBuf::from("/srv/sonia"),
            gateway_db: PathBuf::from("gateway_state.db"),
            memory_db: PathBuf::from("/var/lib/memory.db"),
        };
        assert_eq!(
            storage.gateway_db_path(),
            PathBuf::from("/srv/sonia/gateway_state.db")
        );
        assert_eq!(storage.memory_db_path(), PathBuf::from("/var/lib/memory.db"));
    }
}
