//! Outbox drain worker.
//!
//! Delivers queued write-backs into the memory ledger with
//! at-least-once semantics: an entry is retained (and its attempt
//! counter incremented) until delivery succeeds. Delivery is FIFO per
//! entry type.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sonia_core::{retry, RetryConfig, RetryOutcome, RetryVerdict, Timestamp};
use sonia_events::{EventBus, SoniaEvent};
use sonia_ledger::MemoryDatabase;
use sonia_retrieval::HybridSearchLayer;
use sonia_state::{OutboxEntry, StateStore};

/// Entries fetched per drain pass.
const DRAIN_BATCH: usize = 50;

/// Background worker that drains the outbox into the ledger.
pub struct OutboxWorker {
    store: StateStore,
    ledger: MemoryDatabase,
    retrieval: Arc<HybridSearchLayer>,
    events: EventBus,
    poll_interval: Duration,
}

impl OutboxWorker {
    /// Build a worker.
    #[must_use]
    pub fn new(
        store: StateStore,
        ledger: MemoryDatabase,
        retrieval: Arc<HybridSearchLayer>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            retrieval,
            events,
            poll_interval,
        }
    }

    /// Run the drain loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(poll_s = self.poll_interval.as_secs_f64(), "outbox worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("outbox worker stopped");
                    return;
                }
                () = tokio::time::sleep(self.poll_interval) => {
                    self.drain().await;
                }
            }
        }
    }

    /// One drain pass. Returns the number of entries delivered.
    pub async fn drain(&self) -> usize {
        let pending = self.store.get_pending_outbox(DRAIN_BATCH).await;
        if pending.is_empty() {
            return 0;
        }

        // One inline retry absorbs transient ledger hiccups; a failure
        // that survives it costs an attempt and waits for the next pass
        let retry_config = RetryConfig::fixed(Duration::from_millis(100), 2);

        let mut delivered = 0usize;
        for entry in pending {
            let outcome = retry(&retry_config, |_: &String| RetryVerdict::Retry, || async {
                self.deliver(&entry)
            })
            .await;
            match outcome {
                RetryOutcome::Success {
                    value: memory_id, ..
                } => {
                    self.store.mark_delivered(&entry.outbox_id).await;
                    if let Some(memory_id) = memory_id {
                        // Keep the search index in step with the ledger
                        if let Ok(Some(record)) = self.ledger.get(&memory_id) {
                            self.retrieval.on_store(&memory_id, &record.content);
                            self.retrieval.on_store_async(&memory_id, &record.content).await;
                        }
                    }
                    self.events.publish(SoniaEvent::OutboxDelivered {
                        outbox_id: entry.outbox_id.clone(),
                        entry_type: entry.entry_type.clone(),
                        attempts: entry.attempts + 1,
                        timestamp: Timestamp::now(),
                    });
                    delivered += 1;
                }
                RetryOutcome::Failed { error, .. } | RetryOutcome::Deferred { error, .. } => {
                    // At-least-once: keep the entry and bump the counter
                    warn!(
                        outbox_id = entry.outbox_id.as_str(),
                        entry_type = entry.entry_type,
                        attempts = entry.attempts + 1,
                        error = %error,
                        "outbox delivery failed, will retry"
                    );
                    self.store.increment_attempt(&entry.outbox_id).await;
                }
            }
        }
        debug!(delivered, "outbox drain pass");
        delivered
    }

    /// Deliver one entry into the ledger. Returns the new memory id for
    /// entries that create one.
    fn deliver(&self, entry: &OutboxEntry) -> Result<Option<sonia_core::MemoryId>, String> {
        match entry.entry_type.as_str() {
            "memory_writeback" => {
                let session_id = entry.payload["session_id"].as_str().unwrap_or_default();
                let turn_id = entry.payload["turn_id"].as_str().unwrap_or_default();
                let content = serde_json::json!({
                    "session_id": session_id,
                    "context_key": format!("turn:{turn_id}"),
                    "context_value": entry.payload.to_string(),
                });
                let outcome = self
                    .ledger
                    .store_typed(
                        "conversation",
                        "SESSION_CONTEXT",
                        &content.to_string(),
                        None,
                        None,
                        None,
                    )
                    .map_err(|e| e.to_string())?;
                if !outcome.valid {
                    return Err(format!(
                        "writeback rejected: {}",
                        outcome.validation_errors.join("; ")
                    ));
                }
                Ok(outcome.memory_id)
            }
            // Tool results and anything unrecognized persist as legacy
            // rows so nothing queued is ever dropped
            other => {
                let memory_id = self
                    .ledger
                    .store(other, &entry.payload.to_string(), metadata_for(entry).as_ref())
                    .map_err(|e| e.to_string())?;
                Ok(Some(memory_id))
            }
        }
    }
}

impl std::fmt::Debug for OutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker").finish_non_exhaustive()
    }
}

fn metadata_for(entry: &OutboxEntry) -> Option<JsonValue> {
    Some(serde_json::json!({
        "outbox_id": entry.outbox_id,
        "enqueued_at": entry.created_at,
    }))
}
