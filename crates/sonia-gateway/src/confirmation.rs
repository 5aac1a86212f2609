//! Confirmation token lifecycle.
//!
//! A token authorizes exactly one action. The decide transition is a
//! compare-and-swap on `pending`; every later decision on the same
//! token is rejected. Sweeps move past-TTL tokens to `expired`, and a
//! turn waiting on a token is released either by the decision or by the
//! TTL (auto-deny).

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sonia_core::{ActionId, ConfirmationId, CoreError, CoreResult, SessionId, Timestamp, TurnId};
use sonia_state::{ConfirmationRecord, ConfirmationStatus, StateStore};
use sonia_tools::ApprovalGate;

/// Confirmation manager with a write-through cache.
pub struct ConfirmationManager {
    store: StateStore,
    tokens: DashMap<ConfirmationId, ConfirmationRecord>,
    waiters: DashMap<ConfirmationId, watch::Sender<ConfirmationStatus>>,
    default_ttl_seconds: f64,
}

impl ConfirmationManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: StateStore, default_ttl_seconds: f64) -> Self {
        Self {
            store,
            tokens: DashMap::new(),
            waiters: DashMap::new(),
            default_ttl_seconds,
        }
    }

    /// Rebuild the cache from the durable store. Tokens already past
    /// their TTL are rejected on load (marked expired). Returns the
    /// count of live tokens restored.
    pub async fn restore(&self) -> usize {
        let loaded = self.store.load_pending_confirmations().await;
        let mut live = 0usize;
        for token in loaded {
            if token.is_expired_by_ttl() {
                self.store
                    .update_confirmation(
                        &token.confirmation_id,
                        ConfirmationStatus::Expired,
                        Some(Timestamp::now()),
                    )
                    .await;
                continue;
            }
            self.tokens.insert(token.confirmation_id.clone(), token);
            live += 1;
        }
        info!(count = live, "pending confirmations restored");
        live
    }

    /// Mint a new pending token.
    pub async fn mint(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        tool_name: &str,
        args: JsonValue,
        summary: &str,
        ttl_seconds: Option<f64>,
    ) -> ConfirmationRecord {
        let token = ConfirmationRecord {
            confirmation_id: ConfirmationId::new(),
            session_id: session_id.clone(),
            turn_id: turn_id.clone(),
            tool_name: tool_name.to_string(),
            args,
            summary: summary.to_string(),
            status: ConfirmationStatus::Pending,
            created_at: Timestamp::now(),
            ttl_seconds: ttl_seconds.unwrap_or(self.default_ttl_seconds),
            decided_at: None,
        };
        let (sender, _) = watch::channel(ConfirmationStatus::Pending);
        self.waiters.insert(token.confirmation_id.clone(), sender);
        self.tokens
            .insert(token.confirmation_id.clone(), token.clone());
        self.store.persist_confirmation(&token).await;
        debug!(
            confirmation_id = token.confirmation_id.as_str(),
            tool = tool_name,
            "confirmation minted"
        );
        token
    }

    /// Decide a pending token. The transition is a compare-and-swap;
    /// deciding a non-pending token fails.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown tokens,
    /// [`CoreError::ConcurrencyConflict`] when the token was already
    /// decided or expired.
    pub async fn decide(
        &self,
        confirmation_id: &ConfirmationId,
        approve: bool,
    ) -> CoreResult<ConfirmationStatus> {
        let target = if approve {
            ConfirmationStatus::Approved
        } else {
            ConfirmationStatus::Denied
        };
        let decided_at = Timestamp::now();

        let status = {
            let mut entry = self
                .tokens
                .get_mut(confirmation_id)
                .ok_or_else(|| CoreError::NotFound(confirmation_id.to_string()))?;
            if entry.status != ConfirmationStatus::Pending {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "confirmation {confirmation_id} already {}",
                    entry.status.as_str()
                )));
            }
            if entry.is_expired_by_ttl() {
                entry.status = ConfirmationStatus::Expired;
                entry.decided_at = Some(decided_at);
                ConfirmationStatus::Expired
            } else {
                entry.status = target;
                entry.decided_at = Some(decided_at);
                target
            }
        };

        self.store
            .update_confirmation(confirmation_id, status, Some(decided_at))
            .await;
        if let Some((_, sender)) = self.waiters.remove(confirmation_id) {
            let _ = sender.send(status);
        }

        if status == ConfirmationStatus::Expired {
            return Err(CoreError::ConcurrencyConflict(format!(
                "confirmation {confirmation_id} expired before decision"
            )));
        }
        info!(
            confirmation_id = confirmation_id.as_str(),
            status = status.as_str(),
            "confirmation decided"
        );
        Ok(status)
    }

    /// Wait for a decision on a token, up to its TTL. Expiry auto-denies
    /// (the token moves to `expired` and `Expired` is returned).
    pub async fn wait_for_decision(&self, confirmation_id: &ConfirmationId) -> ConfirmationStatus {
        let (ttl, current) = match self.tokens.get(confirmation_id) {
            Some(entry) => (entry.ttl_seconds, entry.status),
            None => return ConfirmationStatus::Expired,
        };
        if current != ConfirmationStatus::Pending {
            return current;
        }

        let mut receiver = match self.waiters.get(confirmation_id) {
            Some(sender) => sender.subscribe(),
            None => return self.current_status(confirmation_id),
        };

        let wait = async {
            loop {
                if receiver.changed().await.is_err() {
                    return self.current_status(confirmation_id);
                }
                let status = *receiver.borrow();
                if status != ConfirmationStatus::Pending {
                    return status;
                }
            }
        };

        match tokio::time::timeout(Duration::from_secs_f64(ttl.max(0.0)), wait).await {
            Ok(status) => status,
            Err(_) => {
                // TTL elapsed without a decision
                self.expire_token(confirmation_id).await;
                ConfirmationStatus::Expired
            }
        }
    }

    /// Sweep all past-TTL pending tokens to `expired`. Returns the
    /// count swept.
    pub async fn expire_pending(&self) -> usize {
        let stale: Vec<ConfirmationId> = self
            .tokens
            .iter()
            .filter(|entry| {
                entry.value().status == ConfirmationStatus::Pending
                    && entry.value().is_expired_by_ttl()
            })
            .map(|entry| entry.key().clone())
            .collect();
        for confirmation_id in &stale {
            self.expire_token(confirmation_id).await;
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), "confirmations expired");
        }
        stale.len()
    }

    async fn expire_token(&self, confirmation_id: &ConfirmationId) {
        let transitioned = {
            match self.tokens.get_mut(confirmation_id) {
                Some(mut entry) if entry.status == ConfirmationStatus::Pending => {
                    entry.status = ConfirmationStatus::Expired;
                    entry.decided_at = Some(Timestamp::now());
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            self.store
                .update_confirmation(
                    confirmation_id,
                    ConfirmationStatus::Expired,
                    Some(Timestamp::now()),
                )
                .await;
            if let Some((_, sender)) = self.waiters.remove(confirmation_id) {
                let _ = sender.send(ConfirmationStatus::Expired);
            }
        }
    }

    fn current_status(&self, confirmation_id: &ConfirmationId) -> ConfirmationStatus {
        self.tokens
            .get(confirmation_id)
            .map_or(ConfirmationStatus::Expired, |e| e.status)
    }

    /// Look up a token.
    #[must_use]
    pub fn get(&self, confirmation_id: &ConfirmationId) -> Option<ConfirmationRecord> {
        self.tokens.get(confirmation_id).map(|e| e.clone())
    }

    /// Count of cached pending tokens.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|e| e.value().status == ConfirmationStatus::Pending)
            .count()
    }
}

impl std::fmt::Debug for ConfirmationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationManager")
            .field("cached", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

/// The execution plane requests tokens through this gate when a request
/// arrives outside a turn (direct `/execute` calls). Tokens minted here
/// carry blank session/turn context.
#[async_trait]
impl ApprovalGate for ConfirmationManager {
    async fn mint(
        &self,
        _action_id: &ActionId,
        tool_name: &str,
        args: &HashMap<String, JsonValue>,
        summary: &str,
    ) -> String {
        let token = self
            .mint(
                &SessionId::from(""),
                &TurnId::from(""),
                tool_name,
                serde_json::to_value(args).unwrap_or(JsonValue::Null),
                summary,
                None,
            )
            .await;
        token.confirmation_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(ttl: f64) -> ConfirmationManager {
        ConfirmationManager::new(StateStore::in_memory().unwrap(), ttl)
    }

    async fn mint(manager: &ConfirmationManager) -> ConfirmationRecord {
        manager
            .mint(
                &SessionId::new(),
                &TurnId::new(),
                "file.write",
                json!({"path": "x.txt"}),
                "write x.txt",
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_decide_approve_once() {
        let manager = manager(120.0);
        let token = mint(&manager).await;

        let status = manager.decide(&token.confirmation_id, true).await.unwrap();
        assert_eq!(status, ConfirmationStatus::Approved);

        // Single use: the second decision is rejected
        let err = manager.decide(&token.confirmation_id, true).await.unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)));
    }

    #[tokio::test]
    async fn test_decide_deny() {
        let manager = manager(120.0);
        let token = mint(&manager).await;
        let status = manager.decide(&token.confirmation_id, false).await.unwrap();
        assert_eq!(status, ConfirmationStatus::Denied);
    }

    #[tokio::test]
    async fn test_decide_unknown_token() {
        let manager = manager(120.0);
        assert!(matches!(
            manager.decide(&ConfirmationId::new(), true).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_released_by_decision() {
        let manager = std::sync::Arc::new(manager(120.0));
        let token = mint(&manager).await;

        let waiter = {
            let manager = std::sync::Arc::clone(&manager);
            let id = token.confirmation_id.clone();
            tokio::spawn(async move { manager.wait_for_decision(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.decide(&token.confirmation_id, true).await.unwrap();

        assert_eq!(waiter.await.unwrap(), ConfirmationStatus::Approved);
    }

    #[tokio::test]
    async fn test_wait_auto_denies_on_ttl() {
        let manager = manager(0.05);
        let token = mint(&manager).await;
        let status = manager.wait_for_decision(&token.confirmation_id).await;
        assert_eq!(status, ConfirmationStatus::Expired);
        assert_eq!(
            manager.get(&token.confirmation_id).unwrap().status,
            ConfirmationStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_expired_token_cannot_be_approved() {
        let manager = manager(-1.0);
        let token = mint(&manager).await;
        let err = manager.decide(&token.confirmation_id, true).await.unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)));
        assert_eq!(
            manager.get(&token.confirmation_id).unwrap().status,
            ConfirmationStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_expire_pending_sweep() {
        let manager = manager(-1.0);
        mint(&manager).await;
        mint(&manager).await;
        assert_eq!(manager.expire_pending().await, 2);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_rejects_stale_tokens() {
        let store = StateStore::in_memory().unwrap();
        {
            let manager = ConfirmationManager::new(store.clone(), 120.0);
            mint(&manager).await;
            // A stale one, minted with negative TTL
            manager
                .mint(
                    &SessionId::new(),
                    &TurnId::new(),
                    "file.write",
                    json!({}),
                    "",
                    Some(-1.0),
                )
                .await;
        }
        let rebuilt = ConfirmationManager::new(store.clone(), 120.0);
        assert_eq!(rebuilt.restore().await, 1);
        // The stale token was marked expired durably
        assert_eq!(store.load_pending_confirmations().await.len(), 1);
    }
}
