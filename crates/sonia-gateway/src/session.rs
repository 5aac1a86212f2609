//! Session lifecycle management.
//!
//! The in-memory map is the fast path; every mutation writes through to
//! the durable store. On startup the map is rebuilt from the store's
//! active sessions.

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};

use sonia_core::{SessionId, Timestamp};
use sonia_state::{SessionRecord, SessionStatus, SessionUpdate, StateStore};

/// Session manager with a write-through cache.
pub struct SessionManager {
    store: StateStore,
    sessions: DashMap<SessionId, SessionRecord>,
    session_ttl_seconds: f64,
}

impl SessionManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: StateStore, session_ttl_seconds: f64) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            session_ttl_seconds,
        }
    }

    /// Rebuild the cache from the durable store. Returns the count
    /// restored.
    pub async fn restore(&self) -> usize {
        let loaded = self.store.load_active_sessions().await;
        let count = loaded.len();
        for session in loaded {
            self.sessions.insert(session.session_id.clone(), session);
        }
        info!(count, "sessions restored");
        count
    }

    /// Create a new session.
    pub async fn create(
        &self,
        user_id: &str,
        conversation_id: &str,
        profile: &str,
    ) -> SessionRecord {
        let now = Timestamp::now();
        let session = SessionRecord {
            session_id: SessionId::new(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            profile: profile.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now.plus(ChronoDuration::milliseconds(
                (self.session_ttl_seconds * 1000.0) as i64,
            )),
            last_activity: now,
            turn_count: 0,
            metadata: json!({}),
        };
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        self.store.persist_session(&session).await;
        debug!(session_id = session.session_id.as_str(), "session created");
        session
    }

    /// Find the active session for a conversation, or create one.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        conversation_id: &str,
        profile: &str,
    ) -> SessionRecord {
        let existing = self.sessions.iter().find_map(|entry| {
            let s = entry.value();
            (s.status == SessionStatus::Active
                && s.user_id == user_id
                && s.conversation_id == conversation_id)
                .then(|| s.clone())
        });
        match existing {
            Some(session) => session,
            None => self.create(user_id, conversation_id, profile).await,
        }
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Record activity on a session: bumps `last_activity`, extends the
    /// expiry, and increments the turn count. Returns `false` for
    /// unknown sessions.
    pub async fn touch(&self, session_id: &SessionId) -> bool {
        let now = Timestamp::now();
        let expires = now.plus(ChronoDuration::milliseconds(
            (self.session_ttl_seconds * 1000.0) as i64,
        ));
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return false;
            };
            entry.last_activity = now;
            entry.expires_at = expires;
            entry.turn_count += 1;
            entry.turn_count
        };
        self.store
            .update_session(
                session_id,
                SessionUpdate {
                    last_activity: Some(now),
                    expires_at: Some(expires),
                    turn_count: Some(updated),
                    ..SessionUpdate::default()
                },
            )
            .await;
        true
    }

    /// Sweep sessions past their expiry to `expired`. Returns the count
    /// swept.
    pub async fn expire_stale(&self) -> usize {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().status == SessionStatus::Active && entry.value().expires_at.is_past()
            })
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &stale {
            if let Some(mut entry) = self.sessions.get_mut(session_id) {
                entry.status = SessionStatus::Expired;
            }
            self.store
                .update_session(
                    session_id,
                    SessionUpdate {
                        status: Some(SessionStatus::Expired),
                        ..SessionUpdate::default()
                    },
                )
                .await;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "sessions expired");
        }
        stale.len()
    }

    /// Count of cached active sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().status == SessionStatus::Active)
            .count()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("cached", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> SessionManager {
        SessionManager::new(StateStore::in_memory().unwrap(), 3600.0)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = manager().await;
        let session = manager.create("u1", "conv-1", "chat_low_latency").await;
        let fetched = manager.get(&session.session_id).unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.turn_count, 0);
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_active_session() {
        let manager = manager().await;
        let first = manager.get_or_create("u1", "conv-1", "p").await;
        let second = manager.get_or_create("u1", "conv-1", "p").await;
        assert_eq!(first.session_id, second.session_id);

        let other = manager.get_or_create("u1", "conv-2", "p").await;
        assert_ne!(first.session_id, other.session_id);
    }

    #[tokio::test]
    async fn test_touch_increments_turn_count() {
        let manager = manager().await;
        let session = manager.create("u1", "conv-1", "p").await;
        assert!(manager.touch(&session.session_id).await);
        assert!(manager.touch(&session.session_id).await);
        assert_eq!(manager.get(&session.session_id).unwrap().turn_count, 2);
        assert!(!manager.touch(&SessionId::new()).await);
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let store = StateStore::in_memory().unwrap();
        let manager = SessionManager::new(store, -1.0);
        manager.create("u1", "conv-1", "p").await;
        assert_eq!(manager.expire_stale().await, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let store = StateStore::in_memory().unwrap();
        let manager = SessionManager::new(store.clone(), 3600.0);
        manager.create("u1", "conv-1", "p").await;

        let rebuilt = SessionManager::new(store, 3600.0);
        assert_eq!(rebuilt.restore().await, 1);
        assert_eq!(rebuilt.active_count(), 1);
    }
}
