//! Typed runtime events.

use serde::{Deserialize, Serialize};
use sonia_core::{ActionId, ConfirmationId, OutboxId, SessionId, Timestamp, TurnId};

/// Events published on the Sonia event bus.
///
/// The `event_type()` string is the stable wire name delivered to UI
/// subscribers and recorded in diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SoniaEvent {
    /// A supervised service transitioned to healthy.
    ServiceHealthy {
        /// Service name.
        service: String,
        /// State it left.
        old_state: String,
        /// When the transition was observed.
        timestamp: Timestamp,
    },
    /// A supervised service transitioned to degraded.
    ServiceDegraded {
        /// Service name.
        service: String,
        /// State it left.
        old_state: String,
        /// Consecutive probe failures observed.
        consecutive_failures: u32,
        /// Last probe error.
        error: String,
        /// When the transition was observed.
        timestamp: Timestamp,
    },
    /// A supervised service transitioned to unreachable.
    ServiceUnreachable {
        /// Service name.
        service: String,
        /// State it left.
        old_state: String,
        /// Consecutive probe failures observed.
        consecutive_failures: u32,
        /// Last probe error.
        error: String,
        /// When the transition was observed.
        timestamp: Timestamp,
    },
    /// A supervised service began recovering.
    ServiceRecovered {
        /// Service name.
        service: String,
        /// State it left.
        old_state: String,
        /// When the transition was observed.
        timestamp: Timestamp,
    },
    /// A restart was spawned for a service.
    ServiceRestarted {
        /// Service name.
        service: String,
        /// Spawned process id, when known.
        pid: Option<u32>,
        /// 1-based restart attempt within the window.
        attempt: u32,
        /// Backoff slept before the spawn, in seconds.
        backoff_s: f64,
        /// When the spawn happened.
        timestamp: Timestamp,
    },
    /// A restart spawn failed.
    RestartFailed {
        /// Service name.
        service: String,
        /// Spawn error.
        error: String,
        /// When the failure happened.
        timestamp: Timestamp,
    },
    /// The restart budget for a service is exhausted.
    RestartExhausted {
        /// Service name.
        service: String,
        /// Restarts already performed inside the window.
        restart_count: u32,
        /// The budget window, in seconds.
        window_s: f64,
        /// When exhaustion was detected.
        timestamp: Timestamp,
    },
    /// Maintenance mode was toggled.
    MaintenanceToggled {
        /// Previous value.
        old: bool,
        /// New value.
        new: bool,
        /// When it was toggled.
        timestamp: Timestamp,
    },
    /// A turn started processing.
    TurnStarted {
        /// Owning session.
        session_id: SessionId,
        /// The turn.
        turn_id: TurnId,
        /// When processing began.
        timestamp: Timestamp,
    },
    /// A turn finished (successfully or not).
    TurnCompleted {
        /// Owning session.
        session_id: SessionId,
        /// The turn.
        turn_id: TurnId,
        /// Whether the turn succeeded.
        ok: bool,
        /// Wall-clock duration of the whole turn.
        duration_ms: u64,
        /// When processing finished.
        timestamp: Timestamp,
    },
    /// A tool call needs user approval before it can run.
    ApprovalRequired {
        /// Owning session.
        session_id: SessionId,
        /// The turn awaiting approval.
        turn_id: TurnId,
        /// The pending action.
        action_id: ActionId,
        /// The minted confirmation token.
        confirmation_id: ConfirmationId,
        /// Tool being gated.
        tool_name: String,
        /// Human-readable summary shown to the user.
        summary: String,
        /// When the token was minted.
        timestamp: Timestamp,
    },
    /// An outbox entry was delivered to the ledger.
    OutboxDelivered {
        /// The delivered entry.
        outbox_id: OutboxId,
        /// Entry type string.
        entry_type: String,
        /// Delivery attempts used.
        attempts: u32,
        /// When delivery succeeded.
        timestamp: Timestamp,
    },
}

impl SoniaEvent {
    /// Stable wire name for this event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceHealthy { .. } => "supervision.service.healthy",
            Self::ServiceDegraded { .. } => "supervision.service.degraded",
            Self::ServiceUnreachable { .. } => "supervision.service.unreachable",
            Self::ServiceRecovered { .. } => "supervision.service.recovered",
            Self::ServiceRestarted { .. } => "supervision.service.restarted",
            Self::RestartFailed { .. } => "supervision.restart.failed",
            Self::RestartExhausted { .. } => "supervision.restart.exhausted",
            Self::MaintenanceToggled { .. } => "supervision.maintenance.toggled",
            Self::TurnStarted { .. } => "turn.started",
            Self::TurnCompleted { .. } => "turn.completed",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::OutboxDelivered { .. } => "outbox.delivered",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        let event = SoniaEvent::RestartExhausted {
            service: "memory-engine".to_string(),
            restart_count: 3,
            window_s: 300.0,
            timestamp: Timestamp::now(),
        };
        assert_eq!(event.event_type(), "supervision.restart.exhausted");
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let event = SoniaEvent::MaintenanceToggled {
            old: false,
            new: true,
            timestamp: Timestamp::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "maintenance_toggled");
        assert_eq!(json["new"], true);
    }
}
