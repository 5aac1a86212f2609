//! Per-service state machine, probe loop, and restart policy.

use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sonia_config::SupervisorSection;
use sonia_core::Timestamp;
use sonia_events::{EventBus, SoniaEvent};

use crate::error::{SupervisorError, SupervisorResult};

/// Per-service supervision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Probes succeeding.
    Healthy,
    /// At least one recent probe failed.
    Degraded,
    /// Three or more consecutive probes failed.
    Unreachable,
    /// Healthy probes arriving after a failure, below the recovery
    /// threshold.
    Recovering,
    /// Never probed.
    Unknown,
}

impl ServiceState {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Recovering => "recovering",
            Self::Unknown => "unknown",
        }
    }
}

/// Tracks state for a single downstream service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Service name.
    pub name: String,
    /// Probe host.
    pub host: String,
    /// Probe port.
    pub port: u16,
    /// Health endpoint path.
    pub health_endpoint: String,
    /// Current supervision state.
    pub state: ServiceState,
    /// When the last probe ran.
    pub last_check: Option<Timestamp>,
    /// When the last healthy probe ran.
    pub last_healthy: Option<Timestamp>,
    /// Last probe latency.
    pub latency_ms: f64,
    /// Consecutive failed probes.
    pub consecutive_failures: u32,
    /// Consecutive successful probes.
    pub consecutive_successes: u32,
    /// Last probe error.
    pub last_error: String,
    /// Restart command argv; empty means not restartable.
    pub restart_command: Vec<String>,
    /// Working directory for the restart command.
    pub restart_cwd: Option<std::path::PathBuf>,
    /// Services this one depends on.
    pub depends_on: Vec<String>,
    /// Instants of restarts inside the current window.
    restart_history: Vec<Instant>,
}

impl ServiceRecord {
    /// The probe URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.health_endpoint)
    }

    /// JSON snapshot for the status surface.
    #[must_use]
    pub fn to_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "state": self.state.as_str(),
            "latency_ms": (self.latency_ms * 10.0).round() / 10.0,
            "last_check": self.last_check,
            "last_healthy": self.last_healthy,
            "consecutive_failures": self.consecutive_failures,
            "consecutive_successes": self.consecutive_successes,
            "error": self.last_error,
            "restarts_in_window": self.restart_history.len(),
        })
    }
}

/// Result of one probe, before it is applied to the state machine.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Whether the probe returned HTTP 200.
    pub healthy: bool,
    /// Round-trip time.
    pub latency_ms: f64,
    /// Error description for failed probes.
    pub error: Option<String>,
}

/// Active health supervision for all configured services.
pub struct ServiceSupervisor {
    services: Mutex<HashMap<String, ServiceRecord>>,
    settings: SupervisorSection,
    events: EventBus,
    http: reqwest::Client,
    maintenance: AtomicBool,
    started_at: Instant,
}

impl ServiceSupervisor {
    /// Build a supervisor from configuration.
    #[must_use]
    pub fn new(settings: SupervisorSection, events: EventBus) -> Arc<Self> {
        let mut services = HashMap::new();
        for (name, entry) in &settings.services {
            services.insert(
                name.clone(),
                ServiceRecord {
                    name: name.clone(),
                    host: entry.host.clone(),
                    port: entry.port,
                    health_endpoint: entry.health_endpoint.clone(),
                    state: ServiceState::Unknown,
                    last_check: None,
                    last_healthy: None,
                    latency_ms: 0.0,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    last_error: String::new(),
                    restart_command: entry.restart_command.clone(),
                    restart_cwd: entry.restart_cwd.clone(),
                    depends_on: entry.depends_on.clone(),
                    restart_history: Vec::new(),
                },
            );
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.probe_timeout_seconds))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            services: Mutex::new(services),
            settings,
            events,
            http,
            maintenance: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Probe one service's health endpoint and apply the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownService`] for unknown names.
    pub async fn probe_service(self: &Arc<Self>, name: &str) -> SupervisorResult<ProbeOutcome> {
        let url = {
            let services = self.services.lock().await;
            let record = services
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            record.url()
        };

        let started = Instant::now();
        let outcome = match self.http.get(&url).send().await {
            Ok(response) if response.status().as_u16() == 200 => ProbeOutcome {
                healthy: true,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                error: None,
            },
            Ok(response) => ProbeOutcome {
                healthy: false,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                error: Some(format!("HTTP {}", response.status().as_u16())),
            },
            Err(e) => ProbeOutcome {
                healthy: false,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                error: Some(e.to_string()),
            },
        };

        self.apply_probe(name, outcome.clone()).await?;
        Ok(outcome)
    }

    /// Apply a probe outcome to the state machine. Emits transition
    /// events and triggers auto-restart on entering unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownService`] for unknown names.
    pub async fn apply_probe(self: &Arc<Self>, name: &str, outcome: ProbeOutcome) -> SupervisorResult<()> {
        let (old_state, new_state) = {
            let mut services = self.services.lock().await;
            let record = services
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;

            record.last_check = Some(Timestamp::now());
            record.latency_ms = outcome.latency_ms;

            if outcome.healthy {
                record.last_error = String::new();
                record.consecutive_failures = 0;
                record.consecutive_successes += 1;
                record.last_healthy = Some(Timestamp::now());
            } else {
                record.last_error = outcome.error.unwrap_or_default();
                record.consecutive_successes = 0;
                record.consecutive_failures += 1;
            }

            let old = record.state;
            record.state = next_state(record, outcome.healthy, self.settings.recovery_probes);
            (old, record.state)
        };

        if old_state != new_state {
            self.emit_transition(name, old_state, new_state).await;
        }

        // Health-driven auto-restart on the edge into unreachable
        if new_state == ServiceState::Unreachable
            && old_state != ServiceState::Unreachable
            && !self.maintenance.load(Ordering::SeqCst)
        {
            let supervisor = Arc::clone(self);
            let service = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = supervisor.restart_service(&service).await {
                    warn!(service, error = %e, "auto-restart failed");
                }
            });
        }
        Ok(())
    }

    async fn emit_transition(&self, name: &str, old: ServiceState, new: ServiceState) {
        let (failures, error) = {
            let services = self.services.lock().await;
            services
                .get(name)
                .map(|r| (r.consecutive_failures, r.last_error.clone()))
                .unwrap_or((0, String::new()))
        };
        let event = match new {
            ServiceState::Healthy => Some(SoniaEvent::ServiceHealthy {
                service: name.to_string(),
                old_state: old.as_str().to_string(),
                timestamp: Timestamp::now(),
            }),
            ServiceState::Degraded => Some(SoniaEvent::ServiceDegraded {
                service: name.to_string(),
                old_state: old.as_str().to_string(),
                consecutive_failures: failures,
                error: error.clone(),
                timestamp: Timestamp::now(),
            }),
            ServiceState::Unreachable => Some(SoniaEvent::ServiceUnreachable {
                service: name.to_string(),
                old_state: old.as_str().to_string(),
                consecutive_failures: failures,
                error,
                timestamp: Timestamp::now(),
            }),
            ServiceState::Recovering => Some(SoniaEvent::ServiceRecovered {
                service: name.to_string(),
                old_state: old.as_str().to_string(),
                timestamp: Timestamp::now(),
            }),
            ServiceState::Unknown => None,
        };
        if let Some(event) = event {
            info!(service = name, from = old.as_str(), to = new.as_str(), "state transition");
            self.events.publish(event);
        }
    }

    /// Restart a service, honoring the restart budget and exponential
    /// backoff (`base · 2^attempt` before the spawn).
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RestartExhausted`] when the window
    /// budget is spent (state pinned unreachable, event emitted), and
    /// spawn errors otherwise.
    pub async fn restart_service(self: &Arc<Self>, name: &str) -> SupervisorResult<u32> {
        let window = Duration::from_secs_f64(self.settings.restart_window_seconds);

        // Reserve a restart slot under the lock so concurrent triggers
        // cannot overrun the budget
        let (command, cwd, attempt, backoff) = {
            let mut services = self.services.lock().await;
            let record = services
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;

            if record.restart_command.is_empty() {
                return Err(SupervisorError::NoRestartCommand(name.to_string()));
            }

            let now = Instant::now();
            record
                .restart_history
                .retain(|t| now.duration_since(*t) < window);

            let used = record.restart_history.len() as u32;
            if used >= self.settings.max_restarts {
                record.state = ServiceState::Unreachable;
                self.events.publish(SoniaEvent::RestartExhausted {
                    service: name.to_string(),
                    restart_count: used,
                    window_s: self.settings.restart_window_seconds,
                    timestamp: Timestamp::now(),
                });
                warn!(
                    service = name,
                    restarts = used,
                    window_s = self.settings.restart_window_seconds,
                    "restart policy exhausted"
                );
                return Err(SupervisorError::RestartExhausted {
                    service: name.to_string(),
                    count: used,
                    window_s: self.settings.restart_window_seconds,
                });
            }

            record.restart_history.push(now);
            let backoff = Duration::from_secs_f64(
                self.settings.backoff_base_seconds * f64::from(1u32 << used.min(16)),
            );
            (
                record.restart_command.clone(),
                record.restart_cwd.clone(),
                used,
                backoff,
            )
        };

        info!(service = name, backoff_s = backoff.as_secs_f64(), "restart backoff");
        tokio::time::sleep(backoff).await;

        info!(
            service = name,
            attempt = attempt + 1,
            max = self.settings.max_restarts,
            "restarting service"
        );
        let mut builder = tokio::process::Command::new(&command[0]);
        builder
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(cwd) = &cwd {
            builder.current_dir(cwd);
        }

        match builder.spawn() {
            Ok(child) => {
                let pid = child.id();
                {
                    let mut services = self.services.lock().await;
                    if let Some(record) = services.get_mut(name) {
                        record.state = ServiceState::Recovering;
                        record.consecutive_failures = 0;
                    }
                }
                self.events.publish(SoniaEvent::ServiceRestarted {
                    service: name.to_string(),
                    pid,
                    attempt: attempt + 1,
                    backoff_s: backoff.as_secs_f64(),
                    timestamp: Timestamp::now(),
                });
                Ok(attempt + 1)
            }
            Err(e) => {
                error!(service = name, error = %e, "restart spawn failed");
                self.events.publish(SoniaEvent::RestartFailed {
                    service: name.to_string(),
                    error: e.to_string(),
                    timestamp: Timestamp::now(),
                });
                Err(SupervisorError::SpawnFailed {
                    service: name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Probe every service once.
    pub async fn probe_all(self: &Arc<Self>) {
        let names: Vec<String> = {
            let services = self.services.lock().await;
            services.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.probe_service(&name).await {
                error!(service = name, error = %e, "probe failed");
            }
        }
    }

    /// Run the probe loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs_f64(self.settings.poll_interval_seconds);
        info!(interval_s = self.settings.poll_interval_seconds, "supervision polling started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("supervision polling stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    self.probe_all().await;
                }
            }
        }
    }

    /// Toggle maintenance mode. Suppresses auto-restart, not probing.
    pub fn set_maintenance_mode(&self, enabled: bool) -> bool {
        let old = self.maintenance.swap(enabled, Ordering::SeqCst);
        self.events.publish(SoniaEvent::MaintenanceToggled {
            old,
            new: enabled,
            timestamp: Timestamp::now(),
        });
        old
    }

    /// Whether maintenance mode is on.
    #[must_use]
    pub fn maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Current state of one service.
    pub async fn get_service_state(&self, name: &str) -> Option<ServiceState> {
        self.services.lock().await.get(name).map(|r| r.state)
    }

    /// Status snapshot for the HTTP surface.
    pub async fn get_status(&self) -> serde_json::Value {
        let services = self.services.lock().await;
        let snapshots: HashMap<&String, serde_json::Value> = services
            .iter()
            .map(|(name, record)| (name, record.to_snapshot()))
            .collect();
        serde_json::json!({
            "services": snapshots,
            "maintenance_mode": self.maintenance.load(Ordering::SeqCst),
            "uptime_seconds": (self.started_at.elapsed().as_secs_f64() * 10.0).round() / 10.0,
        })
    }

    /// The service dependency graph, for diagnostics.
    pub async fn get_dependency_graph(&self) -> HashMap<String, Vec<String>> {
        let services = self.services.lock().await;
        services
            .iter()
            .map(|(name, record)| (name.clone(), record.depends_on.clone()))
            .collect()
    }
}

impl std::fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("maintenance", &self.maintenance)
            .finish_non_exhaustive()
    }
}

/// The state machine. One failure degrades, three make the service
/// unreachable; recovery requires `recovery_probes` consecutive
/// successes, passing through `recovering`.
fn next_state(record: &ServiceRecord, healthy: bool, recovery_probes: u32) -> ServiceState {
    if healthy {
        match record.state {
            ServiceState::Unreachable | ServiceState::Degraded | ServiceState::Unknown => {
                if record.consecutive_successes >= recovery_probes {
                    ServiceState::Healthy
                } else {
                    ServiceState::Recovering
                }
            }
            ServiceState::Recovering => {
                if record.consecutive_successes >= recovery_probes {
                    ServiceState::Healthy
                } else {
                    ServiceState::Recovering
                }
            }
            ServiceState::Healthy => ServiceState::Healthy,
        }
    } else if record.consecutive_failures >= 3 {
        ServiceState::Unreachable
    } else {
        ServiceState::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonia_config::ServiceEntry;

    fn settings(restart_command: Vec<String>) -> SupervisorSection {
        let mut services = HashMap::new();
        services.insert(
            "memory-engine".to_string(),
            ServiceEntry {
                host: "127.0.0.1".to_string(),
                port: 7020,
                health_endpoint: "/healthz".to_string(),
                restart_command,
                restart_cwd: None,
                depends_on: vec![],
            },
        );
        SupervisorSection {
            poll_interval_seconds: 0.05,
            probe_timeout_seconds: 1.0,
            recovery_probes: 2,
            max_restarts: 3,
            restart_window_seconds: 300.0,
            backoff_base_seconds: 0.01,
            services,
            ..SupervisorSection::default()
        }
    }

    fn unhealthy() -> ProbeOutcome {
        ProbeOutcome {
            healthy: false,
            latency_ms: 1.0,
            error: Some("HTTP 500".to_string()),
        }
    }

    fn healthy() -> ProbeOutcome {
        ProbeOutcome {
            healthy: true,
            latency_ms: 1.0,
            error: None,
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_degraded_then_unreachable() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        let mut receiver = supervisor.events.subscribe();

        supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Degraded)
        );
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "supervision.service.degraded");

        supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Unreachable)
        );
    }

    #[tokio::test]
    async fn test_recovery_requires_consecutive_successes() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        for _ in 0..3 {
            supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        }

        supervisor.apply_probe("memory-engine", healthy()).await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Recovering)
        );

        supervisor.apply_probe("memory-engine", healthy()).await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Healthy)
        );
    }

    #[tokio::test]
    async fn test_failure_during_recovery_degrades_again() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        for _ in 0..3 {
            supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        }
        supervisor.apply_probe("memory-engine", healthy()).await.unwrap();
        supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Degraded)
        );
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        assert!(matches!(
            supervisor.apply_probe("ghost", healthy()).await,
            Err(SupervisorError::UnknownService(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Restart policy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_restart_budget_exhaustion() {
        let supervisor =
            ServiceSupervisor::new(settings(vec!["true".to_string()]), EventBus::new());
        let mut receiver = supervisor.events.subscribe();

        for i in 0..3 {
            let attempt = supervisor.restart_service("memory-engine").await.unwrap();
            assert_eq!(attempt, i + 1);
        }
        let err = supervisor.restart_service("memory-engine").await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::RestartExhausted { count: 3, .. }
        ));
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Unreachable)
        );

        let mut saw_exhausted = false;
        while let Some(event) = receiver.try_recv() {
            if event.event_type() == "supervision.restart.exhausted" {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn test_restart_transitions_to_recovering() {
        let supervisor =
            ServiceSupervisor::new(settings(vec!["true".to_string()]), EventBus::new());
        for _ in 0..3 {
            supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        }
        supervisor.restart_service("memory-engine").await.unwrap();
        assert_eq!(
            supervisor.get_service_state("memory-engine").await,
            Some(ServiceState::Recovering)
        );
    }

    #[tokio::test]
    async fn test_restart_without_command_fails() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        assert!(matches!(
            supervisor.restart_service("memory-engine").await,
            Err(SupervisorError::NoRestartCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_emits_event() {
        let supervisor = ServiceSupervisor::new(
            settings(vec!["/nonexistent/binary".to_string()]),
            EventBus::new(),
        );
        let mut receiver = supervisor.events.subscribe();
        assert!(supervisor.restart_service("memory-engine").await.is_err());

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "supervision.restart.failed");
    }

    // -----------------------------------------------------------------------
    // Maintenance mode
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_maintenance_suppresses_auto_restart() {
        let supervisor =
            ServiceSupervisor::new(settings(vec!["true".to_string()]), EventBus::new());
        supervisor.set_maintenance_mode(true);

        for _ in 0..3 {
            supervisor.apply_probe("memory-engine", unhealthy()).await.unwrap();
        }
        // Unreachable, but no restart was spawned
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = supervisor.get_status().await;
        assert_eq!(status["maintenance_mode"], true);
        assert_eq!(
            status["services"]["memory-engine"]["restarts_in_window"],
            0
        );
    }

    #[tokio::test]
    async fn test_status_and_dependency_graph() {
        let supervisor = ServiceSupervisor::new(settings(vec![]), EventBus::new());
        let status = supervisor.get_status().await;
        assert_eq!(status["services"]["memory-engine"]["state"], "unknown");

        let graph = supervisor.get_dependency_graph().await;
        assert!(graph.contains_key("memory-engine"));
    }
}
