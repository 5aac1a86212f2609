//! Supervisor HTTP surface.
//!
//! - `GET /status` — full supervision snapshot
//! - `POST /maintenance {enabled}` — toggle maintenance mode
//! - `POST /services/{name}/restart` — manual restart

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use crate::error::SupervisorError;
use crate::supervisor::ServiceSupervisor;

/// Build the supervisor router.
#[must_use]
pub fn router(supervisor: Arc<ServiceSupervisor>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/maintenance", post(maintenance))
        .route("/services/:name/restart", post(restart))
        .with_state(supervisor)
}

async fn status(State(supervisor): State<Arc<ServiceSupervisor>>) -> Json<JsonValue> {
    Json(supervisor.get_status().await)
}

#[derive(Debug, Deserialize)]
struct MaintenanceBody {
    enabled: bool,
}

async fn maintenance(
    State(supervisor): State<Arc<ServiceSupervisor>>,
    Json(body): Json<MaintenanceBody>,
) -> Json<JsonValue> {
    let previous = supervisor.set_maintenance_mode(body.enabled);
    Json(json!({
        "maintenance_mode": body.enabled,
        "previous": previous,
    }))
}

async fn restart(
    State(supervisor): State<Arc<ServiceSupervisor>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<JsonValue>) {
    match supervisor.restart_service(&name).await {
        Ok(attempt) => (
            StatusCode::OK,
            Json(json!({"ok": true, "service": name, "attempt": attempt})),
        ),
        Err(e @ SupervisorError::UnknownService(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "service": name, "error": e.to_string()})),
        ),
        Err(e @ SupervisorError::RestartExhausted { .. }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "service": name, "error": e.to_string()})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "service": name, "error": e.to_string()})),
        ),
    }
}
