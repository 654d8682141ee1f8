use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns relay status and who is connected
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.relay.registry();
    let users = registry.usernames().await;
    let snapshot = state.relay.snapshot();

    // Peers dropping their connection is routine; only caught faults degrade
    let status = if snapshot.errors.faults == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        connections: users.len(),
        users,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
