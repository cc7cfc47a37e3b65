use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::CollectorState;
use crate::services::Health;

/// Aggregated liveness/readiness derived from each component's own probe.
/// Degraded (e.g. one breaker open) still answers 200; only unhealthy
/// components flip the endpoint to 503.
pub async fn get_health(State(state): State<Arc<CollectorState>>) -> impl IntoResponse {
    let report = state.health.report();
    let status = match report.status {
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}
