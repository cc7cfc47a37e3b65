//! OTLP/HTTP receiver
//!
//! Accepts OTLP/JSON payloads from peer collectors or application code on
//! the standard signal paths (/v1/metrics, /v1/logs, /v1/traces), using the
//! wire types' own serde mapping. Ingested records flow through the same
//! pipeline as scraped ones.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use std::sync::Arc;

use crate::CollectorState;
use crate::models::Record;
use crate::services::otlp_transform;
use crate::utils::CollectorError;

pub async fn post_metrics(
    State(state): State<Arc<CollectorState>>,
    Json(request): Json<ExportMetricsServiceRequest>,
) -> impl IntoResponse {
    let records = otlp_transform::records_from_metrics(request);
    match accept(&state, records).await {
        Ok(()) => (StatusCode::OK, Json(ExportMetricsServiceResponse::default())).into_response(),
        Err(busy) => busy,
    }
}

pub async fn post_logs(
    State(state): State<Arc<CollectorState>>,
    Json(request): Json<ExportLogsServiceRequest>,
) -> impl IntoResponse {
    let records = otlp_transform::records_from_logs(request);
    match accept(&state, records).await {
        Ok(()) => (StatusCode::OK, Json(ExportLogsServiceResponse::default())).into_response(),
        Err(busy) => busy,
    }
}

pub async fn post_traces(
    State(state): State<Arc<CollectorState>>,
    Json(request): Json<ExportTraceServiceRequest>,
) -> impl IntoResponse {
    let records = otlp_transform::records_from_traces(request);
    match accept(&state, records).await {
        Ok(()) => (StatusCode::OK, Json(ExportTraceServiceResponse::default())).into_response(),
        Err(busy) => busy,
    }
}

async fn accept(state: &CollectorState, records: Vec<Record>) -> Result<(), axum::response::Response> {
    if records.is_empty() {
        return Ok(());
    }
    match state.pipeline_handle.submit(records).await {
        Ok(()) => Ok(()),
        Err(CollectorError::Busy) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "message": "collector is busy, retry later" })),
        )
            .into_response()),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "message": "collector is shutting down" })),
        )
            .into_response()),
    }
}
