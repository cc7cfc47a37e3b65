use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use std::sync::Arc;

use crate::CollectorState;

/// Prometheus scrape endpoint for the collector's own pipeline and system
/// metrics
pub async fn get_metrics(State(state): State<Arc<CollectorState>>) -> impl IntoResponse {
    // Refresh the scrape-time gauges from the pipeline's atomic counters
    for (stage, records_in, records_out, _dropped, errors) in state.pipeline.stage_snapshots() {
        state.internal_metrics.set_stage_stats(stage, records_in, records_out, errors);
    }
    state.internal_metrics.set_adapters(state.adapter_manager.adapter_count() as i64);

    let body = state.internal_metrics.render_prometheus();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
