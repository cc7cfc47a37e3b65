// Common test utilities and helpers

use crate::config::{
    BreakerConfig, CorrelationConfig, CostControlConfig, PlanConfig, SamplerConfig,
    VerificationConfig,
};
use crate::models::{DatabaseKind, Record, Source};
use crate::services::InternalMetrics;
use crate::services::pipeline::{
    AdaptiveSampler, BreakerStage, CostController, Pipeline, PlanExtractor, Processor,
    QueryCorrelator, SourceBreaker, VerificationProcessor,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn pg_source() -> Source {
    Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
}

pub fn mysql_source() -> Source {
    Source::new(DatabaseKind::MySql, "db2:3306", "app")
}

pub fn gauge(source: Source, name: &str, value: f64) -> Record {
    Record::gauge(source, name, value)
}

/// The full processor chain wired the way the binary wires it, with
/// permissive budgets so only the stage under test interferes
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub breaker: Arc<SourceBreaker>,
    pub findings: mpsc::Receiver<crate::services::pipeline::Finding>,
}

pub fn build_full_pipeline() -> TestPipeline {
    let breaker = Arc::new(SourceBreaker::new(BreakerConfig::default()));
    let (verification, findings) = VerificationProcessor::new(VerificationConfig::default());

    let stages: Vec<Arc<dyn Processor>> = vec![
        Arc::new(BreakerStage::new(breaker.clone())),
        Arc::new(PlanExtractor::new(PlanConfig::default())),
        Arc::new(verification),
        Arc::new(AdaptiveSampler::new(SamplerConfig::default())),
        Arc::new(CostController::new(&CostControlConfig {
            max_data_points_per_minute: 1_000_000,
            max_distinct_series: 1_000_000,
            enforcement_mode: "drop".to_string(),
        })),
        Arc::new(QueryCorrelator::new(&CorrelationConfig::default())),
    ];

    TestPipeline {
        pipeline: Pipeline::new(stages, Arc::new(InternalMetrics::new())),
        breaker,
        findings,
    }
}
