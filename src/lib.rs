//! dbpulse Library
//!
//! This library contains all the core modules for the dbpulse collector.

use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::pipeline::{
    AdaptiveSampler, CostController, MemoryLimiter, Pipeline, PipelineHandle, PlanExtractor,
    QueryCorrelator, SourceBreaker, VerificationProcessor,
};
pub use services::{
    AdapterManager, AshSampler, FeatureDetector, HealthRegistry, InternalMetrics, QuerySelector,
    SqlScraper,
};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// Every store is created once at wiring time and owned by exactly one
/// component; coordination is by records flowing between stages.
#[derive(Clone)]
pub struct CollectorState {
    pub config: Config,

    pub adapter_manager: Arc<AdapterManager>,
    pub breaker: Arc<SourceBreaker>,
    pub pipeline: Arc<Pipeline>,
    pub pipeline_handle: PipelineHandle,
    pub memory_limiter: Arc<MemoryLimiter>,
    pub internal_metrics: Arc<InternalMetrics>,
    pub health: HealthRegistry,
}
