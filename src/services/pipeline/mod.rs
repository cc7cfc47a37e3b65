// Pipeline Module
// Purpose: Compose the processor chain every record flows through:
//   memory-limit -> circuit breaker -> plan extractor -> verification ->
//   adaptive sampler -> cost controller -> correlator -> batcher -> export
// Each stage is a pure function on a batch; state that survives batches
// lives in the stage's owned store.

pub mod adaptive_sampler;
pub mod anonymizer;
pub mod batcher;
pub mod circuit_breaker;
pub mod correlator;
pub mod cost_controller;
pub mod memory_limiter;
pub mod plan_dictionary;
pub mod plan_extractor;
pub mod runtime;
pub mod verification;

pub use adaptive_sampler::AdaptiveSampler;
pub use batcher::Batcher;
pub use circuit_breaker::{CircuitState, Outcome, SourceBreaker};
pub use correlator::QueryCorrelator;
pub use cost_controller::CostController;
pub use memory_limiter::{MemoryCheckTask, MemoryLimiter, MemoryState};
pub use plan_extractor::PlanExtractor;
pub use runtime::{PipelineHandle, spawn_pipeline_runtime};
pub use verification::{Finding, VerificationProcessor};

use crate::models::Record;
use crate::services::internal_metrics::InternalMetrics;
use crate::utils::CollectorResult;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One stage of the processor chain
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transform a batch. Dropping records and appending derived records are
    /// both allowed; the envelope of a record passing through is untouched.
    fn process(&self, batch: Vec<Record>) -> CollectorResult<Vec<Record>>;
}

/// Lock-free per-stage counters
#[derive(Default)]
pub struct StageStats {
    pub records_in: AtomicU64,
    pub records_out: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
}

/// Breaker adapter: drops records from open sources and injects pending
/// state-transition events into the stream
pub struct BreakerStage {
    breaker: Arc<SourceBreaker>,
}

impl BreakerStage {
    pub fn new(breaker: Arc<SourceBreaker>) -> Self {
        Self { breaker }
    }
}

impl Processor for BreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn process(&self, batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        let mut out: Vec<Record> =
            batch.into_iter().filter(|r| self.breaker.passes(r.source())).collect();
        out.extend(self.breaker.drain_events());
        Ok(out)
    }
}

/// The composed chain
pub struct Pipeline {
    stages: Vec<Arc<dyn Processor>>,
    stats: Vec<Arc<StageStats>>,
    metrics: Arc<InternalMetrics>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Processor>>, metrics: Arc<InternalMetrics>) -> Self {
        let stats = stages.iter().map(|_| Arc::new(StageStats::default())).collect();
        Self { stages, stats, metrics }
    }

    /// Run a batch through every stage in order.
    ///
    /// A stage error or panic drops the in-flight batch at that stage and
    /// is counted; it never unwinds into the runtime.
    pub fn process(&self, batch: Vec<Record>) -> Vec<Record> {
        let mut current = batch;

        for (stage, stats) in self.stages.iter().zip(&self.stats) {
            if current.is_empty() {
                break;
            }
            let in_len = current.len() as u64;
            stats.records_in.fetch_add(in_len, Ordering::Relaxed);

            let stage_ref = stage.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(move || stage_ref.process(current)));

            current = match result {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    stats.dropped.fetch_add(in_len, Ordering::Relaxed);
                    self.metrics.record_error(stage.name(), e.kind_label());
                    tracing::error!("Stage '{}' failed, batch dropped: {}", stage.name(), e);
                    Vec::new()
                },
                Err(panic) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    stats.dropped.fetch_add(in_len, Ordering::Relaxed);
                    self.metrics.record_error(stage.name(), "panic");
                    tracing::error!(
                        "Stage '{}' panicked, batch dropped: {}",
                        stage.name(),
                        panic_message(&panic)
                    );
                    Vec::new()
                },
            };

            let out_len = current.len() as u64;
            stats.records_out.fetch_add(out_len, Ordering::Relaxed);
            // Stages may append derived records, so only net removals count
            // as drops
            if out_len < in_len {
                let dropped = in_len - out_len;
                stats.dropped.fetch_add(dropped, Ordering::Relaxed);
                self.metrics.record_stage_drop(stage.name(), dropped);
            }
        }

        current
    }

    /// (stage name, snapshot) pairs for the internal metrics endpoint
    pub fn stage_snapshots(&self) -> Vec<(&'static str, u64, u64, u64, u64)> {
        self.stages
            .iter()
            .zip(&self.stats)
            .map(|(stage, stats)| {
                (
                    stage.name(),
                    stats.records_in.load(Ordering::Relaxed),
                    stats.records_out.load(Ordering::Relaxed),
                    stats.dropped.load(Ordering::Relaxed),
                    stats.errors.load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};

    fn source() -> Source {
        Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
    }

    struct DropHalf;

    impl Processor for DropHalf {
        fn name(&self) -> &'static str {
            "drop_half"
        }

        fn process(&self, batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
            Ok(batch.into_iter().enumerate().filter(|(i, _)| i % 2 == 0).map(|(_, r)| r).collect())
        }
    }

    struct Panicker;

    impl Processor for Panicker {
        fn name(&self) -> &'static str {
            "panicker"
        }

        fn process(&self, _batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
            panic!("boom");
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::gauge(source(), format!("m{}", i), 1.0)).collect()
    }

    #[test]
    fn test_stage_drop_counters_match_removals() {
        let stages: Vec<Arc<dyn Processor>> = vec![Arc::new(DropHalf)];
        let pipeline = Pipeline::new(stages, Arc::new(InternalMetrics::new()));
        let out = pipeline.process(records(10));
        assert_eq!(out.len(), 5);

        let snapshots = pipeline.stage_snapshots();
        let (_, records_in, records_out, dropped, errors) = snapshots[0];
        assert_eq!(records_in, 10);
        assert_eq!(records_out, 5);
        assert_eq!(dropped, 5);
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_panic_is_contained_and_counted() {
        let stages: Vec<Arc<dyn Processor>> = vec![Arc::new(Panicker), Arc::new(DropHalf)];
        let pipeline = Pipeline::new(stages, Arc::new(InternalMetrics::new()));
        let out = pipeline.process(records(4));
        assert!(out.is_empty());

        let snapshots = pipeline.stage_snapshots();
        assert_eq!(snapshots[0].4, 1, "panic counted as stage error");
        // Later stages saw nothing
        assert_eq!(snapshots[1].1, 0);
    }

    #[test]
    fn test_envelope_preserved_through_chain() {
        let stages: Vec<Arc<dyn Processor>> = vec![Arc::new(DropHalf)];
        let pipeline = Pipeline::new(stages, Arc::new(InternalMetrics::new()));
        let input = records(2);
        let ts = input[0].timestamp();
        let src = input[0].source().clone();
        let out = pipeline.process(input);
        assert_eq!(out[0].timestamp(), ts);
        assert_eq!(out[0].source(), &src);
    }
}
