//! Background maintenance tasks
//!
//! Feature refresh, plan-dictionary cleanup, and the verification feedback
//! drainer. Each runs on its own worker through the ScheduledExecutor
//! framework (the drainer is channel-driven and spawns directly).

use crate::services::feature_detector::FeatureDetector;
use crate::services::pipeline::{Finding, PipelineHandle, PlanExtractor};
use crate::utils::{CollectorError, ScheduledTask};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

// ============================================================================
// Feature Refresh Task
// ============================================================================

/// Re-runs feature detection when the cache goes stale and re-emits the
/// availability gauges after every refresh
pub struct FeatureRefreshTask {
    detector: Arc<FeatureDetector>,
    handle: PipelineHandle,
    shutdown: Arc<AtomicBool>,
}

impl FeatureRefreshTask {
    pub fn new(detector: Arc<FeatureDetector>, handle: PipelineHandle) -> Self {
        Self { detector, handle, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    async fn execute(&self) -> Result<(), anyhow::Error> {
        let refreshed = match self.detector.refresh_if_stale().await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!("Feature refresh for {} failed: {}", self.detector.source(), e);
                return Ok(());
            },
        };

        if refreshed {
            match self.handle.submit(self.detector.feature_records()).await {
                Ok(()) | Err(CollectorError::Busy) => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl ScheduledTask for FeatureRefreshTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move { self.execute().await })
    }

    fn should_terminate(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Plan Dictionary Cleanup Task
// ============================================================================

/// Evicts plans past their retention period
pub struct PlanCleanupTask {
    extractor: Arc<PlanExtractor>,
    shutdown: Arc<AtomicBool>,
}

impl PlanCleanupTask {
    pub fn new(extractor: Arc<PlanExtractor>) -> Self {
        Self { extractor, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }
}

impl ScheduledTask for PlanCleanupTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let evicted = self.extractor.evict_expired();
            if evicted > 0 {
                tracing::info!("Plan dictionary cleanup evicted {} entr(ies)", evicted);
            }
            Ok(())
        })
    }

    fn should_terminate(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Feedback Drainer
// ============================================================================

/// Drains verification findings and feeds them back into the pipeline as
/// log records, so feedback shares the normal export path
pub fn spawn_feedback_drainer(
    mut findings: mpsc::Receiver<Finding>,
    handle: PipelineHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(finding) = findings.recv().await {
            let record = finding.into_record();
            if let Err(e) = handle.try_submit(vec![record]) {
                tracing::debug!("Feedback record not submitted: {}", e);
            }
        }
        tracing::info!("Feedback drainer stopped");
    })
}
