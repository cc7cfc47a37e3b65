//! Pipeline runtime
//!
//! Owns the inlet channel, drives batches through the processor chain, and
//! fans completed batches out to every exporter worker. A full exporter
//! queue back-pressures the fan-out, which stalls the batcher; the memory
//! limiter refuses new input at the inlet before that ever becomes fatal.

use super::{Batcher, MemoryLimiter, Pipeline};
use crate::config::BatchConfig;
use crate::models::Record;
use crate::services::exporters::ExporterHandle;
use crate::services::internal_metrics::InternalMetrics;
use crate::utils::{CollectorError, CollectorResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long the runtime keeps draining after shutdown is signalled
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Producer-side handle; receivers (scrapers, samplers, the OTLP receiver)
/// submit through this so memory back-pressure applies uniformly
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Vec<Record>>,
    limiter: Arc<MemoryLimiter>,
}

impl PipelineHandle {
    /// Submit a batch; `Busy` when the memory limiter is engaged, which
    /// producers treat as "pause this cycle"
    pub async fn submit(&self, records: Vec<Record>) -> CollectorResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        if !self.limiter.can_accept() {
            return Err(CollectorError::Busy);
        }
        self.tx.send(records).await.map_err(|_| CollectorError::Shutdown)
    }

    /// Non-blocking submit for sync contexts (feedback drainer)
    pub fn try_submit(&self, records: Vec<Record>) -> CollectorResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        if !self.limiter.can_accept() {
            return Err(CollectorError::Busy);
        }
        self.tx.try_send(records).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CollectorError::Busy,
            mpsc::error::TrySendError::Closed(_) => CollectorError::Shutdown,
        })
    }
}

pub fn spawn_pipeline_runtime(
    pipeline: Arc<Pipeline>,
    batch_config: &BatchConfig,
    limiter: Arc<MemoryLimiter>,
    exporters: Vec<ExporterHandle>,
    metrics: Arc<InternalMetrics>,
) -> (PipelineHandle, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<Record>>(64);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut batcher = Batcher::new(batch_config);
    let handle = PipelineHandle { tx, limiter: limiter.clone() };

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                incoming = rx.recv() => {
                    match incoming {
                        Some(records) => {
                            metrics.incr("collector_records_received_total", records.len() as u64);
                            let processed = pipeline.process(records);
                            if limiter.should_shed() {
                                let shed = batcher.shed_oldest();
                                if shed > 0 {
                                    limiter.shed_batches.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                    tracing::warn!("Memory critical: shed {} pending record(s)", shed);
                                }
                            }
                            for batch in batcher.push(processed) {
                                dispatch(&exporters, batch, &metrics).await;
                            }
                        },
                        None => break,
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if let Some(batch) = batcher.flush_if_due() {
                        dispatch(&exporters, batch, &metrics).await;
                    }
                },
            }
        }

        // Drain: process whatever is already queued, bounded by the deadline
        let drain = async {
            while let Ok(records) = rx.try_recv() {
                let processed = pipeline.process(records);
                for batch in batcher.push(processed) {
                    dispatch(&exporters, batch, &metrics).await;
                }
            }
            while let Some(batch) = batcher.flush() {
                dispatch(&exporters, batch, &metrics).await;
            }
        };
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            tracing::warn!(
                "Pipeline drain exceeded {:?}; {} in-flight record(s) discarded",
                DRAIN_DEADLINE,
                batcher.pending_len()
            );
        }

        tracing::info!("Pipeline runtime stopped");
        // Exporter handles drop here, closing every worker queue
    });

    (handle, shutdown_tx, join)
}

/// Concurrent fan-out: all exporters see the same batch; a full queue
/// blocks until the worker catches up
async fn dispatch(exporters: &[ExporterHandle], batch: Vec<Record>, metrics: &InternalMetrics) {
    if batch.is_empty() {
        return;
    }
    metrics.incr("collector_records_exported_total", batch.len() as u64);
    let shared = Arc::new(batch);
    for exporter in exporters {
        if !exporter.dispatch(shared.clone()).await {
            tracing::warn!("Exporter '{}' queue closed, batch not delivered", exporter.name);
        }
    }
}
