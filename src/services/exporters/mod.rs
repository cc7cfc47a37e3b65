// Exporters Module
// Purpose: Fan batches out to every configured sink. Each exporter runs on
// its own worker with a bounded queue; a full queue back-pressures the
// batcher, and the memory limiter is the final safety valve behind that.

pub mod debug;
pub mod file;
pub mod otlp;
pub mod spool;

pub use debug::DebugExporter;
pub use file::FileExporter;
pub use otlp::OtlpExporter;
pub use spool::SpoolQueue;

use crate::models::Record;
use crate::services::internal_metrics::InternalMetrics;
use crate::utils::CollectorResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One telemetry sink
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send one batch; a returned error triggers the worker's retry policy
    async fn export(&self, batch: &[Record]) -> CollectorResult<()>;

    /// Flush and release resources; called once after the queue drains
    async fn shutdown(&self) {}
}

/// Retry-with-exponential-backoff policy, capped by total elapsed time
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(initial_ms: u64, max_elapsed_secs: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms.max(1)),
            max_elapsed: Duration::from_secs(max_elapsed_secs),
        }
    }
}

/// Sender half handed to the pipeline runtime for fan-out
#[derive(Clone)]
pub struct ExporterHandle {
    pub name: &'static str,
    tx: mpsc::Sender<Arc<Vec<Record>>>,
}

impl ExporterHandle {
    /// Blocks when the exporter's queue is full; that is the back-pressure
    /// path that stalls the batcher
    pub async fn dispatch(&self, batch: Arc<Vec<Record>>) -> bool {
        self.tx.send(batch).await.is_ok()
    }

    pub fn queue_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Spawn a worker owning one exporter: bounded inbound queue, retry with
/// exponential backoff, and an optional file-backed spool for batches that
/// exhaust their retry budget. Spooled batches are replayed on startup.
pub fn spawn_exporter_worker(
    exporter: Arc<dyn Exporter>,
    queue_size: usize,
    retry: RetryPolicy,
    spool: Option<Arc<SpoolQueue>>,
    metrics: Arc<InternalMetrics>,
) -> (ExporterHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Arc<Vec<Record>>>(queue_size.max(1));
    let name = exporter.name();

    let handle = tokio::spawn(async move {
        if let Some(spool) = &spool {
            replay_spool(&*exporter, spool, &retry, &metrics).await;
        }

        while let Some(batch) = rx.recv().await {
            if export_with_retry(&*exporter, &batch, &retry).await {
                metrics.incr(&format!("collector_exported_batches_total_{}", name), 1);
                continue;
            }

            metrics.record_error(name, "export");
            match &spool {
                Some(spool) => {
                    if let Err(e) = spool.append(&batch) {
                        tracing::warn!("Exporter '{}' could not spool failed batch: {}", name, e);
                    } else {
                        tracing::info!(
                            "Exporter '{}' spooled a failed batch of {} record(s)",
                            name,
                            batch.len()
                        );
                    }
                },
                None => {
                    tracing::warn!(
                        "Exporter '{}' dropped a batch of {} record(s) after retries",
                        name,
                        batch.len()
                    );
                },
            }
        }

        // Queue closed: compact the spool and flush the sink
        if let Some(spool) = &spool
            && let Err(e) = spool.compact()
        {
            tracing::warn!("Exporter '{}' spool compaction failed: {}", name, e);
        }
        exporter.shutdown().await;
        tracing::info!("Exporter '{}' worker stopped", name);
    });

    (ExporterHandle { name, tx }, handle)
}

/// Retry until success or the policy's elapsed budget runs out
async fn export_with_retry(exporter: &dyn Exporter, batch: &[Record], retry: &RetryPolicy) -> bool {
    let started = Instant::now();
    let mut delay = retry.initial;

    loop {
        match exporter.export(batch).await {
            Ok(()) => return true,
            Err(e) => {
                if started.elapsed() + delay > retry.max_elapsed {
                    tracing::warn!(
                        "Exporter '{}' giving up after {:?}: {}",
                        exporter.name(),
                        started.elapsed(),
                        e
                    );
                    return false;
                }
                tracing::debug!("Exporter '{}' send failed, retrying in {:?}: {}", exporter.name(), delay, e);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            },
        }
    }
}

async fn replay_spool(
    exporter: &dyn Exporter,
    spool: &SpoolQueue,
    retry: &RetryPolicy,
    metrics: &InternalMetrics,
) {
    if let Err(e) = spool.compact() {
        tracing::warn!("Spool compaction on startup failed: {}", e);
    }
    let segments = match spool.segments() {
        Ok(segments) => segments,
        Err(e) => {
            tracing::warn!("Spool unreadable: {}", e);
            return;
        },
    };

    for path in segments {
        match spool.read_segment(&path) {
            Ok(batch) if batch.is_empty() => spool.remove_segment(&path),
            Ok(batch) => {
                if export_with_retry(exporter, &batch, retry).await {
                    spool.remove_segment(&path);
                    metrics.incr("collector_spool_replayed_batches_total", 1);
                } else {
                    // Endpoint still down; leave the segment for next time
                    break;
                }
            },
            Err(e) => {
                tracing::warn!("Dropping corrupt spool segment {:?}: {}", path, e);
                spool.remove_segment(&path);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn records(n: usize) -> Vec<Record> {
        let source = Source::new(DatabaseKind::Postgres, "db1:5432", "orders");
        (0..n).map(|i| Record::gauge(source.clone(), format!("m{}", i), 1.0)).collect()
    }

    struct FlakyExporter {
        fail_first: u64,
        attempts: AtomicU64,
        exported: AtomicU64,
    }

    #[async_trait]
    impl Exporter for FlakyExporter {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn export(&self, batch: &[Record]) -> CollectorResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(crate::utils::CollectorError::export_failed("flaky", "transient"));
            }
            self.exported.fetch_add(batch.len() as u64, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let exporter = Arc::new(FlakyExporter {
            fail_first: 2,
            attempts: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        });
        let retry = RetryPolicy::new(1, 30);
        assert!(export_with_retry(&*exporter, &records(5), &retry).await);
        assert_eq!(exporter.exported.load(Ordering::SeqCst), 5);
        assert_eq!(exporter.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_within_budget() {
        let exporter = Arc::new(FlakyExporter {
            fail_first: u64::MAX,
            attempts: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        });
        let retry = RetryPolicy { initial: Duration::from_millis(5), max_elapsed: Duration::from_millis(20) };
        assert!(!export_with_retry(&*exporter, &records(1), &retry).await);
    }

    #[tokio::test]
    async fn test_worker_exports_queued_batches() {
        let exporter = Arc::new(FlakyExporter {
            fail_first: 0,
            attempts: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        });
        let (handle, join) = spawn_exporter_worker(
            exporter.clone(),
            8,
            RetryPolicy::new(1, 1),
            None,
            Arc::new(InternalMetrics::new()),
        );

        assert!(handle.dispatch(Arc::new(records(3))).await);
        assert!(handle.dispatch(Arc::new(records(2))).await);
        drop(handle);
        join.await.unwrap();

        assert_eq!(exporter.exported.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failed_batches_spool_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(SpoolQueue::open(dir.path(), 16).unwrap());

        // First worker: everything fails, batches land in the spool
        let failing = Arc::new(FlakyExporter {
            fail_first: u64::MAX,
            attempts: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        });
        let (handle, join) = spawn_exporter_worker(
            failing,
            8,
            RetryPolicy { initial: Duration::from_millis(1), max_elapsed: Duration::from_millis(5) },
            Some(spool.clone()),
            Arc::new(InternalMetrics::new()),
        );
        assert!(handle.dispatch(Arc::new(records(4))).await);
        drop(handle);
        join.await.unwrap();
        assert!(spool.segment_count() > 0);

        // Second worker: healthy endpoint, spool replays on startup
        let healthy = Arc::new(FlakyExporter {
            fail_first: 0,
            attempts: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        });
        let (handle, join) = spawn_exporter_worker(
            healthy.clone(),
            8,
            RetryPolicy::new(1, 1),
            Some(spool.clone()),
            Arc::new(InternalMetrics::new()),
        );
        drop(handle);
        join.await.unwrap();

        assert_eq!(healthy.exported.load(Ordering::SeqCst), 4);
        assert_eq!(spool.segment_count(), 0);
    }
}
