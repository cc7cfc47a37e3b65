//! SQL Scraper
//!
//! Runs the selected queries for one database on a cadence and shapes result
//! rows into typed records. One cycle covers the metric-shaped categories
//! (metrics, waits, plans) and the log-shaped category, all under a single
//! bounded deadline. Query errors are isolated per query; cycle-level
//! outcomes feed the circuit breaker so a failing database trips open
//! without stopping the tick loop that will later detect recovery.

use crate::config::DatabaseConfig;
use crate::models::{
    AttrValue, EventRecord, Envelope, MetricKind, MetricRecord, QueryCategory, QueryDefinition,
    Record, Source,
};
use crate::services::db_adapter::{DbAdapter, QueryResult};
use crate::services::feature_detector::FeatureDetector;
use crate::services::internal_metrics::InternalMetrics;
use crate::services::pipeline::{Outcome, PipelineHandle, SourceBreaker};
use crate::services::query_catalog;
use crate::services::query_selector::QuerySelector;
use crate::utils::{CollectorError, CollectorResult, ScheduledTask};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded deadline for one full collection cycle
const CYCLE_DEADLINE: Duration = Duration::from_secs(30);

/// Per-scraper counters surfaced on the internal metrics endpoint
#[derive(Default)]
pub struct ScraperStats {
    pub cycles: AtomicU64,
    pub queries_run: AtomicU64,
    pub rows_collected: AtomicU64,
    pub query_errors: AtomicU64,
    pub schema_mismatches: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub fallback_cycles: AtomicU64,
}

pub struct SqlScraper {
    adapter: Arc<dyn DbAdapter>,
    selector: Arc<QuerySelector>,
    detector: Arc<FeatureDetector>,
    breaker: Arc<SourceBreaker>,
    handle: PipelineHandle,
    metrics: Arc<InternalMetrics>,
    pub stats: ScraperStats,
    shutdown: Arc<AtomicBool>,
}

impl SqlScraper {
    pub fn new(
        adapter: Arc<dyn DbAdapter>,
        selector: Arc<QuerySelector>,
        detector: Arc<FeatureDetector>,
        breaker: Arc<SourceBreaker>,
        handle: PipelineHandle,
        metrics: Arc<InternalMetrics>,
    ) -> Self {
        Self {
            adapter,
            selector,
            detector,
            breaker,
            handle,
            metrics,
            stats: ScraperStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn source(&self) -> &Source {
        self.adapter.source()
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// One collection cycle
    pub async fn collect_cycle(&self) -> CollectorResult<()> {
        let source = self.source().clone();

        // While open, the tick still runs; allow() admits the single
        // half-open probe cycle that detects recovery
        if !self.breaker.allow(&source) {
            return Ok(());
        }

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr("collector_scrape_cycles_total", 1);
        let started = Instant::now();

        // Refresh features when the cache has gone stale
        if let Err(e) = self.detector.refresh_if_stale().await {
            tracing::warn!("Feature refresh for {} failed: {}", source, e);
        }
        let features = self.detector.current();

        let mut records: Vec<Record> = Vec::new();
        let mut query_errors = 0u32;
        let mut connection_error = false;
        let mut queries_attempted = 0u32;

        // Metric-shaped categories
        for category in [QueryCategory::Metrics, QueryCategory::Waits, QueryCategory::Plans] {
            let mut queries = self.selector.queries_for(category, &features);
            if category == QueryCategory::Metrics && queries.is_empty() {
                self.stats.fallback_cycles.fetch_add(1, Ordering::Relaxed);
                queries = query_catalog::minimal_fallback(self.adapter.kind());
            }

            for query in &queries {
                let Some(remaining) = CYCLE_DEADLINE.checked_sub(started.elapsed()) else {
                    tracing::warn!("Cycle deadline reached for {}, aborting remaining queries", source);
                    query_errors += 1;
                    break;
                };
                queries_attempted += 1;

                match self.run_query(query, remaining).await {
                    Ok(result) => records.extend(self.bind_metric_rows(query, &result)),
                    Err(e) => {
                        query_errors += 1;
                        if e.is_connection_error() {
                            connection_error = true;
                        }
                        self.note_query_error(query, &e);
                    },
                }
            }
        }

        // Log-shaped category
        let log_queries = self.selector.queries_for(QueryCategory::Logs, &features);
        for query in &log_queries {
            let Some(remaining) = CYCLE_DEADLINE.checked_sub(started.elapsed()) else {
                break;
            };
            queries_attempted += 1;

            match self.run_query(query, remaining).await {
                Ok(result) => records.extend(self.bind_log_rows(query, &result)),
                Err(e) => {
                    query_errors += 1;
                    if e.is_connection_error() {
                        connection_error = true;
                    }
                    self.note_query_error(query, &e);
                },
            }
        }

        // Cycle outcome drives the breaker
        let outcome = if connection_error {
            Outcome::ConnectionFailure
        } else if queries_attempted > 0 && query_errors >= queries_attempted {
            Outcome::QueryFailure
        } else {
            Outcome::Success
        };
        self.breaker.record(&source, outcome);

        match self.handle.submit(records).await {
            Ok(()) => Ok(()),
            Err(CollectorError::Busy) => {
                // Memory limiter engaged: this cycle's output is paused away
                tracing::debug!("Scraper for {} paused: pipeline busy", source);
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    async fn run_query(&self, query: &QueryDefinition, timeout: Duration) -> CollectorResult<QueryResult> {
        self.stats.queries_run.fetch_add(1, Ordering::Relaxed);
        self.adapter.query(&query.sql, timeout).await
    }

    fn note_query_error(&self, query: &QueryDefinition, error: &CollectorError) {
        self.stats.query_errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_error("scraper", error.kind_label());
        tracing::warn!(
            "Query '{}' failed on {}: {}",
            query.name,
            self.source(),
            error
        );
    }

    /// First numeric column is the metric value; every other column becomes
    /// a typed data-point attribute. Rows with no numeric column are schema
    /// mismatches: skipped and counted.
    fn bind_metric_rows(&self, query: &QueryDefinition, result: &QueryResult) -> Vec<Record> {
        let mut records = Vec::with_capacity(result.rows.len());
        let timestamp = Utc::now();

        for row in &result.rows {
            let Some((value_idx, value)) = QueryResult::first_numeric(row) else {
                self.stats.schema_mismatches.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error("scraper", "schema");
                continue;
            };

            let mut attributes = BTreeMap::new();
            for (idx, cell) in row.iter().enumerate() {
                if idx == value_idx {
                    continue;
                }
                if let (Some(name), Some(attr)) = (result.columns.get(idx), cell.to_attr()) {
                    attributes.insert(name.clone(), attr);
                }
            }

            self.stats.rows_collected.fetch_add(1, Ordering::Relaxed);
            records.push(Record::Metric(MetricRecord {
                envelope: Envelope::at(self.source().clone(), timestamp),
                name: metric_name(&query.name),
                unit: String::new(),
                kind: MetricKind::Gauge,
                value,
                histogram_buckets: Vec::new(),
                attributes,
            }));
        }
        records
    }

    /// Log rows become events whose body is a pipe-joined key: value summary
    fn bind_log_rows(&self, query: &QueryDefinition, result: &QueryResult) -> Vec<Record> {
        let mut records = Vec::with_capacity(result.rows.len());
        let timestamp = Utc::now();

        for row in &result.rows {
            let mut attributes = BTreeMap::new();
            let mut parts = Vec::with_capacity(row.len());

            for (idx, cell) in row.iter().enumerate() {
                let Some(name) = result.columns.get(idx) else {
                    continue;
                };
                parts.push(format!("{}: {}", name, cell.render()));
                if let Some(attr) = cell.to_attr() {
                    attributes.insert(name.clone(), attr);
                }
            }

            self.stats.rows_collected.fetch_add(1, Ordering::Relaxed);
            let mut envelope = Envelope::at(self.source().clone(), timestamp);
            envelope.severity = Some(9);
            attributes.insert("query.name".to_string(), AttrValue::Str(query.name.clone()));
            records.push(Record::Event(EventRecord {
                envelope,
                body: parts.join(" | "),
                attributes,
            }));
        }
        records
    }

    /// Overrun events are log-shaped and flow through the pipeline like any
    /// other record
    fn overrun_event(&self, skipped: u64) -> Record {
        let mut event = Record::event(
            self.source().clone(),
            format!("scrape overrun: skipped {} tick(s)", skipped),
        );
        event.envelope_mut().severity = Some(13);
        event.set_attribute("event.name", "scrape_overrun");
        event.set_attribute("skipped_ticks", skipped as i64);
        event
    }
}

fn metric_name(query_name: &str) -> String {
    if query_name.starts_with("db.") {
        query_name.to_string()
    } else {
        format!("db.{}", query_name)
    }
}

impl ScheduledTask for SqlScraper {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move { self.collect_cycle().await.map_err(Into::into) })
    }

    fn should_terminate(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn on_overrun(&self, skipped_ticks: u64) {
        self.stats.skipped_ticks.fetch_add(skipped_ticks, Ordering::Relaxed);
        self.metrics.incr("collector_scrape_overruns_total", skipped_ticks);
        let _ = self.handle.try_submit(vec![self.overrun_event(skipped_ticks)]);
    }
}

/// Spawn the scraper loop for one database
pub fn start_scraper(scraper: Arc<SqlScraper>, config: &DatabaseConfig) -> Arc<AtomicBool> {
    use crate::utils::ScheduledExecutor;

    let shutdown_handle = scraper.shutdown_handle();
    let executor = ScheduledExecutor::new(
        format!("scraper-{}", config.display_name()),
        Duration::from_secs(config.collection_interval_secs),
    );

    tokio::spawn(async move {
        executor.start(scraper).await;
    });

    tracing::info!(
        "Scraper started for {} (interval {}s)",
        config.display_name(),
        config.collection_interval_secs
    );

    shutdown_handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnValue;

    #[test]
    fn test_metric_name_prefixing() {
        assert_eq!(metric_name("db.size"), "db.size");
        assert_eq!(metric_name("wait_sampling.profile"), "db.wait_sampling.profile");
    }

    #[test]
    fn test_first_numeric_binding_shape() {
        // Columns: text, numeric value, numeric attr, bool attr
        let result = QueryResult {
            columns: vec!["state".into(), "connections".into(), "extra".into(), "is_primary".into()],
            rows: vec![vec![
                ColumnValue::Text("active".into()),
                ColumnValue::Float(12.0),
                ColumnValue::Int(4),
                ColumnValue::Bool(true),
            ]],
        };

        let (value_idx, value) = QueryResult::first_numeric(&result.rows[0]).unwrap();
        assert_eq!(value_idx, 1);
        assert_eq!(value, 12.0);

        // Remaining columns keep their types as attributes
        let attrs: Vec<(usize, AttrValue)> = result.rows[0]
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != value_idx)
            .filter_map(|(i, c)| c.to_attr().map(|a| (i, a)))
            .collect();
        assert_eq!(attrs[0].1, AttrValue::Str("active".into()));
        assert_eq!(attrs[1].1, AttrValue::Int(4));
        assert_eq!(attrs[2].1, AttrValue::Int(1));
    }
}
