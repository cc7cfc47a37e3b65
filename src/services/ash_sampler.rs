//! Active Session History sampler
//!
//! Runs one lightweight "who is active right now" query per tick (1s by
//! default), appends the snapshot to the in-memory ring, and keeps the
//! aggregation windows current. Sample-derived metrics are emitted on a
//! separate, coarser schedule so the high-frequency ring itself is never
//! exported. Sampling suspends entirely while the source's breaker is open.

use crate::config::AshConfig;
use crate::models::{
    AshSample, ColumnValue, QueryCategory, Record, SessionRecord, SessionState, Source,
};
use crate::services::db_adapter::{DbAdapter, QueryResult};
use crate::services::feature_detector::FeatureDetector;
use crate::services::pipeline::{CircuitState, PipelineHandle, SourceBreaker};
use crate::services::query_selector::QuerySelector;
use crate::utils::{CollectorError, CollectorResult, ScheduledTask};
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::ring_buffer::{RingBuffer, WindowedAggregator};

pub struct AshSampler {
    adapter: Arc<dyn DbAdapter>,
    selector: Arc<QuerySelector>,
    detector: Arc<FeatureDetector>,
    breaker: Arc<SourceBreaker>,
    handle: PipelineHandle,
    config: AshConfig,
    ring: Mutex<RingBuffer>,
    aggregator: Mutex<WindowedAggregator>,
    pub failed_samples: AtomicU64,
    pub taken_samples: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl AshSampler {
    pub fn new(
        adapter: Arc<dyn DbAdapter>,
        selector: Arc<QuerySelector>,
        detector: Arc<FeatureDetector>,
        breaker: Arc<SourceBreaker>,
        handle: PipelineHandle,
        config: AshConfig,
    ) -> Self {
        let ring = RingBuffer::for_retention(
            Duration::from_secs(config.retention_secs),
            Duration::from_millis(config.sampling_interval_ms),
        );
        let windows: Vec<Duration> =
            config.aggregation_windows_secs.iter().map(|s| Duration::from_secs(*s)).collect();
        let aggregator = WindowedAggregator::new(&windows, config.max_queries_per_window);

        Self {
            adapter,
            selector,
            detector,
            breaker,
            handle,
            config,
            ring: Mutex::new(ring),
            aggregator: Mutex::new(aggregator),
            failed_samples: AtomicU64::new(0),
            taken_samples: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn source(&self) -> &Source {
        self.adapter.source()
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// One sample tick
    pub async fn sample_once(&self) -> CollectorResult<()> {
        if self.breaker.state(self.source()) == CircuitState::Open {
            return Ok(());
        }

        let features = self.detector.current();
        let queries = self.selector.queries_for(QueryCategory::Ash, &features);
        let Some(query) = queries.first() else {
            return Ok(());
        };

        let timeout = Duration::from_millis(self.config.sampling_interval_ms.max(1000) * 3);
        let result = match self.adapter.query(&query.sql, timeout).await {
            Ok(result) => result,
            Err(e) => {
                self.failed_samples.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("ASH sample failed for {}: {}", self.source(), e);
                return Err(e);
            },
        };

        let sample = AshSample::new(Utc::now(), parse_sessions(&result));
        self.taken_samples.fetch_add(1, Ordering::Relaxed);

        self.aggregator.lock().expect("aggregator poisoned").observe(&sample);
        self.ring.lock().expect("ash ring poisoned").push(sample);
        Ok(())
    }

    /// Read-only accessor: copies of samples within `duration`
    pub fn recent_samples(&self, duration: Duration) -> Vec<AshSample> {
        self.ring.lock().expect("ash ring poisoned").recent(duration)
    }

    /// Read-only accessor: aggregate snapshot for one configured window
    pub fn aggregated_window(&self, duration: Duration) -> Option<WindowSnapshot> {
        let aggregator = self.aggregator.lock().expect("aggregator poisoned");
        aggregator.window(duration).map(|w| WindowSnapshot {
            window: w.window,
            session_states: w.session_states.clone(),
            wait_events: w.wait_events.clone(),
            top_queries: w.top_queries(self.config.top_n),
            top_waits: w.top_waits(self.config.top_n),
        })
    }

    /// Sample-derived metrics for the coarse emission schedule
    pub fn emission_records(&self) -> Vec<Record> {
        let source = self.source().clone();
        let mut records = Vec::new();

        let latest = {
            let ring = self.ring.lock().expect("ash ring poisoned");
            ring.latest().cloned()
        };
        let Some(latest) = latest else {
            return records;
        };

        let mut by_state: std::collections::HashMap<SessionState, u64> = std::collections::HashMap::new();
        for session in &latest.sessions {
            *by_state.entry(session.state).or_insert(0) += 1;
        }
        for (state, count) in by_state {
            let mut rec = Record::gauge(source.clone(), "db.ash.sessions", count as f64);
            rec.set_attribute("state", state.as_str());
            records.push(rec);
        }

        let chain = latest.max_blocking_chain();
        records.push(Record::gauge(source.clone(), "db.ash.blocking_chain.max", chain as f64));

        if let Some(first_window) = self.config.aggregation_windows_secs.first() {
            let aggregator = self.aggregator.lock().expect("aggregator poisoned");
            if let Some(window) = aggregator.window(Duration::from_secs(*first_window)) {
                for (wait_key, count) in &window.wait_events {
                    let mut rec = Record::gauge(source.clone(), "db.ash.wait_events", *count as f64);
                    rec.set_attribute("wait", wait_key.as_str());
                    rec.set_attribute("window_secs", *first_window as i64);
                    records.push(rec);
                }
            }
        }

        records
    }
}

/// Bind sample rows to session records by column name; rows missing a
/// usable session id are skipped
fn parse_sessions(result: &QueryResult) -> Vec<SessionRecord> {
    let idx = |name: &str| result.columns.iter().position(|c| c.eq_ignore_ascii_case(name));

    let pid_idx = idx("pid").or_else(|| idx("id"));
    let state_idx = idx("state");
    let command_idx = idx("command");
    let wait_type_idx = idx("wait_event_type");
    let wait_idx = idx("wait_event");
    let query_id_idx = idx("query_id");
    let query_start_idx = idx("query_start");
    let query_text_idx = idx("query_text").or_else(|| idx("info"));
    let blocked_by_idx = idx("blocked_by");
    let elapsed_idx = idx("elapsed_secs").or_else(|| idx("time"));

    let mut sessions = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let Some(session_id) = pid_idx.and_then(|i| row.get(i)).and_then(cell_i64) else {
            continue;
        };

        let raw_state = state_idx
            .and_then(|i| row.get(i))
            .and_then(cell_text)
            .or_else(|| command_idx.and_then(|i| row.get(i)).and_then(cell_text))
            .unwrap_or_default();
        let wait_event = wait_idx.and_then(|i| row.get(i)).and_then(cell_text);
        let state = if wait_event.is_some() { SessionState::Waiting } else { SessionState::parse(&raw_state) };

        let query_start = query_start_idx.and_then(|i| row.get(i)).and_then(|c| match c {
            ColumnValue::Timestamp(t) => Some(*t),
            _ => None,
        });
        // Some engines only report elapsed seconds; derive a start time
        let query_start = query_start.or_else(|| {
            elapsed_idx
                .and_then(|i| row.get(i))
                .and_then(|c| c.as_numeric())
                .map(|secs| Utc::now() - chrono::Duration::milliseconds((secs * 1000.0) as i64))
        });

        sessions.push(SessionRecord {
            session_id,
            state,
            wait_event_type: wait_type_idx.and_then(|i| row.get(i)).and_then(cell_text),
            wait_event,
            query_id: query_id_idx.and_then(|i| row.get(i)).and_then(cell_text),
            query_start,
            query_text: query_text_idx.and_then(|i| row.get(i)).and_then(cell_text),
            blocked_by: blocked_by_idx.and_then(|i| row.get(i)).and_then(cell_i64),
            cpu_time_ms: 0.0,
            memory_bytes: 0.0,
            io_read_bytes: 0.0,
            io_write_bytes: 0.0,
        });
    }
    sessions
}

fn cell_i64(cell: &ColumnValue) -> Option<i64> {
    match cell {
        ColumnValue::Int(v) => Some(*v),
        ColumnValue::Float(v) => Some(*v as i64),
        ColumnValue::Text(s) => s.parse().ok(),
        _ => None,
    }
}

fn cell_text(cell: &ColumnValue) -> Option<String> {
    match cell {
        ColumnValue::Text(s) if !s.is_empty() => Some(s.clone()),
        ColumnValue::Null => None,
        ColumnValue::Text(_) => None,
        other => Some(other.render()),
    }
}

/// Aggregate snapshot returned by `aggregated_window`
pub struct WindowSnapshot {
    pub window: Duration,
    pub session_states: std::collections::HashMap<SessionState, u64>,
    pub wait_events: std::collections::HashMap<String, u64>,
    pub top_queries: Vec<(String, super::ring_buffer::QueryWindowStats)>,
    pub top_waits: Vec<(String, super::ring_buffer::WaitWindowStats)>,
}

/// Per-tick sampling task
pub struct AshSampleTask {
    sampler: Arc<AshSampler>,
}

impl AshSampleTask {
    pub fn new(sampler: Arc<AshSampler>) -> Self {
        Self { sampler }
    }
}

impl ScheduledTask for AshSampleTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            // Sample failures are counted and retried next tick
            let _ = self.sampler.sample_once().await;
            Ok(())
        })
    }

    fn should_terminate(&self) -> bool {
        self.sampler.shutdown.load(Ordering::Relaxed)
    }
}

/// Coarser emission task feeding sample-derived metrics downstream
pub struct AshEmitTask {
    sampler: Arc<AshSampler>,
}

impl AshEmitTask {
    pub fn new(sampler: Arc<AshSampler>) -> Self {
        Self { sampler }
    }
}

impl ScheduledTask for AshEmitTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let records = self.sampler.emission_records();
            match self.sampler.handle.submit(records).await {
                Ok(()) => Ok(()),
                Err(CollectorError::Busy) => {
                    tracing::debug!("ASH emission paused: pipeline busy");
                    Ok(())
                },
                Err(e) => Err(e.into()),
            }
        })
    }

    fn should_terminate(&self) -> bool {
        self.sampler.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sessions_postgres_shape() {
        let result = QueryResult {
            columns: vec![
                "pid".into(),
                "state".into(),
                "wait_event_type".into(),
                "wait_event".into(),
                "query_id".into(),
                "query_start".into(),
                "query_text".into(),
                "blocked_by".into(),
            ],
            rows: vec![
                vec![
                    ColumnValue::Int(17),
                    ColumnValue::Text("active".into()),
                    ColumnValue::Text("Lock".into()),
                    ColumnValue::Text("relation".into()),
                    ColumnValue::Text("12345".into()),
                    ColumnValue::Timestamp(Utc::now()),
                    ColumnValue::Text("SELECT 1".into()),
                    ColumnValue::Int(9),
                ],
                vec![
                    ColumnValue::Int(18),
                    ColumnValue::Text("idle".into()),
                    ColumnValue::Null,
                    ColumnValue::Null,
                    ColumnValue::Null,
                    ColumnValue::Null,
                    ColumnValue::Null,
                    ColumnValue::Null,
                ],
            ],
        };

        let sessions = parse_sessions(&result);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, 17);
        // wait_event present forces the waiting state
        assert_eq!(sessions[0].state, SessionState::Waiting);
        assert_eq!(sessions[0].wait_key().as_deref(), Some("lock:relation"));
        assert_eq!(sessions[0].blocked_by, Some(9));
        assert_eq!(sessions[1].state, SessionState::Idle);
    }

    #[test]
    fn test_parse_sessions_mysql_processlist_shape() {
        let result = QueryResult {
            columns: vec![
                "pid".into(),
                "state".into(),
                "command".into(),
                "elapsed_secs".into(),
                "query_text".into(),
            ],
            rows: vec![vec![
                ColumnValue::Int(3),
                ColumnValue::Text("Lock wait".into()),
                ColumnValue::Text("Query".into()),
                ColumnValue::Int(12),
                ColumnValue::Text("UPDATE t SET x = 1".into()),
            ]],
        };

        let sessions = parse_sessions(&result);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Waiting);
        assert!(sessions[0].query_start.is_some());
    }

    #[test]
    fn test_rows_without_session_id_skipped() {
        let result = QueryResult {
            columns: vec!["pid".into(), "state".into()],
            rows: vec![vec![ColumnValue::Null, ColumnValue::Text("active".into())]],
        };
        assert!(parse_sessions(&result).is_empty());
    }
}
