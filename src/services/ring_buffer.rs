//! ASH ring buffer and window aggregation
//!
//! The ring is a fixed-capacity, oldest-overwriting, time-ordered container
//! of session samples. Aggregation windows (1m/5m/15m by default) are
//! updated incrementally on insert: session-state and wait-event
//! histograms, bounded per-query and per-wait stats maps, and top-N lists.
//! A window resets itself when its period elapses.

use crate::models::{AshSample, SessionState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Fixed-capacity ring of samples; append is O(1) and never blocks
pub struct RingBuffer {
    capacity: usize,
    samples: VecDeque<AshSample>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), samples: VecDeque::with_capacity(capacity.max(1)) }
    }

    /// Derive capacity from retention and cadence
    pub fn for_retention(retention: Duration, sampling_interval: Duration) -> Self {
        let capacity =
            (retention.as_millis() / sampling_interval.as_millis().max(1)).max(1) as usize;
        Self::new(capacity)
    }

    pub fn push(&mut self, sample: AshSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&AshSample> {
        self.samples.back()
    }

    /// Copies of the samples newer than `duration`, oldest first. Returning
    /// copies keeps observers safe across overwrites.
    pub fn recent(&self, duration: Duration) -> Vec<AshSample> {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(duration.as_millis() as i64);
        self.samples.iter().filter(|s| s.sample_time >= cutoff).cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryWindowStats {
    pub count: u64,
    pub total_duration_secs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct WaitWindowStats {
    pub count: u64,
    /// Sessions seen contributing to this wait (bounded)
    pub sessions: HashSet<i64>,
}

const MAX_SESSIONS_PER_WAIT: usize = 32;

/// One aggregation window, reset when its period elapses
pub struct AggregationWindow {
    pub window: Duration,
    pub started: DateTime<Utc>,
    pub session_states: HashMap<SessionState, u64>,
    pub wait_events: HashMap<String, u64>,
    pub query_stats: HashMap<String, QueryWindowStats>,
    pub wait_stats: HashMap<String, WaitWindowStats>,
    max_queries: usize,
}

impl AggregationWindow {
    fn new(window: Duration, max_queries: usize) -> Self {
        Self {
            window,
            started: Utc::now(),
            session_states: HashMap::new(),
            wait_events: HashMap::new(),
            query_stats: HashMap::new(),
            wait_stats: HashMap::new(),
            max_queries: max_queries.max(1),
        }
    }

    fn observe(&mut self, sample: &AshSample) {
        let now = sample.sample_time;
        if self.started + ChronoDuration::milliseconds(self.window.as_millis() as i64) < now {
            self.reset(now);
        }

        for session in &sample.sessions {
            *self.session_states.entry(session.state).or_insert(0) += 1;

            if let Some(wait_key) = session.wait_key() {
                *self.wait_events.entry(wait_key.clone()).or_insert(0) += 1;

                let stats = self.wait_stats.entry(wait_key).or_default();
                stats.count += 1;
                if stats.sessions.len() < MAX_SESSIONS_PER_WAIT {
                    stats.sessions.insert(session.session_id);
                }
            }

            if let Some(query_key) = session.query_id.clone().or_else(|| session.query_text.clone()) {
                let elapsed = session.query_elapsed_secs(now);
                let stats = self.query_stats.entry(query_key).or_default();
                stats.count += 1;
                stats.total_duration_secs += elapsed;
            }
        }

        self.enforce_bounds();
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.started = now;
        self.session_states.clear();
        self.wait_events.clear();
        self.query_stats.clear();
        self.wait_stats.clear();
    }

    /// Keep the stats maps bounded: excess queries discarded after ranking
    /// by total duration, excess waits by count
    fn enforce_bounds(&mut self) {
        while self.query_stats.len() > self.max_queries {
            if let Some(least) = self
                .query_stats
                .iter()
                .min_by(|a, b| {
                    a.1.total_duration_secs
                        .partial_cmp(&b.1.total_duration_secs)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone())
            {
                self.query_stats.remove(&least);
            } else {
                break;
            }
        }
        while self.wait_stats.len() > self.max_queries {
            if let Some(least) =
                self.wait_stats.iter().min_by_key(|(_, s)| s.count).map(|(k, _)| k.clone())
            {
                self.wait_stats.remove(&least);
            } else {
                break;
            }
        }
    }

    /// Top-N queries by total duration
    pub fn top_queries(&self, n: usize) -> Vec<(String, QueryWindowStats)> {
        let mut entries: Vec<(String, QueryWindowStats)> =
            self.query_stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| {
            b.1.total_duration_secs
                .partial_cmp(&a.1.total_duration_secs)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(n);
        entries
    }

    /// Top-N waits by count
    pub fn top_waits(&self, n: usize) -> Vec<(String, WaitWindowStats)> {
        let mut entries: Vec<(String, WaitWindowStats)> =
            self.wait_stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        entries.truncate(n);
        entries
    }
}

/// The configured set of aggregation windows
pub struct WindowedAggregator {
    windows: Vec<AggregationWindow>,
}

impl WindowedAggregator {
    pub fn new(window_durations: &[Duration], max_queries_per_window: usize) -> Self {
        let windows = window_durations
            .iter()
            .map(|d| AggregationWindow::new(*d, max_queries_per_window))
            .collect();
        Self { windows }
    }

    pub fn observe(&mut self, sample: &AshSample) {
        for window in &mut self.windows {
            window.observe(sample);
        }
    }

    pub fn window(&self, duration: Duration) -> Option<&AggregationWindow> {
        self.windows.iter().find(|w| w.window == duration)
    }

    pub fn windows(&self) -> &[AggregationWindow] {
        &self.windows
    }
}
