//! Circuit breaker keyed per database source.
//!
//! Three states:
//! - **Closed**: records pass, consecutive failures counted
//! - **Open**: records from the source are dropped for `open_timeout`
//! - **HalfOpen**: a single probe is allowed; its outcome decides the next state
//!
//! Failure counting is a consecutive counter (reset by any success), bounded
//! in age by `failure_window`: a streak older than the window restarts.

use crate::config::BreakerConfig;
use crate::models::{Record, Source};
use dashmap::DashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of one protected operation (a scrape cycle, a sample query)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A query-level failure within an otherwise reachable database
    QueryFailure,
    /// The endpoint could not be reached or authenticated
    ConnectionFailure,
    Timeout,
}

struct BreakerCore {
    source: Source,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_query_failures: u32,
    consecutive_connection_failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    /// Set while the single half-open probe is outstanding
    probe_inflight: bool,
}

impl BreakerCore {
    fn new(source: Source) -> Self {
        Self {
            source,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_query_failures: 0,
            consecutive_connection_failures: 0,
            streak_started: None,
            opened_at: None,
            probe_inflight: false,
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_query_failures = 0;
        self.consecutive_connection_failures = 0;
        self.streak_started = None;
    }
}

/// Per-source circuit breaker bank
pub struct SourceBreaker {
    config: BreakerConfig,
    cores: DashMap<String, Mutex<BreakerCore>>,
    /// Pending state-transition events, drained into the pipeline
    events: Mutex<Vec<Record>>,
}

impl SourceBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, cores: DashMap::new(), events: Mutex::new(Vec::new()) }
    }

    /// Current state for a source; unknown sources are closed
    pub fn state(&self, source: &Source) -> CircuitState {
        match self.cores.get(&source.key()) {
            Some(core) => core.lock().expect("breaker core poisoned").state,
            None => CircuitState::Closed,
        }
    }

    /// Whether records from this source pass the breaker stage.
    /// Open drops; closed and half-open (probe results) pass.
    pub fn passes(&self, source: &Source) -> bool {
        match self.cores.get(&source.key()) {
            Some(core) => {
                let mut core = core.lock().expect("breaker core poisoned");
                self.maybe_half_open(&mut core);
                core.state != CircuitState::Open
            },
            None => true,
        }
    }

    /// Whether a new protected operation may run right now.
    ///
    /// In the open state this flips to half-open once `open_timeout` has
    /// elapsed and then admits exactly one probe.
    pub fn allow(&self, source: &Source) -> bool {
        let entry = self
            .cores
            .entry(source.key())
            .or_insert_with(|| Mutex::new(BreakerCore::new(source.clone())));
        let mut core = entry.lock().expect("breaker core poisoned");

        self.maybe_half_open(&mut core);

        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if core.probe_inflight {
                    false
                } else {
                    core.probe_inflight = true;
                    true
                }
            },
        }
    }

    /// Record the outcome of a protected operation
    pub fn record(&self, source: &Source, outcome: Outcome) {
        let entry = self
            .cores
            .entry(source.key())
            .or_insert_with(|| Mutex::new(BreakerCore::new(source.clone())));
        let mut core = entry.lock().expect("breaker core poisoned");

        self.maybe_half_open(&mut core);

        match outcome {
            Outcome::Success => match core.state {
                CircuitState::HalfOpen => {
                    core.probe_inflight = false;
                    self.transition(&mut core, CircuitState::Closed);
                    core.reset_counters();
                },
                _ => core.reset_counters(),
            },
            Outcome::QueryFailure | Outcome::ConnectionFailure | Outcome::Timeout => {
                if core.state == CircuitState::HalfOpen {
                    core.probe_inflight = false;
                    core.opened_at = Some(Instant::now());
                    self.transition(&mut core, CircuitState::Open);
                    return;
                }
                if core.state == CircuitState::Open {
                    return;
                }

                // Streaks older than the window restart from zero
                let window = Duration::from_secs(self.config.failure_window_secs);
                if core.streak_started.map(|s| s.elapsed() > window).unwrap_or(false) {
                    core.reset_counters();
                }
                if core.streak_started.is_none() {
                    core.streak_started = Some(Instant::now());
                }

                core.consecutive_failures += 1;
                match outcome {
                    Outcome::QueryFailure => core.consecutive_query_failures += 1,
                    Outcome::ConnectionFailure | Outcome::Timeout => {
                        core.consecutive_connection_failures += 1
                    },
                    Outcome::Success => unreachable!(),
                }

                let tripped = core.consecutive_failures >= self.config.failure_threshold
                    || core.consecutive_query_failures >= self.config.query_error_threshold
                    || core.consecutive_connection_failures
                        >= self.config.connection_failure_threshold;

                if tripped {
                    core.opened_at = Some(Instant::now());
                    self.transition(&mut core, CircuitState::Open);
                }
            },
        }
    }

    /// State-transition events accumulated since the last drain
    pub fn drain_events(&self) -> Vec<Record> {
        std::mem::take(&mut *self.events.lock().expect("breaker events poisoned"))
    }

    /// Health view: true when no source is currently open
    pub fn all_closed(&self) -> bool {
        self.cores.iter().all(|entry| {
            entry.value().lock().expect("breaker core poisoned").state != CircuitState::Open
        })
    }

    fn maybe_half_open(&self, core: &mut BreakerCore) {
        if core.state == CircuitState::Open
            && let Some(opened) = core.opened_at
            && opened.elapsed() >= Duration::from_secs(self.config.open_timeout_secs)
        {
            core.probe_inflight = false;
            self.transition(core, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, core: &mut BreakerCore, next: CircuitState) {
        if core.state == next {
            return;
        }
        let prev = core.state;
        core.state = next;

        tracing::info!("Circuit breaker for {} transitioned {} -> {}", core.source, prev, next);

        let mut event = Record::event(
            core.source.clone(),
            format!("circuit breaker transitioned {} -> {}", prev, next),
        );
        event.envelope_mut().severity = Some(if next == CircuitState::Open { 13 } else { 9 });
        event.set_attribute("event.name", "breaker_transition");
        event.set_attribute("breaker.previous_state", prev.to_string());
        event.set_attribute("breaker.state", next.to_string());
        self.events.lock().expect("breaker events poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatabaseKind;

    fn source() -> Source {
        Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
    }

    fn breaker(threshold: u32, open_timeout_secs: u64) -> SourceBreaker {
        SourceBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            failure_window_secs: 3600,
            open_timeout_secs,
            query_error_threshold: u32::MAX,
            connection_failure_threshold: u32::MAX,
        })
    }

    #[test]
    fn test_kth_failure_opens_not_k_minus_one() {
        let b = breaker(3, 10);
        let s = source();

        b.record(&s, Outcome::QueryFailure);
        b.record(&s, Outcome::QueryFailure);
        assert_eq!(b.state(&s), CircuitState::Closed);

        b.record(&s, Outcome::QueryFailure);
        assert_eq!(b.state(&s), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_streak() {
        let b = breaker(3, 10);
        let s = source();

        b.record(&s, Outcome::QueryFailure);
        b.record(&s, Outcome::QueryFailure);
        b.record(&s, Outcome::Success);
        b.record(&s, Outcome::QueryFailure);
        b.record(&s, Outcome::QueryFailure);
        assert_eq!(b.state(&s), CircuitState::Closed);
    }

    #[test]
    fn test_open_refuses_then_single_half_open_probe() {
        let b = breaker(1, 0); // open_timeout 0 flips to half-open immediately
        let s = source();

        b.record(&s, Outcome::ConnectionFailure);
        // open_timeout elapsed -> half-open, exactly one probe allowed
        assert!(b.allow(&s));
        assert!(!b.allow(&s));

        b.record(&s, Outcome::Success);
        assert_eq!(b.state(&s), CircuitState::Closed);
        assert!(b.allow(&s));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, 0);
        let s = source();

        b.record(&s, Outcome::ConnectionFailure);
        assert!(b.allow(&s)); // half-open probe
        b.record(&s, Outcome::QueryFailure);
        // Re-opened; open_timeout 0 means allow() moves straight back to a probe
        assert!(b.allow(&s));
    }

    #[test]
    fn test_open_source_does_not_pass() {
        let b = breaker(1, 60);
        let s = source();
        assert!(b.passes(&s));
        b.record(&s, Outcome::ConnectionFailure);
        assert!(!b.passes(&s));
    }

    #[test]
    fn test_connection_class_threshold() {
        let b = SourceBreaker::new(BreakerConfig {
            failure_threshold: 10,
            failure_window_secs: 3600,
            open_timeout_secs: 60,
            query_error_threshold: 10,
            connection_failure_threshold: 2,
        });
        let s = source();
        b.record(&s, Outcome::ConnectionFailure);
        assert_eq!(b.state(&s), CircuitState::Closed);
        b.record(&s, Outcome::ConnectionFailure);
        assert_eq!(b.state(&s), CircuitState::Open);
    }

    #[test]
    fn test_transitions_emit_events() {
        let b = breaker(1, 60);
        let s = source();
        b.record(&s, Outcome::ConnectionFailure);
        let events = b.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Record::Event(e) => assert!(e.body.contains("closed -> open")),
            other => panic!("expected event, got {:?}", other),
        }
        assert!(b.drain_events().is_empty());
    }
}
