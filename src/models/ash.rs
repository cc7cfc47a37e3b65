//! Active session history model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session state at sample time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    IdleInTransaction,
    Waiting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::IdleInTransaction => "idle_in_transaction",
            Self::Waiting => "waiting",
        }
    }

    /// Map engine-reported state strings onto the shared state set
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "active" | "query" | "executing" => Self::Active,
            "idle in transaction" | "idle in transaction (aborted)" => Self::IdleInTransaction,
            "waiting" | "lock wait" | "user sleep" => Self::Waiting,
            _ => Self::Idle,
        }
    }
}

/// One session observed in a sample tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: i64,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_start: Option<DateTime<Utc>>,
    /// Normalized query text, when the engine exposes it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_text: Option<String>,
    /// Session blocking this one, when the engine reports blocking pids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<i64>,
    #[serde(default)]
    pub cpu_time_ms: f64,
    #[serde(default)]
    pub memory_bytes: f64,
    #[serde(default)]
    pub io_read_bytes: f64,
    #[serde(default)]
    pub io_write_bytes: f64,
}

impl SessionRecord {
    /// "type:event" key used by wait-event histograms, e.g. "lock:relation"
    pub fn wait_key(&self) -> Option<String> {
        match (&self.wait_event_type, &self.wait_event) {
            (Some(t), Some(e)) => Some(format!("{}:{}", t.to_lowercase(), e)),
            (None, Some(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Seconds this session's current query has been running at `now`
    pub fn query_elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        self.query_start
            .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// Point-in-time snapshot of all observed sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AshSample {
    pub sample_time: DateTime<Utc>,
    pub sessions: Vec<SessionRecord>,
}

impl AshSample {
    pub fn new(sample_time: DateTime<Utc>, sessions: Vec<SessionRecord>) -> Self {
        Self { sample_time, sessions }
    }

    /// Length of the longest blocking chain in this sample
    pub fn max_blocking_chain(&self) -> usize {
        let blocked: std::collections::HashMap<i64, i64> = self
            .sessions
            .iter()
            .filter_map(|s| s.blocked_by.map(|b| (s.session_id, b)))
            .collect();

        let mut longest = 0;
        for start in blocked.keys() {
            let mut len = 0;
            let mut cur = *start;
            let mut seen = std::collections::HashSet::new();
            while let Some(next) = blocked.get(&cur) {
                if !seen.insert(cur) {
                    break; // cycle guard
                }
                len += 1;
                cur = *next;
            }
            longest = longest.max(len);
        }
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: i64, blocked_by: Option<i64>) -> SessionRecord {
        SessionRecord {
            session_id: id,
            state: SessionState::Waiting,
            wait_event_type: Some("Lock".into()),
            wait_event: Some("relation".into()),
            query_id: None,
            query_start: None,
            query_text: None,
            blocked_by,
            cpu_time_ms: 0.0,
            memory_bytes: 0.0,
            io_read_bytes: 0.0,
            io_write_bytes: 0.0,
        }
    }

    #[test]
    fn test_wait_key_format() {
        let s = session(1, None);
        assert_eq!(s.wait_key().as_deref(), Some("lock:relation"));
    }

    #[test]
    fn test_state_parse_covers_engine_spellings() {
        assert_eq!(SessionState::parse("active"), SessionState::Active);
        assert_eq!(SessionState::parse("idle in transaction"), SessionState::IdleInTransaction);
        assert_eq!(SessionState::parse("Lock Wait"), SessionState::Waiting);
        assert_eq!(SessionState::parse("Sleep"), SessionState::Idle);
    }

    #[test]
    fn test_blocking_chain_length() {
        // 3 -> 2 -> 1, and 5 -> 4
        let sample = AshSample::new(
            Utc::now(),
            vec![session(3, Some(2)), session(2, Some(1)), session(1, None), session(5, Some(4)), session(4, None)],
        );
        assert_eq!(sample.max_blocking_chain(), 2);
    }

    #[test]
    fn test_blocking_cycle_does_not_hang() {
        let sample = AshSample::new(Utc::now(), vec![session(1, Some(2)), session(2, Some(1))]);
        assert!(sample.max_blocking_chain() >= 1);
    }
}
