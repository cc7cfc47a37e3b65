//! Query correlation stage
//!
//! Attaches a shared `correlation_id` to records that carry the same query
//! fingerprint, session id, transaction id, or trace id within a sliding
//! window. Read-mostly and cheap: the index maps each key to the id minted
//! from the seed record's envelope and expires entries that go quiet.

use crate::config::CorrelationConfig;
use crate::models::Record;
use crate::services::pipeline::Processor;
use crate::utils::CollectorResult;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const ATTR_CORRELATION_ID: &str = "correlation_id";

/// Attributes that act as correlation keys, in lookup order
const KEY_ATTRIBUTES: [&str; 4] = ["query_fingerprint", "session_id", "transaction_id", "trace_id"];

struct KeyEntry {
    correlation_id: String,
    record_count: usize,
    last_seen: Instant,
}

pub struct QueryCorrelator {
    window: Duration,
    max_records_per_key: usize,
    index: Mutex<HashMap<String, KeyEntry>>,
}

impl QueryCorrelator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max_records_per_key: config.max_records_per_key.max(1),
            index: Mutex::new(HashMap::new()),
        }
    }

    fn correlate(&self, record: &mut Record) {
        let keys: Vec<String> = KEY_ATTRIBUTES
            .iter()
            .filter_map(|attr| {
                record.get_attribute(attr).map(|v| format!("{}:{}", attr, v.render()))
            })
            .collect();
        if keys.is_empty() {
            return;
        }

        let mut index = self.index.lock().expect("correlation index poisoned");

        // First key already known within the window wins
        let existing = keys.iter().find_map(|k| {
            index
                .get(k)
                .filter(|e| e.last_seen.elapsed() < self.window)
                .map(|e| e.correlation_id.clone())
        });

        let correlation_id = existing.unwrap_or_else(|| seed_correlation_id(record));

        for key in keys {
            let entry = index.entry(key).or_insert_with(|| KeyEntry {
                correlation_id: correlation_id.clone(),
                record_count: 0,
                last_seen: Instant::now(),
            });
            if entry.record_count < self.max_records_per_key {
                entry.record_count += 1;
            }
            entry.last_seen = Instant::now();
        }

        record.set_attribute(ATTR_CORRELATION_ID, correlation_id);
    }

    fn prune(&self) {
        let mut index = self.index.lock().expect("correlation index poisoned");
        index.retain(|_, entry| entry.last_seen.elapsed() < self.window);
    }

    pub fn key_count(&self) -> usize {
        self.index.lock().expect("correlation index poisoned").len()
    }
}

/// Deterministic id minted from the seed record's envelope
fn seed_correlation_id(record: &Record) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.source().key().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(record.timestamp().to_rfc3339().as_bytes());
    hasher.finalize().iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

impl Processor for QueryCorrelator {
    fn name(&self) -> &'static str {
        "correlator"
    }

    fn process(&self, mut batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        self.prune();
        for record in &mut batch {
            self.correlate(record);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};

    fn source() -> Source {
        Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
    }

    fn correlator() -> QueryCorrelator {
        QueryCorrelator::new(&CorrelationConfig { window_secs: 30, max_records_per_key: 100 })
    }

    #[test]
    fn test_shared_fingerprint_shares_id() {
        let c = correlator();
        let mut a = Record::gauge(source(), "db.query.time", 1.0);
        a.set_attribute("query_fingerprint", "select 1");
        let mut b = Record::event(source(), "slow query");
        b.set_attribute("query_fingerprint", "select 1");

        let out = c.process(vec![a, b]).unwrap();
        let id_a = out[0].get_attribute(ATTR_CORRELATION_ID).unwrap().render();
        let id_b = out[1].get_attribute(ATTR_CORRELATION_ID).unwrap().render();
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn test_transitive_linkage_through_session() {
        let c = correlator();
        // Record 1 carries fingerprint+session, record 2 only the session,
        // record 3 only the fingerprint: all three share one id
        let mut a = Record::event(source(), "a");
        a.set_attribute("query_fingerprint", "select 1");
        a.set_attribute("session_id", "17");
        let mut b = Record::event(source(), "b");
        b.set_attribute("session_id", "17");
        let mut d = Record::event(source(), "d");
        d.set_attribute("query_fingerprint", "select 1");

        let out = c.process(vec![a, b, d]).unwrap();
        let ids: Vec<String> =
            out.iter().map(|r| r.get_attribute(ATTR_CORRELATION_ID).unwrap().render()).collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
    }

    #[test]
    fn test_unrelated_records_get_distinct_ids() {
        let c = correlator();
        let mut a = Record::event(source(), "a");
        a.set_attribute("session_id", "1");
        let mut b = Record::event(
            Source::new(DatabaseKind::Postgres, "db2:5432", "other"),
            "b",
        );
        b.set_attribute("session_id", "2");

        let out = c.process(vec![a, b]).unwrap();
        let id_a = out[0].get_attribute(ATTR_CORRELATION_ID).unwrap().render();
        let id_b = out[1].get_attribute(ATTR_CORRELATION_ID).unwrap().render();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_window_expiry_prunes_index() {
        let c = QueryCorrelator::new(&CorrelationConfig { window_secs: 0, max_records_per_key: 100 });
        let mut a = Record::event(source(), "a");
        a.set_attribute("session_id", "1");
        c.process(vec![a]).unwrap();

        // A zero-length window expires entries at the next cycle
        let mut b = Record::event(source(), "b");
        b.set_attribute("session_id", "9");
        c.process(vec![b]).unwrap();
        assert_eq!(c.key_count(), 1);
    }

    #[test]
    fn test_record_without_keys_untouched() {
        let c = correlator();
        let out = c.process(vec![Record::gauge(source(), "db.size", 1.0)]).unwrap();
        assert!(out[0].get_attribute(ATTR_CORRELATION_ID).is_none());
    }
}
