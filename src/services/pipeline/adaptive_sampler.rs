//! Adaptive sampling stage
//!
//! Rule-based probabilistic sampling with deduplication memory. Rules are an
//! ordered first-match list of attribute predicates; error-severity and
//! regression-flagged records are always kept. Sampling uses a seeded RNG,
//! so decisions are reproducible for a fixed record stream and seed.
//!
//! State is in-memory only by design: losing the dedup window on restart is
//! acceptable for telemetry.

use super::plan_extractor::{ATTR_FINGERPRINT, ATTR_REGRESSION};
use crate::config::{SamplerConfig, SamplerRuleConfig};
use crate::models::{AttrValue, Record};
use crate::services::pipeline::Processor;
use crate::utils::CollectorResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Attribute attached to a kept record carrying the number of duplicates
/// suppressed since its fingerprint was last emitted
pub const ATTR_DEDUP_COUNT: &str = "sampler.deduplicated.count";

/// OTLP severity at or above which records bypass sampling (ERROR and up)
const ERROR_SEVERITY: u8 = 17;

struct DedupEntry {
    first_seen: Instant,
    suppressed: u64,
}

/// Bounded LRU keyed by record fingerprint. Within the TTL the first record
/// is kept and subsequent hits are counted and dropped; counts re-surface on
/// the next kept record for the same key.
struct DedupLru {
    max_size: usize,
    ttl: Duration,
    entries: HashMap<String, DedupEntry>,
    order: VecDeque<String>,
    /// Counts carried over from expired or evicted buckets
    pending_counts: HashMap<String, u64>,
}

enum DedupDecision {
    /// Keep, attaching the suppressed-count accumulated for this key
    Keep(u64),
    Suppress,
}

impl DedupLru {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
            pending_counts: HashMap::new(),
        }
    }

    fn check(&mut self, key: &str) -> DedupDecision {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.first_seen.elapsed() < self.ttl {
                entry.suppressed += 1;
                self.touch(key);
                return DedupDecision::Suppress;
            }
            // Window expired: roll the suppressed count over to this keep
            let carried = entry.suppressed + self.pending_counts.remove(key).unwrap_or(0);
            entry.first_seen = Instant::now();
            entry.suppressed = 0;
            self.touch(key);
            return DedupDecision::Keep(carried);
        }

        if self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        self.entries.insert(key.to_string(), DedupEntry { first_seen: Instant::now(), suppressed: 0 });
        self.order.push_back(key.to_string());

        DedupDecision::Keep(self.pending_counts.remove(key).unwrap_or(0))
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.to_string());
        }
    }

    /// LRU eviction; the evicted bucket's suppressed count is parked so it
    /// is not lost silently
    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front()
            && let Some(entry) = self.entries.remove(&oldest)
            && entry.suppressed > 0
        {
            *self.pending_counts.entry(oldest).or_insert(0) += entry.suppressed;
        }
    }
}

pub struct AdaptiveSampler {
    config: SamplerConfig,
    rng: Mutex<StdRng>,
    dedup: Mutex<DedupLru>,
}

impl AdaptiveSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let dedup =
            DedupLru::new(config.dedup_max_size, Duration::from_secs(config.dedup_ttl_secs));
        Self { config, rng: Mutex::new(rng), dedup: Mutex::new(dedup) }
    }

    /// Keep-or-drop decision for one record
    fn keep(&self, record: &mut Record) -> bool {
        // Dedup first so suppressed duplicates are counted regardless of rates
        if let Some(key) = dedup_key(record) {
            match self.dedup.lock().expect("dedup lru poisoned").check(&key) {
                DedupDecision::Suppress => return false,
                DedupDecision::Keep(carried) if carried > 0 => {
                    record.set_attribute(ATTR_DEDUP_COUNT, carried as i64);
                },
                DedupDecision::Keep(_) => {},
            }
        }

        let rate = self.rate_for(record);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().expect("sampler rng poisoned").r#gen::<f64>() < rate
    }

    /// First matching rule wins; implicit keep-all rules for error severity
    /// and regression flags take precedence
    fn rate_for(&self, record: &Record) -> f64 {
        if record.severity().map(|s| s >= ERROR_SEVERITY).unwrap_or(false) {
            return 1.0;
        }
        if matches!(record.get_attribute(ATTR_REGRESSION), Some(AttrValue::Bool(true))) {
            return 1.0;
        }

        for rule in &self.config.rules {
            if rule_matches(rule, record) {
                return rule.sample_rate;
            }
        }
        self.config.default_sampling_rate
    }
}

fn rule_matches(rule: &SamplerRuleConfig, record: &Record) -> bool {
    match record.get_attribute(&rule.attribute) {
        Some(value) => match &rule.equals {
            Some(expected) => value.render() == *expected,
            None => true,
        },
        None => false,
    }
}

/// Dedup key: fingerprint plus source, so identical queries from distinct
/// databases keep separate windows
fn dedup_key(record: &Record) -> Option<String> {
    record
        .get_attribute(ATTR_FINGERPRINT)
        .and_then(|v| v.as_str())
        .map(|fp| format!("{}|{}", record.source().key(), fp))
}

impl Processor for AdaptiveSampler {
    fn name(&self) -> &'static str {
        "adaptive_sampler"
    }

    fn process(&self, batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        let mut kept = Vec::with_capacity(batch.len());
        for mut record in batch {
            if self.keep(&mut record) {
                kept.push(record);
            }
        }
        Ok(kept)
    }
}
