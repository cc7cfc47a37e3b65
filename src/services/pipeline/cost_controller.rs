//! Cost control stage
//!
//! Enforces two budgets: data points per minute (token bucket) and distinct
//! series (HyperLogLog estimate over a rolling hour). Past the budget, the
//! enforcement mode decides between warn / throttle / drop; tiered alerts
//! tighten the mode automatically at 90% and 100% usage and relax it again
//! below 70%.

use crate::config::CostControlConfig;
use crate::models::Record;
use crate::services::pipeline::Processor;
use crate::utils::CollectorResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Drop probability applied in throttle mode once the budget is exhausted
const THROTTLE_DROP_RATE: f64 = 0.5;
/// Register index bits for the cardinality estimator (1024 registers)
const HLL_BITS: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    Warn,
    Throttle,
    Drop,
}

impl EnforcementMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "warn" => Self::Warn,
            "drop" => Self::Drop,
            _ => Self::Throttle,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Throttle => "throttle",
            Self::Drop => "drop",
        }
    }

    fn strictness(self) -> u8 {
        match self {
            Self::Warn => 0,
            Self::Throttle => 1,
            Self::Drop => 2,
        }
    }

    /// Tier overrides only ever tighten the configured mode
    fn stricter(self, other: Self) -> Self {
        if other.strictness() > self.strictness() { other } else { self }
    }
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u64) -> Self {
        let capacity = per_minute as f64;
        Self { tokens: capacity, capacity, refill_per_sec: capacity / 60.0, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    /// Take one token; false when the minute's budget is spent
    fn take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Fraction of the minute budget currently consumed
    fn usage(&mut self) -> f64 {
        self.refill();
        1.0 - self.tokens / self.capacity
    }
}

/// Fixed-register HyperLogLog, good enough for budget enforcement
struct HyperLogLog {
    registers: [u8; HLL_REGISTERS],
}

impl HyperLogLog {
    fn new() -> Self {
        Self { registers: [0; HLL_REGISTERS] }
    }

    fn insert(&mut self, hash: u64) {
        let idx = (hash >> (64 - HLL_BITS)) as usize;
        let rest = hash << HLL_BITS;
        let rank = (rest.leading_zeros() + 1).min(64 - HLL_BITS + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    fn estimate(&self) -> f64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
        let raw = alpha * m * m / sum;

        // Small-range correction: linear counting
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        }
    }
}

struct SeriesTracker {
    per_metric: HashMap<String, HyperLogLog>,
    window_started: Instant,
}

impl SeriesTracker {
    fn new() -> Self {
        Self { per_metric: HashMap::new(), window_started: Instant::now() }
    }

    fn observe(&mut self, metric: &str, series_hash: u64) {
        // Rolling one-hour window, reset wholesale on rollover
        if self.window_started.elapsed().as_secs() >= 3600 {
            self.per_metric.clear();
            self.window_started = Instant::now();
        }
        self.per_metric.entry(metric.to_string()).or_insert_with(HyperLogLog::new).insert(series_hash);
    }

    fn total_estimate(&self) -> f64 {
        self.per_metric.values().map(|h| h.estimate()).sum()
    }
}

pub struct CostController {
    configured_mode: EnforcementMode,
    max_distinct_series: u64,
    bucket: Mutex<TokenBucket>,
    series: Mutex<SeriesTracker>,
    rng: Mutex<StdRng>,
    /// Tightened mode currently in force, if any
    override_mode: Mutex<Option<EnforcementMode>>,
    warned_at_80: Mutex<bool>,
    pub dropped: AtomicU64,
    pub throttled: AtomicU64,
}

impl CostController {
    pub fn new(config: &CostControlConfig) -> Self {
        Self {
            configured_mode: EnforcementMode::parse(&config.enforcement_mode),
            max_distinct_series: config.max_distinct_series,
            bucket: Mutex::new(TokenBucket::new(config.max_data_points_per_minute)),
            series: Mutex::new(SeriesTracker::new()),
            rng: Mutex::new(StdRng::seed_from_u64(0x00c0_57c0)),
            override_mode: Mutex::new(None),
            warned_at_80: Mutex::new(false),
            dropped: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    /// Tiered alerts: 80% warns, 90% forces at least throttle, a spent
    /// budget forces drop; the override clears once usage falls below 70%.
    /// An override never weakens the configured mode.
    fn effective_mode(&self, usage: f64, budget_spent: bool) -> EnforcementMode {
        let mut override_mode = self.override_mode.lock().expect("override mode poisoned");
        let mut warned = self.warned_at_80.lock().expect("warn flag poisoned");

        if budget_spent {
            if *override_mode != Some(EnforcementMode::Drop) {
                tracing::warn!("Data-point budget fully consumed; dropping until usage recovers");
                *override_mode = Some(EnforcementMode::Drop);
            }
        } else if usage >= 0.9 {
            if override_mode.is_none() {
                tracing::warn!("Data-point budget at {:.0}%; throttling engaged", usage * 100.0);
                *override_mode = Some(EnforcementMode::Throttle);
            }
        } else if usage >= 0.8 {
            if !*warned {
                *warned = true;
                tracing::warn!(
                    "Data-point budget at {:.0}% (mode {})",
                    usage * 100.0,
                    self.configured_mode.as_str()
                );
            }
        } else if usage < 0.7 {
            if override_mode.is_some() {
                tracing::info!("Data-point usage back below 70%; returning to configured mode");
            }
            *override_mode = None;
            *warned = false;
        }

        match *override_mode {
            Some(tier) => self.configured_mode.stricter(tier),
            None => self.configured_mode,
        }
    }

    /// Budget decision for one record: true = keep
    fn admit(&self, record: &Record) -> bool {
        let over_cardinality = match record.metric_name() {
            Some(name) => {
                let mut series = self.series.lock().expect("series tracker poisoned");
                series.observe(name, series_hash(record));
                series.total_estimate() > self.max_distinct_series as f64
            },
            None => false,
        };

        let (has_token, usage) = {
            let mut bucket = self.bucket.lock().expect("token bucket poisoned");
            (bucket.take(), bucket.usage())
        };

        if has_token && !over_cardinality {
            // Keep the tier state current even while under budget
            let _ = self.effective_mode(usage, false);
            return true;
        }

        match self.effective_mode(usage, !has_token) {
            EnforcementMode::Warn => true,
            EnforcementMode::Throttle => {
                let keep =
                    self.rng.lock().expect("cost rng poisoned").r#gen::<f64>() >= THROTTLE_DROP_RATE;
                if !keep {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                }
                keep
            },
            EnforcementMode::Drop => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }
}

impl Processor for CostController {
    fn name(&self) -> &'static str {
        "cost_controller"
    }

    fn process(&self, batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        Ok(batch.into_iter().filter(|r| self.admit(r)).collect())
    }
}

/// Identity hash of one series: metric name plus its sorted attribute set
fn series_hash(record: &Record) -> u64 {
    let mut hasher = Sha256::new();
    if let Some(name) = record.metric_name() {
        hasher.update(name.as_bytes());
    }
    for (key, value) in record.attributes() {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.render().as_bytes());
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest slice"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};

    fn source() -> Source {
        Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
    }

    fn config(per_minute: u64, mode: &str) -> CostControlConfig {
        CostControlConfig {
            max_data_points_per_minute: per_minute,
            max_distinct_series: 1_000_000,
            enforcement_mode: mode.to_string(),
        }
    }

    #[test]
    fn test_drop_mode_passes_exactly_the_budget() {
        let controller = CostController::new(&config(100, "drop"));
        let batch: Vec<Record> =
            (0..150).map(|i| Record::gauge(source(), format!("m{}", i), 1.0)).collect();

        let out = controller.process(batch).unwrap();
        // Refill over the microseconds of the loop is < 1 token
        assert_eq!(out.len(), 100);
        assert_eq!(controller.dropped.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_boundary_n_plus_one_dropped() {
        let controller = CostController::new(&config(10, "drop"));
        let batch: Vec<Record> = (0..10).map(|_| Record::gauge(source(), "m", 1.0)).collect();
        assert_eq!(controller.process(batch).unwrap().len(), 10);

        let extra = vec![Record::gauge(source(), "m", 1.0)];
        assert!(controller.process(extra).unwrap().is_empty());
        assert_eq!(controller.dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_warn_mode_keeps_over_budget_records() {
        let controller = CostController::new(&config(5, "warn"));
        let batch: Vec<Record> = (0..20).map(|_| Record::gauge(source(), "m", 1.0)).collect();
        // 100% usage forces drop mode regardless of configured warn
        let out = controller.process(batch).unwrap();
        assert!(out.len() >= 5 && out.len() < 20);
    }

    #[test]
    fn test_throttle_mode_drops_probabilistically_on_cardinality() {
        // A spent token budget always forces drop, so throttling shows up on
        // cardinality overage while data-point tokens remain
        let controller = CostController::new(&CostControlConfig {
            max_data_points_per_minute: 1_000_000,
            max_distinct_series: 10,
            enforcement_mode: "throttle".to_string(),
        });

        let mut kept = 0usize;
        for i in 0..500 {
            let mut rec = Record::gauge(source(), "db.query.time", 1.0);
            rec.set_attribute("query_id", format!("q{}", i));
            kept += controller.process(vec![rec]).unwrap().len();
        }

        assert!(kept > 10, "throttle keeps roughly half of over-cardinality records");
        assert!(kept < 500);
        assert!(controller.throttled.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_events_do_not_consume_cardinality() {
        let controller = CostController::new(&config(100, "drop"));
        let out = controller.process(vec![Record::event(source(), "hello")]).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_hll_estimate_is_reasonable() {
        let mut hll = HyperLogLog::new();
        for i in 0..10_000u64 {
            let mut hasher = Sha256::new();
            hasher.update(i.to_be_bytes());
            let digest = hasher.finalize();
            hll.insert(u64::from_be_bytes(digest[..8].try_into().unwrap()));
        }
        let estimate = hll.estimate();
        assert!((estimate - 10_000.0).abs() / 10_000.0 < 0.1, "estimate {estimate} too far off");
    }

    #[test]
    fn test_cardinality_budget_enforced() {
        let controller = CostController::new(&CostControlConfig {
            max_data_points_per_minute: 1_000_000,
            max_distinct_series: 50,
            enforcement_mode: "drop".to_string(),
        });

        let mut dropped_any = false;
        for i in 0..500 {
            let mut rec = Record::gauge(source(), "db.query.time", 1.0);
            rec.set_attribute("query_id", format!("q{}", i));
            if controller.process(vec![rec]).unwrap().is_empty() {
                dropped_any = true;
            }
        }
        assert!(dropped_any, "cardinality explosion should trip the budget");
    }
}
