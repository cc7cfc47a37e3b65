//! Plan dictionary
//!
//! Tracks every execution plan seen per query fingerprint, updates
//! performance history with an exponential moving average, and flags a
//! regression when a newly seen plan is materially slower than its
//! predecessor for the same query.

use crate::config::PlanConfig;
use crate::models::{
    PlanEntry, PlanPerformance, PlanRegression, PlanResources, PlanShape, RegressionSeverity,
};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// EMA weight for performance counters on repeat sightings
const EMA_ALPHA: f64 = 0.2;
/// Relative slowdown that flags a regression (20%)
const REGRESSION_THRESHOLD: f64 = 0.20;

/// One sighting of a plan, as extracted from a record
#[derive(Debug, Clone)]
pub struct PlanObservation {
    pub query_fingerprint: String,
    pub query_id: String,
    pub plan_hash: String,
    pub duration_ms: f64,
    pub calls: u64,
    pub resources: PlanResources,
    pub shape: PlanShape,
    pub observed_at: DateTime<Utc>,
}

pub struct PlanDictionary {
    config: PlanConfig,
    plans: HashMap<String, PlanEntry>,
    /// Fingerprint -> plan ids in first-seen order (oldest first)
    by_query: HashMap<String, Vec<String>>,
}

impl PlanDictionary {
    pub fn new(config: PlanConfig) -> Self {
        Self { config, plans: HashMap::new(), by_query: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn get(&self, plan_id: &str) -> Option<&PlanEntry> {
        self.plans.get(plan_id)
    }

    pub fn plans_for(&self, fingerprint: &str) -> Vec<&PlanEntry> {
        self.by_query
            .get(fingerprint)
            .map(|ids| ids.iter().filter_map(|id| self.plans.get(id)).collect())
            .unwrap_or_default()
    }

    /// Record a plan sighting. Returns the plan id and, when this is a new
    /// plan that is materially slower than the previous plan for the same
    /// fingerprint, the detected regression.
    pub fn observe(&mut self, obs: PlanObservation) -> (String, Option<PlanRegression>) {
        let plan_id = plan_id(&obs.query_id, &obs.plan_hash, obs.shape.total_cost);

        if let Some(entry) = self.plans.get_mut(&plan_id) {
            update_entry(entry, &obs);
            return (plan_id, None);
        }

        // New plan: regression analysis against the most recent prior plan
        let regression = self
            .by_query
            .get(&obs.query_fingerprint)
            .and_then(|ids| ids.last())
            .and_then(|prior_id| self.plans.get(prior_id))
            .and_then(|prior| analyze_regression(prior, &plan_id, &obs));

        let entry = new_entry(plan_id.clone(), &obs);
        self.plans.insert(plan_id.clone(), entry);
        self.by_query.entry(obs.query_fingerprint.clone()).or_default().push(plan_id.clone());

        self.enforce_per_query_cap(&obs.query_fingerprint);

        (plan_id, regression)
    }

    /// Drop plans not seen within the retention period. Returns how many
    /// entries were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.retention_period_secs as i64);
        let expired: Vec<String> = self
            .plans
            .iter()
            .filter(|(_, entry)| entry.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.plans.remove(id)
                && let Some(ids) = self.by_query.get_mut(&entry.query_fingerprint)
            {
                ids.retain(|i| i != id);
                if ids.is_empty() {
                    self.by_query.remove(&entry.query_fingerprint);
                }
            }
        }
        expired.len()
    }

    fn enforce_per_query_cap(&mut self, fingerprint: &str) {
        let Some(ids) = self.by_query.get_mut(fingerprint) else {
            return;
        };
        while ids.len() > self.config.max_plans_per_query {
            let oldest = ids.remove(0);
            self.plans.remove(&oldest);
        }
    }
}

/// plan_id = hash(query_id, plan_hash, total_cost), truncated hex
pub fn plan_id(query_id: &str, plan_hash: &str, total_cost: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(plan_hash.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(total_cost.to_bits().to_be_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    digest.iter().take(bytes).map(|b| format!("{:02x}", b)).collect()
}

fn new_entry(plan_id: String, obs: &PlanObservation) -> PlanEntry {
    PlanEntry {
        plan_id,
        query_fingerprint: obs.query_fingerprint.clone(),
        performance: PlanPerformance {
            execution_count: obs.calls.max(1),
            avg_duration_ms: obs.duration_ms,
            min_duration_ms: obs.duration_ms,
            max_duration_ms: obs.duration_ms,
            p95_duration_ms: obs.duration_ms,
            p99_duration_ms: obs.duration_ms,
        },
        resources: obs.resources.clone(),
        shape: obs.shape.clone(),
        first_seen: obs.observed_at,
        last_seen: obs.observed_at,
    }
}

fn update_entry(entry: &mut PlanEntry, obs: &PlanObservation) {
    let perf = &mut entry.performance;
    perf.execution_count += obs.calls.max(1);
    perf.avg_duration_ms += EMA_ALPHA * (obs.duration_ms - perf.avg_duration_ms);
    perf.min_duration_ms = perf.min_duration_ms.min(obs.duration_ms);
    perf.max_duration_ms = perf.max_duration_ms.max(obs.duration_ms);
    // Streaming upper-quantile estimate: track fast toward larger samples,
    // decay slowly otherwise
    for (slot, decay) in [(&mut perf.p95_duration_ms, 0.05), (&mut perf.p99_duration_ms, 0.01)] {
        if obs.duration_ms > *slot {
            *slot += EMA_ALPHA * (obs.duration_ms - *slot);
        } else {
            *slot += decay * (obs.duration_ms - *slot);
        }
    }

    let res = &mut entry.resources;
    res.rows += EMA_ALPHA * (obs.resources.rows - res.rows);
    res.disk_reads += EMA_ALPHA * (obs.resources.disk_reads - res.disk_reads);
    res.disk_writes += EMA_ALPHA * (obs.resources.disk_writes - res.disk_writes);
    res.temp_bytes += EMA_ALPHA * (obs.resources.temp_bytes - res.temp_bytes);

    entry.shape = obs.shape.clone();
    entry.last_seen = obs.observed_at;
}

fn analyze_regression(
    prior: &PlanEntry,
    new_plan_id: &str,
    obs: &PlanObservation,
) -> Option<PlanRegression> {
    let old_avg = prior.performance.avg_duration_ms;
    if old_avg <= 0.0 {
        return None;
    }

    let change = (obs.duration_ms - old_avg) / old_avg;
    if change < REGRESSION_THRESHOLD {
        return None;
    }

    let mut causes = Vec::new();
    let mut recommendations = Vec::new();

    if obs.shape.has_seq_scan && !prior.shape.has_seq_scan {
        causes.push("sequential scan introduced".to_string());
        recommendations.push("check for a missing or unused index on the filtered columns".to_string());
    }
    if prior.shape.has_hash_join && obs.shape.has_nested_loop && !obs.shape.has_hash_join {
        causes.push("hash join replaced by nested loop".to_string());
        recommendations.push("refresh statistics so the planner sees current row counts".to_string());
    }
    if obs.shape.estimation_accuracy() < 0.5 {
        causes.push("row estimation accuracy below 50%".to_string());
        recommendations.push("run ANALYZE on the involved tables".to_string());
    }
    if obs.resources.disk_reads >= 2.0 * prior.resources.disk_reads && prior.resources.disk_reads > 0.0 {
        causes.push("disk reads at least doubled".to_string());
        recommendations.push("verify the working set still fits the buffer cache".to_string());
    }
    if obs.resources.temp_bytes >= 2.0 * prior.resources.temp_bytes && prior.resources.temp_bytes > 0.0 {
        causes.push("temp space usage at least doubled".to_string());
        recommendations.push("consider raising the per-operation memory budget".to_string());
    }

    let old_count = prior.performance.execution_count;
    let new_count = obs.calls.max(1);
    let min_count = old_count.min(new_count);
    let confidence = if min_count >= 100 {
        0.95
    } else if min_count >= 10 {
        0.75
    } else {
        0.5
    };

    Some(PlanRegression {
        regression_id: regression_id(&prior.plan_id, new_plan_id),
        query_fingerprint: obs.query_fingerprint.clone(),
        old_plan_id: prior.plan_id.clone(),
        new_plan_id: new_plan_id.to_string(),
        performance_change_pct: change * 100.0,
        severity: RegressionSeverity::from_change(change),
        possible_causes: causes,
        recommendations,
        statistical_confidence: confidence,
        sample_size: old_count + new_count,
        detected_at: obs.observed_at,
    })
}

fn regression_id(old_plan_id: &str, new_plan_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(old_plan_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(new_plan_id.as_bytes());
    hex_prefix(&hasher.finalize(), 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(fingerprint: &str, plan_hash: &str, duration_ms: f64, calls: u64) -> PlanObservation {
        PlanObservation {
            query_fingerprint: fingerprint.to_string(),
            query_id: format!("qid-{fingerprint}"),
            plan_hash: plan_hash.to_string(),
            duration_ms,
            calls,
            resources: PlanResources::default(),
            shape: PlanShape { total_cost: duration_ms, ..Default::default() },
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_regression_severe_with_high_confidence() {
        let mut dict = PlanDictionary::new(PlanConfig::default());

        let (_, none) = dict.observe(observation("q1", "p1", 10.0, 200));
        assert!(none.is_none());

        let (_, regression) = dict.observe(observation("q1", "p2", 65.0, 150));
        let regression = regression.expect("regression expected");
        assert!((regression.performance_change_pct - 550.0).abs() < 1e-9);
        assert_eq!(regression.severity, RegressionSeverity::Severe);
        assert!((regression.statistical_confidence - 0.95).abs() < 1e-9);
        assert_eq!(regression.sample_size, 350);
    }

    #[test]
    fn test_no_regression_below_threshold() {
        let mut dict = PlanDictionary::new(PlanConfig::default());
        dict.observe(observation("q1", "p1", 100.0, 50));
        let (_, regression) = dict.observe(observation("q1", "p2", 110.0, 50));
        assert!(regression.is_none());
    }

    #[test]
    fn test_repeat_sighting_updates_ema_not_regression() {
        let mut dict = PlanDictionary::new(PlanConfig::default());
        let (id, _) = dict.observe(observation("q1", "p1", 100.0, 1));
        let (same_id, regression) = dict.observe(observation("q1", "p1", 200.0, 1));
        assert_eq!(id, same_id);
        assert!(regression.is_none());

        let entry = dict.get(&id).unwrap();
        assert!((entry.performance.avg_duration_ms - 120.0).abs() < 1e-9);
        assert_eq!(entry.performance.execution_count, 2);
        assert_eq!(entry.performance.min_duration_ms, 100.0);
        assert_eq!(entry.performance.max_duration_ms, 200.0);
        assert!(entry.last_seen >= entry.first_seen);
    }

    #[test]
    fn test_per_query_cap_evicts_oldest() {
        let mut dict =
            PlanDictionary::new(PlanConfig { retention_period_secs: 86_400, max_plans_per_query: 3 });

        let (first_id, _) = dict.observe(observation("q1", "p1", 10.0, 1));
        for (i, hash) in ["p2", "p3", "p4"].iter().enumerate() {
            dict.observe(observation("q1", hash, 10.0 + i as f64 * 0.1, 1));
        }

        assert_eq!(dict.plans_for("q1").len(), 3);
        assert!(dict.get(&first_id).is_none(), "oldest plan should be evicted");
    }

    #[test]
    fn test_retention_eviction() {
        let mut dict =
            PlanDictionary::new(PlanConfig { retention_period_secs: 60, max_plans_per_query: 10 });
        let mut obs = observation("q1", "p1", 10.0, 1);
        obs.observed_at = Utc::now() - Duration::seconds(120);
        dict.observe(obs);

        assert_eq!(dict.evict_expired(Utc::now()), 1);
        assert!(dict.is_empty());
        assert!(dict.plans_for("q1").is_empty());
    }

    #[test]
    fn test_cause_heuristics() {
        let mut dict = PlanDictionary::new(PlanConfig::default());
        let mut old = observation("q1", "p1", 10.0, 200);
        old.shape.has_hash_join = true;
        dict.observe(old);

        let mut new = observation("q1", "p2", 100.0, 200);
        new.shape.has_seq_scan = true;
        new.shape.has_nested_loop = true;
        new.shape.estimated_rows = 10.0;
        new.shape.actual_rows = 1000.0;
        let (_, regression) = dict.observe(new);
        let causes = regression.unwrap().possible_causes;
        assert!(causes.iter().any(|c| c.contains("sequential scan")));
        assert!(causes.iter().any(|c| c.contains("nested loop")));
        assert!(causes.iter().any(|c| c.contains("estimation accuracy")));
    }
}
