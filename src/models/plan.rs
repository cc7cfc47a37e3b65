//! Execution plan history model
//!
//! Plan entries live in the plan dictionary keyed by `plan_id`; regressions
//! reference plans by id only, so the dictionary stays an arena with no
//! cyclic ownership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Rolling performance statistics for one plan, EMA-updated on repeat sightings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPerformance {
    pub execution_count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

/// Resource usage observed for one plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResources {
    pub rows: f64,
    pub disk_reads: f64,
    pub disk_writes: f64,
    pub temp_bytes: f64,
}

/// Structural characteristics extracted from the plan tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanShape {
    pub node_types: BTreeSet<String>,
    pub has_seq_scan: bool,
    pub has_nested_loop: bool,
    pub has_hash_join: bool,
    pub has_sort: bool,
    pub estimated_rows: f64,
    pub actual_rows: f64,
    pub total_cost: f64,
}

impl PlanShape {
    /// Planner estimation accuracy in [0, 1]; 1.0 when estimate == actual
    pub fn estimation_accuracy(&self) -> f64 {
        if self.estimated_rows <= 0.0 || self.actual_rows <= 0.0 {
            return 1.0;
        }
        let ratio = self.estimated_rows / self.actual_rows;
        if ratio > 1.0 { 1.0 / ratio } else { ratio }
    }
}

/// One plan in the dictionary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    /// hash(query_id, plan_hash, total_cost)
    pub plan_id: String,
    /// Fingerprint of the query this plan belongs to
    pub query_fingerprint: String,
    pub performance: PlanPerformance,
    pub resources: PlanResources,
    pub shape: PlanShape,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Regression severity tier by slowdown factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionSeverity {
    /// Slowdown below 1.0x over the old average
    Minor,
    /// Slowdown below 5.0x
    Moderate,
    /// Slowdown of 5.0x or more
    Severe,
}

impl RegressionSeverity {
    /// Tier from the relative performance change (0.2 = 20% slower)
    pub fn from_change(change: f64) -> Self {
        if change >= 5.0 {
            Self::Severe
        } else if change >= 1.0 {
            Self::Moderate
        } else {
            Self::Minor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

/// A detected plan regression; carries plan ids only, never plan references
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRegression {
    pub regression_id: String,
    pub query_fingerprint: String,
    pub old_plan_id: String,
    pub new_plan_id: String,
    /// (new.avg - old.avg) / old.avg * 100
    pub performance_change_pct: f64,
    pub severity: RegressionSeverity,
    pub possible_causes: Vec<String>,
    pub recommendations: Vec<String>,
    /// Tiered by min(sample counts): 0.5 below 10, 0.75 below 100, 0.95 above
    pub statistical_confidence: f64,
    pub sample_size: u64,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_tiers() {
        assert_eq!(RegressionSeverity::from_change(0.25), RegressionSeverity::Minor);
        assert_eq!(RegressionSeverity::from_change(0.99), RegressionSeverity::Minor);
        assert_eq!(RegressionSeverity::from_change(1.0), RegressionSeverity::Moderate);
        assert_eq!(RegressionSeverity::from_change(4.99), RegressionSeverity::Moderate);
        assert_eq!(RegressionSeverity::from_change(5.0), RegressionSeverity::Severe);
        assert_eq!(RegressionSeverity::from_change(5.5), RegressionSeverity::Severe);
    }

    #[test]
    fn test_estimation_accuracy_is_symmetric() {
        let shape = PlanShape { estimated_rows: 100.0, actual_rows: 1000.0, ..Default::default() };
        let inverse = PlanShape { estimated_rows: 1000.0, actual_rows: 100.0, ..Default::default() };
        assert!((shape.estimation_accuracy() - 0.1).abs() < 1e-9);
        assert!((inverse.estimation_accuracy() - 0.1).abs() < 1e-9);
    }
}
