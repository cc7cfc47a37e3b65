//! Feature detection and query selection model
//!
//! A `FeatureSet` is the immutable result of probing one database for
//! extensions and capabilities. Query definitions declare requirements
//! against it; the selector picks the highest-priority eligible variant
//! per telemetry category.

use crate::models::record::DatabaseKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Availability of one database extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Result of one failed probe, kept for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionError {
    pub probe: String,
    pub message: String,
}

/// Probed feature set of one database endpoint
///
/// Immutable once built; the detector replaces the whole set atomically on
/// refresh. A failed probe leaves its feature `available=false`, never a
/// guessed `true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSet {
    pub database_kind: DatabaseKind,
    pub server_version: String,
    /// Empty when no cloud fingerprint matched or detection was skipped
    pub cloud_provider: String,
    pub extensions: HashMap<String, ExtensionInfo>,
    pub capabilities: HashMap<String, bool>,
    pub detection_errors: Vec<DetectionError>,
    pub detected_at: DateTime<Utc>,
}

impl FeatureSet {
    /// Empty set used before the first detection completes
    pub fn empty(database_kind: DatabaseKind) -> Self {
        Self {
            database_kind,
            server_version: String::new(),
            cloud_provider: String::new(),
            extensions: HashMap::new(),
            capabilities: HashMap::new(),
            detection_errors: Vec::new(),
            detected_at: Utc::now(),
        }
    }

    pub fn extension_available(&self, name: &str) -> bool {
        self.extensions.get(name).map(|e| e.available).unwrap_or(false)
    }

    pub fn capability_available(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    /// Whether a requirement predicate is satisfied by this set
    pub fn satisfies(&self, req: &Requirement) -> bool {
        match req {
            Requirement::Extension(name) => self.extension_available(name),
            Requirement::Capability(name) => self.capability_available(name),
            Requirement::Kind(kind) => self.database_kind == *kind,
        }
    }
}

/// Telemetry category a query collects for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    Metrics,
    Logs,
    Traces,
    Plans,
    Ash,
    Waits,
}

impl QueryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Logs => "logs",
            Self::Traces => "traces",
            Self::Plans => "plans",
            Self::Ash => "ash",
            Self::Waits => "waits",
        }
    }

    pub const ALL: [QueryCategory; 6] =
        [Self::Metrics, Self::Logs, Self::Traces, Self::Plans, Self::Ash, Self::Waits];
}

/// Predicate a query definition places on the feature set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Requirement {
    Extension(String),
    Capability(String),
    Kind(DatabaseKind),
}

/// One collectible query variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub category: QueryCategory,
    pub name: String,
    pub sql: String,
    /// Higher wins; equal priorities tie-break by name
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl QueryDefinition {
    /// A query is eligible iff every requirement is satisfied
    pub fn eligible(&self, features: &FeatureSet) -> bool {
        self.requirements.iter().all(|r| features.satisfies(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_set_with(ext: &str) -> FeatureSet {
        let mut fs = FeatureSet::empty(DatabaseKind::Postgres);
        fs.extensions
            .insert(ext.to_string(), ExtensionInfo { available: true, version: Some("1.10".into()) });
        fs
    }

    #[test]
    fn test_missing_extension_is_unavailable() {
        let fs = FeatureSet::empty(DatabaseKind::Postgres);
        assert!(!fs.extension_available("pg_stat_statements"));
    }

    #[test]
    fn test_eligibility_requires_all_requirements() {
        let fs = feature_set_with("pg_stat_statements");
        let q = QueryDefinition {
            category: QueryCategory::Metrics,
            name: "statements".into(),
            sql: "SELECT 1".into(),
            priority: 100,
            description: String::new(),
            requirements: vec![
                Requirement::Kind(DatabaseKind::Postgres),
                Requirement::Extension("pg_stat_statements".into()),
            ],
        };
        assert!(q.eligible(&fs));

        let q2 = QueryDefinition {
            requirements: vec![Requirement::Extension("pg_wait_sampling".into())],
            ..q
        };
        assert!(!q2.eligible(&fs));
    }
}
