//! Query Selector
//!
//! Picks, per telemetry category, the eligible queries for a feature-set
//! snapshot, ordered by descending priority (name as the deterministic
//! tie-break). Selection is pure with respect to a snapshot; the cached
//! selection is invalidated atomically when the snapshot's `detected_at`
//! changes.

use crate::models::{DatabaseKind, FeatureSet, QueryCategory, QueryDefinition};
use crate::services::query_catalog;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

struct SelectionCache {
    detected_at: DateTime<Utc>,
    by_category: HashMap<QueryCategory, Vec<QueryDefinition>>,
}

pub struct QuerySelector {
    kind: DatabaseKind,
    catalog: Vec<QueryDefinition>,
    cache: RwLock<Option<SelectionCache>>,
    /// Categories already logged as having no eligible query
    logged_misses: Mutex<HashSet<QueryCategory>>,
}

impl QuerySelector {
    /// Build a selector over the built-in catalog merged with custom
    /// queries registered by configuration
    pub fn new(kind: DatabaseKind, custom: Vec<QueryDefinition>) -> Self {
        let mut catalog = query_catalog::builtin_queries();
        catalog.extend(custom);
        Self {
            kind,
            catalog,
            cache: RwLock::new(None),
            logged_misses: Mutex::new(HashSet::new()),
        }
    }

    /// Eligible queries for one category under the given snapshot,
    /// highest priority first
    pub fn queries_for(&self, category: QueryCategory, features: &FeatureSet) -> Vec<QueryDefinition> {
        {
            let cache = self.cache.read().expect("selector cache poisoned");
            if let Some(cached) = cache.as_ref()
                && cached.detected_at == features.detected_at
            {
                return self.report(category, cached.by_category.get(&category).cloned().unwrap_or_default());
            }
        }

        let by_category = self.compute(features);
        let selected = by_category.get(&category).cloned().unwrap_or_default();

        let mut cache = self.cache.write().expect("selector cache poisoned");
        *cache = Some(SelectionCache { detected_at: features.detected_at, by_category });

        self.report(category, selected)
    }

    fn compute(&self, features: &FeatureSet) -> HashMap<QueryCategory, Vec<QueryDefinition>> {
        let mut by_category: HashMap<QueryCategory, Vec<QueryDefinition>> = HashMap::new();

        for q in &self.catalog {
            if q.eligible(features) {
                by_category.entry(q.category).or_default().push(q.clone());
            }
        }

        for list in by_category.values_mut() {
            list.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        }

        by_category
    }

    fn report(&self, category: QueryCategory, selected: Vec<QueryDefinition>) -> Vec<QueryDefinition> {
        if selected.is_empty() {
            let mut logged = self.logged_misses.lock().expect("miss log poisoned");
            if logged.insert(category) {
                tracing::info!(
                    "No eligible {} query for {:?} endpoints this cycle; category will be skipped",
                    category.as_str(),
                    self.kind
                );
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtensionInfo, Requirement};

    fn features_with_statements() -> FeatureSet {
        let mut fs = FeatureSet::empty(DatabaseKind::Postgres);
        fs.extensions.insert(
            "pg_stat_statements".to_string(),
            ExtensionInfo { available: true, version: Some("1.10".into()) },
        );
        fs.capabilities.insert("pg_stat_database".to_string(), true);
        fs
    }

    #[test]
    fn test_priority_ordering_highest_first() {
        let selector = QuerySelector::new(DatabaseKind::Postgres, Vec::new());
        let selected = selector.queries_for(QueryCategory::Metrics, &features_with_statements());
        assert!(!selected.is_empty());
        for pair in selected.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
        }
        assert_eq!(selected[0].name, "db.statements.mean_time");
    }

    #[test]
    fn test_degraded_feature_set_falls_back() {
        let selector = QuerySelector::new(DatabaseKind::Postgres, Vec::new());
        let bare = FeatureSet::empty(DatabaseKind::Postgres);
        let selected = selector.queries_for(QueryCategory::Metrics, &bare);
        // Universal fallbacks survive with no extensions at all
        assert!(!selected.is_empty());
        assert!(selected.iter().all(|q| q.requirements.iter().all(|r| matches!(r, Requirement::Kind(_)))));
    }

    #[test]
    fn test_custom_query_merges_and_ties_break_by_name() {
        let custom = QueryDefinition {
            category: QueryCategory::Metrics,
            name: "aa.custom".to_string(),
            sql: "SELECT 1".to_string(),
            priority: 10,
            description: String::new(),
            requirements: vec![Requirement::Kind(DatabaseKind::Postgres)],
        };
        let selector = QuerySelector::new(DatabaseKind::Postgres, vec![custom]);
        let bare = FeatureSet::empty(DatabaseKind::Postgres);
        let selected = selector.queries_for(QueryCategory::Metrics, &bare);
        let priority_10: Vec<&str> =
            selected.iter().filter(|q| q.priority == 10).map(|q| q.name.as_str()).collect();
        assert_eq!(priority_10.first(), Some(&"aa.custom"));
    }

    #[test]
    fn test_cache_invalidated_on_new_snapshot() {
        let selector = QuerySelector::new(DatabaseKind::Postgres, Vec::new());
        let bare = FeatureSet::empty(DatabaseKind::Postgres);
        let before = selector.queries_for(QueryCategory::Metrics, &bare);
        assert!(before.iter().all(|q| q.name != "db.statements.mean_time"));

        // New snapshot (different detected_at) with the extension available
        let richer = features_with_statements();
        let after = selector.queries_for(QueryCategory::Metrics, &richer);
        assert!(after.iter().any(|q| q.name == "db.statements.mean_time"));
    }

    #[test]
    fn test_selection_is_pure_per_snapshot() {
        let selector = QuerySelector::new(DatabaseKind::Postgres, Vec::new());
        let fs = features_with_statements();
        let a = selector.queries_for(QueryCategory::Logs, &fs);
        let b = selector.queries_for(QueryCategory::Logs, &fs);
        let names_a: Vec<_> = a.iter().map(|q| &q.name).collect();
        let names_b: Vec<_> = b.iter().map(|q| &q.name).collect();
        assert_eq!(names_a, names_b);
    }
}
