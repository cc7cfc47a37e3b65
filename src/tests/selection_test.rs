//! Feature detection / query selection interplay

use crate::models::{DatabaseKind, ExtensionInfo, FeatureSet, QueryCategory};
use crate::services::QuerySelector;
use std::sync::Arc;

fn bare() -> FeatureSet {
    FeatureSet::empty(DatabaseKind::Postgres)
}

fn with_statements() -> FeatureSet {
    let mut fs = FeatureSet::empty(DatabaseKind::Postgres);
    fs.extensions.insert(
        "pg_stat_statements".to_string(),
        ExtensionInfo { available: true, version: Some("1.10".into()) },
    );
    fs
}

#[test]
fn test_selection_consistent_within_one_snapshot() {
    // Every query selected under a snapshot is eligible under exactly that
    // snapshot, never a mix of the old and new feature set
    let selector = QuerySelector::new(DatabaseKind::Postgres, Vec::new());
    let old = bare();
    let new = with_statements();

    for category in QueryCategory::ALL {
        for q in selector.queries_for(category, &old) {
            assert!(q.eligible(&old), "{} not eligible under its own snapshot", q.name);
        }
        for q in selector.queries_for(category, &new) {
            assert!(q.eligible(&new), "{} not eligible under its own snapshot", q.name);
        }
        // Re-reading the old snapshot after the swap still yields queries
        // eligible under the old set only
        for q in selector.queries_for(category, &old) {
            assert!(q.eligible(&old));
        }
    }
}

#[test]
fn test_concurrent_selection_during_swaps() {
    let selector = Arc::new(QuerySelector::new(DatabaseKind::Postgres, Vec::new()));
    let snapshots = [Arc::new(bare()), Arc::new(with_statements())];

    let mut handles = Vec::new();
    for worker in 0..4usize {
        let selector = selector.clone();
        let snapshots = snapshots.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..200 {
                let snapshot = &snapshots[(worker + i) % 2];
                for q in selector.queries_for(QueryCategory::Metrics, snapshot) {
                    assert!(q.eligible(snapshot), "selected query crossed snapshots");
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_metrics_category_never_empty_for_either_engine() {
    for kind in [DatabaseKind::Postgres, DatabaseKind::MySql] {
        let selector = QuerySelector::new(kind, Vec::new());
        let fs = FeatureSet::empty(kind);
        assert!(
            !selector.queries_for(QueryCategory::Metrics, &fs).is_empty(),
            "universal fallback must keep {:?} metrics alive",
            kind
        );
    }
}
