//! Plan attribute extractor stage
//!
//! For every record carrying raw query text this stage rewrites the text to
//! its anonymized form and attaches the query fingerprint. Records that also
//! carry an execution-plan payload (EXPLAIN JSON) get the plan parsed into
//! shape attributes, recorded in the plan dictionary, and checked for
//! regressions against the previous plan of the same query; a detected
//! regression is appended to the batch as an event record.

use super::anonymizer::{anonymize, fingerprint};
use super::plan_dictionary::{PlanDictionary, PlanObservation};
use crate::config::PlanConfig;
use crate::models::{AttrValue, PlanRegression, PlanResources, PlanShape, Record};
use crate::services::pipeline::Processor;
use crate::utils::CollectorResult;
use chrono::Utc;
use std::sync::Mutex;

/// Attribute carrying the raw plan payload on entry
pub const ATTR_PLAN_JSON: &str = "plan_json";
/// Attribute carrying raw query text on entry, anonymized on exit
pub const ATTR_QUERY_TEXT: &str = "query_text";
pub const ATTR_FINGERPRINT: &str = "query_fingerprint";
pub const ATTR_PLAN_ID: &str = "plan_id";
/// Marks regression events so the adaptive sampler always keeps them
pub const ATTR_REGRESSION: &str = "plan.regression";

pub struct PlanExtractor {
    dictionary: Mutex<PlanDictionary>,
}

impl PlanExtractor {
    pub fn new(config: PlanConfig) -> Self {
        Self { dictionary: Mutex::new(PlanDictionary::new(config)) }
    }

    /// Periodic retention sweep, driven by the plan-cleanup background task
    pub fn evict_expired(&self) -> usize {
        self.dictionary.lock().expect("plan dictionary poisoned").evict_expired(Utc::now())
    }

    pub fn plan_count(&self) -> usize {
        self.dictionary.lock().expect("plan dictionary poisoned").len()
    }

    fn extract(&self, record: &mut Record) -> Option<PlanRegression> {
        let query_text = record.get_attribute(ATTR_QUERY_TEXT).and_then(|v| v.as_str().map(String::from))?;

        let anonymized = anonymize(&query_text);
        let fp = fingerprint(&query_text);
        record.set_attribute(ATTR_QUERY_TEXT, anonymized);
        record.set_attribute(ATTR_FINGERPRINT, fp.clone());

        let plan_json = record.get_attribute(ATTR_PLAN_JSON).and_then(|v| v.as_str().map(String::from))?;

        let parsed: serde_json::Value = match serde_json::from_str(&plan_json) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Unparseable plan payload for fingerprint {}: {}", fp, e);
                record.attributes_mut().remove(ATTR_PLAN_JSON);
                return None;
            },
        };

        let shape = extract_shape(&parsed);
        let resources = extract_resources(&parsed);

        // The raw payload never leaves this stage; downstream sees attributes
        record.attributes_mut().remove(ATTR_PLAN_JSON);
        apply_shape_attributes(record, &shape);

        let duration_ms = duration_of(record);
        let calls = calls_of(record);
        let query_id = record
            .get_attribute("query_id")
            .map(|v| v.render())
            .unwrap_or_else(|| fp.clone());

        let observation = PlanObservation {
            query_fingerprint: fp,
            query_id,
            plan_hash: plan_hash(&shape),
            duration_ms,
            calls,
            resources,
            shape,
            observed_at: record.timestamp(),
        };

        let (plan_id, regression) =
            self.dictionary.lock().expect("plan dictionary poisoned").observe(observation);
        record.set_attribute(ATTR_PLAN_ID, plan_id);

        regression
    }
}

impl Processor for PlanExtractor {
    fn name(&self) -> &'static str {
        "plan_extractor"
    }

    fn process(&self, mut batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        let mut regressions = Vec::new();

        for record in &mut batch {
            if let Some(regression) = self.extract(record) {
                regressions.push(regression_event(record, regression));
            }
        }

        batch.extend(regressions);
        Ok(batch)
    }
}

fn regression_event(trigger: &Record, regression: PlanRegression) -> Record {
    let mut event = Record::event(
        trigger.source().clone(),
        format!(
            "plan regression for query {}: {:.1}% slower ({})",
            regression.query_fingerprint,
            regression.performance_change_pct,
            regression.severity.as_str()
        ),
    );
    event.envelope_mut().timestamp = trigger.timestamp();
    event.envelope_mut().severity = Some(13);
    event.set_attribute(ATTR_REGRESSION, true);
    event.set_attribute("regression.id", regression.regression_id.clone());
    event.set_attribute("regression.old_plan_id", regression.old_plan_id.clone());
    event.set_attribute("regression.new_plan_id", regression.new_plan_id.clone());
    event.set_attribute("regression.performance_change_pct", regression.performance_change_pct);
    event.set_attribute("regression.severity", regression.severity.as_str());
    event.set_attribute("regression.confidence", regression.statistical_confidence);
    event.set_attribute("regression.sample_size", regression.sample_size as i64);
    event.set_attribute(ATTR_FINGERPRINT, regression.query_fingerprint.clone());
    if !regression.possible_causes.is_empty() {
        event.set_attribute("regression.possible_causes", regression.possible_causes.join("; "));
    }
    if !regression.recommendations.is_empty() {
        event.set_attribute("regression.recommendations", regression.recommendations.join("; "));
    }
    event
}

/// Walk an EXPLAIN (FORMAT JSON) payload and pull out the structural
/// characteristics the regression heuristics care about.
fn extract_shape(plan: &serde_json::Value) -> PlanShape {
    let mut shape = PlanShape::default();
    let root = root_node(plan);
    if let Some(node) = root {
        walk(node, &mut shape);
        shape.total_cost = node.get("Total Cost").and_then(|v| v.as_f64()).unwrap_or(0.0);
        shape.estimated_rows = node.get("Plan Rows").and_then(|v| v.as_f64()).unwrap_or(0.0);
        shape.actual_rows = node.get("Actual Rows").and_then(|v| v.as_f64()).unwrap_or(0.0);
    }
    shape
}

fn extract_resources(plan: &serde_json::Value) -> PlanResources {
    let mut resources = PlanResources::default();
    if let Some(node) = root_node(plan) {
        sum_resources(node, &mut resources);
    }
    resources
}

fn root_node(plan: &serde_json::Value) -> Option<&serde_json::Value> {
    match plan {
        serde_json::Value::Array(items) => items.first().and_then(|i| i.get("Plan")),
        serde_json::Value::Object(_) => plan.get("Plan").or(Some(plan)),
        _ => None,
    }
}

fn walk(node: &serde_json::Value, shape: &mut PlanShape) {
    if let Some(node_type) = node.get("Node Type").and_then(|v| v.as_str()) {
        shape.node_types.insert(node_type.to_string());
        match node_type {
            "Seq Scan" => shape.has_seq_scan = true,
            "Nested Loop" => shape.has_nested_loop = true,
            "Hash Join" => shape.has_hash_join = true,
            "Sort" | "Incremental Sort" => shape.has_sort = true,
            _ => {},
        }
    }
    if let Some(children) = node.get("Plans").and_then(|v| v.as_array()) {
        for child in children {
            walk(child, shape);
        }
    }
}

fn sum_resources(node: &serde_json::Value, resources: &mut PlanResources) {
    let get = |key: &str| node.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    resources.rows += get("Actual Rows");
    resources.disk_reads += get("Shared Read Blocks") + get("Local Read Blocks");
    resources.disk_writes += get("Shared Written Blocks") + get("Local Written Blocks");
    resources.temp_bytes += (get("Temp Read Blocks") + get("Temp Written Blocks")) * 8192.0;

    if let Some(children) = node.get("Plans").and_then(|v| v.as_array()) {
        for child in children {
            sum_resources(child, resources);
        }
    }
}

fn apply_shape_attributes(record: &mut Record, shape: &PlanShape) {
    record.set_attribute("plan.has_seq_scan", shape.has_seq_scan);
    record.set_attribute("plan.has_nested_loop", shape.has_nested_loop);
    record.set_attribute("plan.has_hash_join", shape.has_hash_join);
    record.set_attribute("plan.has_sort", shape.has_sort);
    record.set_attribute("plan.total_cost", shape.total_cost);
    record.set_attribute("plan.estimated_rows", shape.estimated_rows);
    record.set_attribute("plan.actual_rows", shape.actual_rows);
    let mut node_types: Vec<&str> = shape.node_types.iter().map(|s| s.as_str()).collect();
    node_types.sort_unstable();
    record.set_attribute("plan.node_types", node_types.join(","));
}

/// Structural hash of a plan, independent of costs
fn plan_hash(shape: &PlanShape) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for node_type in &shape.node_types {
        hasher.update(node_type.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn duration_of(record: &Record) -> f64 {
    for key in ["mean_time_ms", "duration_ms", "elapsed_secs"] {
        if let Some(attr) = record.get_attribute(key) {
            let value = match attr {
                AttrValue::Double(v) => *v,
                AttrValue::Int(v) => *v as f64,
                _ => continue,
            };
            return if key == "elapsed_secs" { value * 1000.0 } else { value };
        }
    }
    match record {
        Record::Metric(m) => m.value,
        _ => 0.0,
    }
}

fn calls_of(record: &Record) -> u64 {
    match record.get_attribute("calls") {
        Some(AttrValue::Int(v)) => (*v).max(0) as u64,
        Some(AttrValue::Double(v)) => v.max(0.0) as u64,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};

    fn source() -> Source {
        Source::new(DatabaseKind::Postgres, "db1:5432", "orders")
    }

    const PLAN_SEQ_SCAN: &str = r#"[{"Plan": {
        "Node Type": "Seq Scan", "Total Cost": 120.5,
        "Plan Rows": 100, "Actual Rows": 5000,
        "Shared Read Blocks": 40
    }}]"#;

    const PLAN_INDEX: &str = r#"[{"Plan": {
        "Node Type": "Index Scan", "Total Cost": 8.3,
        "Plan Rows": 10, "Actual Rows": 12
    }}]"#;

    fn plan_record(sql: &str, plan_json: &str, duration_ms: f64, calls: i64) -> Record {
        let mut rec = Record::gauge(source(), "db.plan.duration", duration_ms);
        rec.set_attribute(ATTR_QUERY_TEXT, sql);
        rec.set_attribute(ATTR_PLAN_JSON, plan_json);
        rec.set_attribute("mean_time_ms", duration_ms);
        rec.set_attribute("calls", calls);
        rec
    }

    #[test]
    fn test_query_text_is_anonymized_in_place() {
        let extractor = PlanExtractor::new(PlanConfig::default());
        let mut rec = Record::gauge(source(), "db.statements.mean_time", 5.0);
        rec.set_attribute(ATTR_QUERY_TEXT, "SELECT * FROM t WHERE id = 42");

        let out = extractor.process(vec![rec]).unwrap();
        let text = out[0].get_attribute(ATTR_QUERY_TEXT).unwrap().render();
        assert_eq!(text, "SELECT * FROM t WHERE id = ?");
        assert!(out[0].get_attribute(ATTR_FINGERPRINT).is_some());
    }

    #[test]
    fn test_plan_payload_becomes_attributes() {
        let extractor = PlanExtractor::new(PlanConfig::default());
        let rec = plan_record("SELECT * FROM t WHERE id = 1", PLAN_SEQ_SCAN, 12.0, 10);

        let out = extractor.process(vec![rec]).unwrap();
        assert!(out[0].get_attribute(ATTR_PLAN_JSON).is_none(), "raw payload must not leave the stage");
        assert_eq!(out[0].get_attribute("plan.has_seq_scan"), Some(&AttrValue::Bool(true)));
        assert_eq!(out[0].get_attribute("plan.total_cost"), Some(&AttrValue::Double(120.5)));
        assert!(out[0].get_attribute(ATTR_PLAN_ID).is_some());
    }

    #[test]
    fn test_regression_event_appended_for_slower_new_plan() {
        let extractor = PlanExtractor::new(PlanConfig::default());

        let fast = plan_record("SELECT * FROM t WHERE id = 1", PLAN_INDEX, 10.0, 200);
        let out = extractor.process(vec![fast]).unwrap();
        assert_eq!(out.len(), 1);

        let slow = plan_record("SELECT * FROM t WHERE id = 7", PLAN_SEQ_SCAN, 65.0, 150);
        let out = extractor.process(vec![slow]).unwrap();
        assert_eq!(out.len(), 2, "expected the regression event appended");

        let event = &out[1];
        assert_eq!(event.get_attribute(ATTR_REGRESSION), Some(&AttrValue::Bool(true)));
        assert_eq!(
            event.get_attribute("regression.severity").map(|v| v.render()),
            Some("severe".to_string())
        );
        assert_eq!(
            event.get_attribute("regression.sample_size"),
            Some(&AttrValue::Int(350))
        );
        let causes = event.get_attribute("regression.possible_causes").unwrap().render();
        assert!(causes.contains("sequential scan"));
    }

    #[test]
    fn test_record_without_query_text_passes_untouched() {
        let extractor = PlanExtractor::new(PlanConfig::default());
        let rec = Record::gauge(source(), "db.size", 1024.0);
        let out = extractor.process(vec![rec]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].get_attribute(ATTR_FINGERPRINT).is_none());
    }
}
