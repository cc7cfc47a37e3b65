//! Verification / PII redaction stage
//!
//! Detects PII by attribute name and by value pattern, redacts it, validates
//! required fields, enforces per-field cardinality caps, and appends a
//! quality score to every record. Findings go to a bounded feedback channel;
//! a drainer converts them to log records fed back into the pipeline, so
//! feedback is observable through the same export path as everything else.

use crate::config::VerificationConfig;
use crate::models::{AttrValue, Record, Source};
use crate::services::pipeline::Processor;
use crate::utils::CollectorResult;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex"));
static SSN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"));
static CREDIT_CARD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").expect("credit card regex"));
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d{1,2}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").expect("phone regex")
});
static IPV4_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ipv4 regex"));

/// How long a distinct value counts against a field's cardinality cap
const CARDINALITY_WINDOW_HOURS: i64 = 24;
/// Minimum spacing between "feedback channel full" warnings
const OVERFLOW_WARN_PERIOD_SECS: u64 = 60;
/// Value substituted for new values past a field's cardinality cap
pub const OVERFLOW_VALUE: &str = "__overflow__";

/// One finding, posted to the feedback channel
#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: u8,
    pub body: String,
    pub source: Source,
    pub timestamp: DateTime<Utc>,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    PiiDetected,
    MissingFields,
    CardinalityExceeded,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiiDetected => "pii_detected",
            Self::MissingFields => "missing_fields",
            Self::CardinalityExceeded => "cardinality_exceeded",
        }
    }
}

impl Finding {
    /// Render the finding as the log record fed back into the pipeline
    pub fn into_record(self) -> Record {
        let mut rec = Record::event(self.source, self.body);
        rec.envelope_mut().timestamp = self.timestamp;
        rec.envelope_mut().severity = Some(self.severity);
        rec.set_attribute("event.name", self.kind.as_str());
        rec.set_attribute("feedback", true);
        for (key, value) in self.attributes {
            rec.set_attribute(key, value);
        }
        rec
    }
}

struct FieldCardinality {
    values: HashMap<String, DateTime<Utc>>,
    exceeded_reported: bool,
}

pub struct VerificationProcessor {
    config: VerificationConfig,
    pii_names: Vec<String>,
    excluded: HashSet<String>,
    cardinality: Mutex<HashMap<String, FieldCardinality>>,
    feedback: mpsc::Sender<Finding>,
    last_overflow_warning: Mutex<Option<Instant>>,
}

impl VerificationProcessor {
    /// Returns the processor and the feedback receiver the drainer consumes
    pub fn new(config: VerificationConfig) -> (Self, mpsc::Receiver<Finding>) {
        let (tx, rx) = mpsc::channel(config.feedback_buffer.max(1));
        let pii_names = config.pii_field_names.iter().map(|n| n.to_lowercase()).collect();
        let excluded = config.excluded_fields.iter().map(|n| n.to_lowercase()).collect();
        (
            Self {
                config,
                pii_names,
                excluded,
                cardinality: Mutex::new(HashMap::new()),
                feedback: tx,
                last_overflow_warning: Mutex::new(None),
            },
            rx,
        )
    }

    fn verify(&self, record: &mut Record) {
        let source = record.source().clone();
        let timestamp = record.timestamp();
        let mut findings = Vec::new();

        let total_attrs = record.attributes().len();
        let mut empty_values = 0usize;

        // PII by field name and by value pattern
        for (key, value) in record.attributes_mut().iter_mut() {
            let lower = key.to_lowercase();
            if self.excluded.contains(&lower) {
                continue;
            }

            if let AttrValue::Str(s) = value
                && s.is_empty()
            {
                empty_values += 1;
            }

            let name_hit = self.pii_names.iter().any(|n| lower.contains(n.as_str()));
            let value_hit = match value {
                AttrValue::Str(s) => value_pattern(s),
                _ => None,
            };

            if name_hit || value_hit.is_some() {
                if let AttrValue::Str(s) = value {
                    if value_hit.is_some() || name_hit {
                        *s = self.config.redaction_text.clone();
                    }
                } else if name_hit {
                    *value = AttrValue::Str(self.config.redaction_text.clone());
                }

                let pattern = value_hit.unwrap_or("field_name");
                findings.push(Finding {
                    kind: FindingKind::PiiDetected,
                    severity: 8,
                    body: format!("pii detected in attribute '{}'", key),
                    source: source.clone(),
                    timestamp,
                    attributes: vec![
                        ("field".to_string(), key.clone()),
                        ("pattern".to_string(), pattern.to_string()),
                    ],
                });
            }
        }

        // Required-field validation
        let missing: Vec<&String> = self
            .config
            .required_fields
            .iter()
            .filter(|f| record.get_attribute(f).is_none())
            .collect();
        let missing_count = missing.len();
        if !missing.is_empty() {
            findings.push(Finding {
                kind: FindingKind::MissingFields,
                severity: 6,
                body: format!(
                    "record is missing required field(s): {}",
                    missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ),
                source: source.clone(),
                timestamp,
                attributes: vec![(
                    "fields".to_string(),
                    missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(","),
                )],
            });
        }

        // Cardinality caps
        findings.extend(self.enforce_cardinality(record, &source, timestamp));

        // Quality score: up to 0.3 for missing required fields, up to 0.2
        // for empty string values, floored at zero
        let missing_ratio = if self.config.required_fields.is_empty() {
            0.0
        } else {
            missing_count as f64 / self.config.required_fields.len() as f64
        };
        let empty_ratio =
            if total_attrs == 0 { 0.0 } else { empty_values as f64 / total_attrs as f64 };
        let score = (1.0 - 0.3 * missing_ratio - 0.2 * empty_ratio).max(0.0);
        record.set_attribute("quality_score", score);

        for finding in findings {
            self.post(finding);
        }
    }

    fn enforce_cardinality(
        &self,
        record: &mut Record,
        source: &Source,
        timestamp: DateTime<Utc>,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        if self.config.cardinality_limits.is_empty() {
            return findings;
        }

        let mut tracker = self.cardinality.lock().expect("cardinality tracker poisoned");
        let cutoff = Utc::now() - Duration::hours(CARDINALITY_WINDOW_HOURS);

        for (field, limit) in &self.config.cardinality_limits {
            let Some(value) = record.get_attribute(field).map(|v| v.render()) else {
                continue;
            };

            let entry = tracker
                .entry(field.clone())
                .or_insert_with(|| FieldCardinality { values: HashMap::new(), exceeded_reported: false });
            entry.values.retain(|_, seen| *seen > cutoff);

            if let Some(seen) = entry.values.get_mut(&value) {
                *seen = Utc::now();
                continue;
            }

            if entry.values.len() < *limit {
                entry.values.insert(value, Utc::now());
                continue;
            }

            // Over the cap: coalesce and report once per field
            record.set_attribute(field.as_str(), OVERFLOW_VALUE);
            if !entry.exceeded_reported {
                entry.exceeded_reported = true;
                findings.push(Finding {
                    kind: FindingKind::CardinalityExceeded,
                    severity: 6,
                    body: format!("cardinality limit {} reached for field '{}'", limit, field),
                    source: source.clone(),
                    timestamp,
                    attributes: vec![
                        ("field".to_string(), field.clone()),
                        ("limit".to_string(), limit.to_string()),
                    ],
                });
            }
        }

        findings
    }

    fn post(&self, finding: Finding) {
        if self.feedback.try_send(finding).is_err() {
            let mut last = self.last_overflow_warning.lock().expect("overflow warning poisoned");
            let warn = match *last {
                Some(at) => at.elapsed().as_secs() >= OVERFLOW_WARN_PERIOD_SECS,
                None => true,
            };
            if warn {
                *last = Some(Instant::now());
                tracing::warn!("Verification feedback channel full, dropping findings");
            }
        }
    }
}

impl Processor for VerificationProcessor {
    fn name(&self) -> &'static str {
        "verification"
    }

    fn process(&self, mut batch: Vec<Record>) -> CollectorResult<Vec<Record>> {
        for record in &mut batch {
            self.verify(record);
        }
        Ok(batch)
    }
}

fn value_pattern(value: &str) -> Option<&'static str> {
    if EMAIL_PATTERN.is_match(value) {
        Some("email")
    } else if SSN_PATTERN.is_match(value) {
        Some("ssn")
    } else if CREDIT_CARD_PATTERN.is_match(value) {
        Some("credit_card")
    } else if IPV4_PATTERN.is_match(value) {
        Some("ipv4")
    } else if PHONE_PATTERN.is_match(value) {
        Some("phone")
    } else {
        None
    }
}
