//! Telemetry record model
//!
//! A `Record` is the unit flowing through the pipeline: a metric, an event
//! (log-shaped), or a trace span, all carrying the same envelope. Processors
//! may add or redact attributes but never alter the envelope's `timestamp`
//! or `source`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    MySql,
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgresql"),
            Self::MySql => write!(f, "mysql"),
        }
    }
}

/// Originating database endpoint, used for attribution and per-database
/// state keying (circuit breakers, feature sets, scraper stats)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub kind: DatabaseKind,
    /// host:port of the monitored endpoint
    pub endpoint: String,
    /// Database (schema) name within the endpoint
    pub database: String,
}

impl Source {
    pub fn new(kind: DatabaseKind, endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self { kind, endpoint: endpoint.into(), database: database.into() }
    }

    /// Stable key for per-database state maps
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.endpoint, self.database)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Typed attribute value
///
/// Booleans used as metric values are emitted as 0/1; the pipeline keeps
/// them typed until export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Double(f64),
    Str(String),
    Bool(bool),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Render for log bodies and debug output
    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Str(v) => v.clone(),
            Self::Bool(v) => v.to_string(),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Driver-agnostic result cell
///
/// Both database adapters decode native wire values into this sum type, so
/// the "first numeric column is the metric value" rule is a typed match
/// rather than a runtime cast.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Null,
}

impl ColumnValue {
    /// Numeric reading of the cell, if it has one. Booleans count as 0/1.
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Convert to a typed attribute value; `None` for NULL cells
    pub fn to_attr(&self) -> Option<AttrValue> {
        match self {
            Self::Int(v) => Some(AttrValue::Int(*v)),
            Self::Float(v) => Some(AttrValue::Double(*v)),
            Self::Text(v) => Some(AttrValue::Str(v.clone())),
            // Booleans become int attributes 0/1
            Self::Bool(v) => Some(AttrValue::Int(i64::from(*v))),
            Self::Timestamp(v) => Some(AttrValue::Str(v.to_rfc3339())),
            Self::Null => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Bool(v) => v.to_string(),
            Self::Timestamp(v) => v.to_rfc3339(),
            Self::Null => "NULL".to_string(),
        }
    }
}

/// Common envelope carried by every record shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    #[serde(default)]
    pub resource_attributes: BTreeMap<String, AttrValue>,
    /// Severity for log-shaped records (OTLP severity number scale)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
}

impl Envelope {
    pub fn new(source: Source) -> Self {
        Self { timestamp: Utc::now(), source, resource_attributes: BTreeMap::new(), severity: None }
    }

    pub fn at(source: Source, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, source, resource_attributes: BTreeMap::new(), severity: None }
    }
}

/// Metric kind, mirroring the OTLP metric families the collector emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    /// Monotonic counter
    Sum,
    Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub upper_bound: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub envelope: Envelope,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub kind: MetricKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub histogram_buckets: Vec<HistogramBucket>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub envelope: Envelope,
    pub body: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub envelope: Envelope,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

/// The element flowing through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Record {
    Metric(MetricRecord),
    Event(EventRecord),
    Trace(TraceRecord),
}

impl Record {
    pub fn gauge(source: Source, name: impl Into<String>, value: f64) -> Self {
        Self::Metric(MetricRecord {
            envelope: Envelope::new(source),
            name: name.into(),
            unit: String::new(),
            kind: MetricKind::Gauge,
            value,
            histogram_buckets: Vec::new(),
            attributes: BTreeMap::new(),
        })
    }

    pub fn event(source: Source, body: impl Into<String>) -> Self {
        Self::Event(EventRecord {
            envelope: Envelope::new(source),
            body: body.into(),
            attributes: BTreeMap::new(),
        })
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Metric(m) => &m.envelope,
            Self::Event(e) => &e.envelope,
            Self::Trace(t) => &t.envelope,
        }
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Self::Metric(m) => &mut m.envelope,
            Self::Event(e) => &mut e.envelope,
            Self::Trace(t) => &mut t.envelope,
        }
    }

    pub fn source(&self) -> &Source {
        &self.envelope().source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope().timestamp
    }

    /// Data-point / body attributes of the record shape
    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        match self {
            Self::Metric(m) => &m.attributes,
            Self::Event(e) => &e.attributes,
            Self::Trace(t) => &t.attributes,
        }
    }

    pub fn attributes_mut(&mut self) -> &mut BTreeMap<String, AttrValue> {
        match self {
            Self::Metric(m) => &mut m.attributes,
            Self::Event(e) => &mut e.attributes,
            Self::Trace(t) => &mut t.attributes,
        }
    }

    /// Metric name if metric-shaped, for cost-controller series keying
    pub fn metric_name(&self) -> Option<&str> {
        match self {
            Self::Metric(m) => Some(&m.name),
            _ => None,
        }
    }

    pub fn severity(&self) -> Option<u8> {
        self.envelope().severity
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes_mut().insert(key.into(), value.into());
    }

    pub fn get_attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_is_stable() {
        let s = Source::new(DatabaseKind::Postgres, "db1:5432", "orders");
        assert_eq!(s.key(), "postgresql/db1:5432/orders");
    }

    #[test]
    fn test_bool_column_as_metric_value() {
        assert_eq!(ColumnValue::Bool(true).as_numeric(), Some(1.0));
        assert_eq!(ColumnValue::Bool(false).as_numeric(), Some(0.0));
        assert_eq!(ColumnValue::Text("x".into()).as_numeric(), None);
    }

    #[test]
    fn test_bool_column_becomes_int_attribute() {
        assert_eq!(ColumnValue::Bool(true).to_attr(), Some(AttrValue::Int(1)));
        assert_eq!(ColumnValue::Null.to_attr(), None);
    }

    #[test]
    fn test_record_attribute_round_trip() {
        let src = Source::new(DatabaseKind::MySql, "db2:3306", "app");
        let mut rec = Record::gauge(src, "db.connections.active", 42.0);
        rec.set_attribute("state", "active");
        assert_eq!(rec.get_attribute("state").and_then(|v| v.as_str()), Some("active"));
        assert_eq!(rec.metric_name(), Some("db.connections.active"));
    }
}
